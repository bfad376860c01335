use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    aegis_common::{Clock, SystemClock, lock},
    aegis_metrics::{counter, definitions::websocket as m, gauge},
    aegis_protocol::{
        ClientMessage, PROTOCOL_VERSION, ServerMessage, ServerMessageKind, channels, error_codes,
    },
    aegis_ratelimit::Tier,
    serde::Serialize,
    serde_json::{Value, json},
    tokio::{sync::mpsc, task::JoinHandle},
    tracing::{debug, info, warn},
};

use crate::{
    client::{ClientId, ClientInfo, Outbound, WebSocketClient},
    config::WebSocketConfig,
    error::RealtimeError,
};

#[derive(Default)]
struct Registry {
    clients: HashMap<ClientId, WebSocketClient>,
    channels: HashMap<String, HashSet<ClientId>>,
    by_user: HashMap<String, HashSet<ClientId>>,
    /// Frames for channels nobody is subscribed to, flushed on the next
    /// subscribe. Only `user:{id}` channels queue.
    queues: HashMap<String, PendingQueue>,
}

#[derive(Default)]
struct PendingQueue {
    frames: VecDeque<String>,
    /// Epoch ms of the last enqueue.
    updated_at: u64,
}

impl Registry {
    /// Drop a client and every index entry pointing at it.
    fn remove(&mut self, client_id: &str) -> Option<WebSocketClient> {
        let client = self.clients.remove(client_id)?;
        for channel in &client.subscriptions {
            if let Some(members) = self.channels.get_mut(channel) {
                members.remove(client_id);
                if members.is_empty() {
                    self.channels.remove(channel);
                }
            }
        }
        if let Some(user_id) = &client.user_id
            && let Some(sockets) = self.by_user.get_mut(user_id)
        {
            sockets.remove(client_id);
            if sockets.is_empty() {
                self.by_user.remove(user_id);
            }
        }
        Some(client)
    }

    fn remove_all(&mut self, ids: &[ClientId], reason: &'static str) {
        for id in ids {
            if self.remove(id).is_some() {
                debug!(client_id = %id, reason, "dropped websocket client");
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeStats {
    pub connections: usize,
    pub authenticated: usize,
    pub max_connections: usize,
    /// Subscriber count per channel.
    pub channels: BTreeMap<String, usize>,
    pub queued_messages: usize,
    pub messages_sent: u64,
    pub heartbeat_evictions: u64,
}

/// Connection registry with channel pub/sub, heartbeat liveness and
/// queueing for absent users.
pub struct WebSocketManager {
    registry: Mutex<Registry>,
    config: WebSocketConfig,
    clock: Arc<dyn Clock>,
    messages_sent: AtomicU64,
    heartbeat_evictions: AtomicU64,
}

impl Default for WebSocketManager {
    fn default() -> Self {
        Self::new(WebSocketConfig::default())
    }
}

impl WebSocketManager {
    pub fn new(config: WebSocketConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    pub fn with_clock(config: WebSocketConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            config,
            clock,
            messages_sent: AtomicU64::new(0),
            heartbeat_evictions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock(&self.registry)
    }

    fn frame(&self, kind: ServerMessageKind, channel: Option<&str>, data: Value) -> Option<String> {
        let msg = ServerMessage::new(
            kind,
            channel.map(str::to_string),
            data,
            self.clock.now_ms(),
        );
        match msg.to_json() {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(error = %e, "failed to serialize server frame");
                None
            },
        }
    }

    fn error_frame(&self, code: &str, message: impl Into<String>) -> Option<String> {
        ServerMessage::error(code, message, self.clock.now_ms())
            .to_json()
            .ok()
    }

    /// Push one frame to one client; a failed push removes the client.
    fn deliver(&self, reg: &mut Registry, client_id: &str, frame: String) -> bool {
        let Some(client) = reg.clients.get(client_id) else {
            return false;
        };
        if client.push(Outbound::Text(frame)) {
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
            counter!(m::MESSAGES_SENT_TOTAL).increment(1);
            true
        } else {
            reg.remove_all(&[client_id.to_string()], "send failed");
            self.update_gauge(reg);
            false
        }
    }

    fn update_gauge(&self, reg: &Registry) {
        gauge!(m::CONNECTIONS).set(reg.clients.len() as f64);
    }

    // ── Admission ───────────────────────────────────────────────────────────

    /// Decide whether an upgrade may proceed. Called before the handshake
    /// so a refused client never gets a socket.
    pub fn admit(&self, origin: Option<&str>) -> Result<(), RealtimeError> {
        let reg = self.registry();
        self.admit_locked(&reg, origin)
    }

    fn admit_locked(&self, reg: &Registry, origin: Option<&str>) -> Result<(), RealtimeError> {
        if !self.config.origin_allowed(origin) {
            counter!(m::REJECTED_TOTAL, "reason" => "origin").increment(1);
            return Err(RealtimeError::OriginNotAllowed {
                origin: origin.unwrap_or_default().to_string(),
            });
        }
        if reg.clients.len() >= self.config.max_connections {
            counter!(m::REJECTED_TOTAL, "reason" => "capacity").increment(1);
            return Err(RealtimeError::AtCapacity {
                max: self.config.max_connections,
            });
        }
        Ok(())
    }

    /// Register a new client and queue its `connected` frame. The returned
    /// receiver is the client's outbound stream.
    pub fn connect(
        &self,
        origin: Option<String>,
        remote_addr: Option<SocketAddr>,
    ) -> Result<(ClientId, mpsc::Receiver<Outbound>), RealtimeError> {
        let (tx, rx) = mpsc::channel(self.config.send_buffer.max(1));
        let id = uuid::Uuid::new_v4().to_string();
        let now = self.clock.now_ms();

        let mut reg = self.registry();
        self.admit_locked(&reg, origin.as_deref())?;
        reg.clients.insert(id.clone(), WebSocketClient {
            id: id.clone(),
            subscriptions: BTreeSet::new(),
            user_id: None,
            user_tier: None,
            last_ping: now,
            connected_at: now,
            remote_addr,
            origin,
            sender: tx,
        });
        self.update_gauge(&reg);
        if let Some(frame) = self.frame(
            ServerMessageKind::Connected,
            None,
            json!({
                "clientId": id,
                "protocol": PROTOCOL_VERSION,
                "heartbeatIntervalMs": self.config.heartbeat_interval_ms,
            }),
        ) {
            self.deliver(&mut reg, &id, frame);
        }
        info!(
            client_id = %id,
            remote = ?remote_addr,
            clients = reg.clients.len(),
            "websocket client connected"
        );
        Ok((id, rx))
    }

    /// Attach an identity to a connected client.
    pub fn authenticate(
        &self,
        client_id: &str,
        user_id: impl Into<String>,
        tier: Tier,
    ) -> Result<(), RealtimeError> {
        let user_id = user_id.into();
        let mut reg = self.registry();
        let client = reg
            .clients
            .get_mut(client_id)
            .ok_or_else(|| RealtimeError::UnknownClient(client_id.to_string()))?;
        let previous = client.user_id.replace(user_id.clone());
        client.user_tier = Some(tier);

        if let Some(prev) = previous
            && prev != user_id
            && let Some(sockets) = reg.by_user.get_mut(&prev)
        {
            sockets.remove(client_id);
            if sockets.is_empty() {
                reg.by_user.remove(&prev);
            }
        }
        reg.by_user
            .entry(user_id.clone())
            .or_default()
            .insert(client_id.to_string());
        debug!(client_id, user_id = %user_id, %tier, "websocket client authenticated");
        Ok(())
    }

    /// Remove a client from the registry and every channel. Returns whether
    /// it was connected.
    pub fn disconnect(&self, client_id: &str) -> bool {
        let mut reg = self.registry();
        let removed = reg.remove(client_id).is_some();
        if removed {
            self.update_gauge(&reg);
            info!(
                client_id,
                clients = reg.clients.len(),
                "websocket client disconnected"
            );
        }
        removed
    }

    // ── Subscriptions ───────────────────────────────────────────────────────

    fn check_subscription(
        client: &WebSocketClient,
        channel: &str,
        config: &WebSocketConfig,
    ) -> Result<(), RealtimeError> {
        let tier = client.tier();
        if channels::is_restricted(channel) && tier != Tier::Enterprise {
            return Err(RealtimeError::SubscriptionDenied {
                channel: channel.to_string(),
                tier,
            });
        }
        if let Some(owner) = channel.strip_prefix(channels::USER_PREFIX)
            && client.user_id.as_deref() != Some(owner)
        {
            return Err(RealtimeError::SubscriptionDenied {
                channel: channel.to_string(),
                tier,
            });
        }
        if let Some(limit) = config.subscription_limits.for_tier(tier)
            && client.subscriptions.len() >= limit
        {
            return Err(RealtimeError::SubscriptionLimit { limit, tier });
        }
        Ok(())
    }

    /// Subscribe a client to a channel, then flush anything queued there.
    /// Subscribing twice is a no-op that still acknowledges.
    pub fn subscribe(&self, client_id: &str, channel: &str) -> Result<(), RealtimeError> {
        let mut reg = self.registry();
        let client = reg
            .clients
            .get_mut(client_id)
            .ok_or_else(|| RealtimeError::UnknownClient(client_id.to_string()))?;

        if !client.subscriptions.contains(channel) {
            Self::check_subscription(client, channel, &self.config)?;
            client.subscriptions.insert(channel.to_string());
            reg.channels
                .entry(channel.to_string())
                .or_default()
                .insert(client_id.to_string());
            debug!(client_id, channel, "subscribed");
        }

        if let Some(frame) = self.frame(ServerMessageKind::Subscribed, Some(channel), Value::Null)
            && !self.deliver(&mut reg, client_id, frame)
        {
            return Ok(());
        }

        if let Some(queued) = reg.queues.remove(channel) {
            debug!(client_id, channel, count = queued.frames.len(), "flushing queued messages");
            for frame in queued.frames {
                if !self.deliver(&mut reg, client_id, frame) {
                    break;
                }
            }
        }
        Ok(())
    }

    pub fn unsubscribe(&self, client_id: &str, channel: &str) -> Result<(), RealtimeError> {
        let mut reg = self.registry();
        let client = reg
            .clients
            .get_mut(client_id)
            .ok_or_else(|| RealtimeError::UnknownClient(client_id.to_string()))?;
        if !client.subscriptions.remove(channel) {
            return Err(RealtimeError::NotSubscribed(channel.to_string()));
        }
        if let Some(members) = reg.channels.get_mut(channel) {
            members.remove(client_id);
            if members.is_empty() {
                reg.channels.remove(channel);
            }
        }
        debug!(client_id, channel, "unsubscribed");
        if let Some(frame) =
            self.frame(ServerMessageKind::Unsubscribed, Some(channel), Value::Null)
        {
            self.deliver(&mut reg, client_id, frame);
        }
        Ok(())
    }

    // ── Publishing ──────────────────────────────────────────────────────────

    /// Fan a data frame out to every subscriber of `channel` except
    /// `exclude`. Subscribers whose queue is closed or full are dropped.
    /// Returns the number of clients reached.
    pub fn broadcast(&self, channel: &str, data: Value, exclude: Option<&str>) -> usize {
        let Some(frame) = self.frame(ServerMessageKind::Data, Some(channel), data) else {
            return 0;
        };
        let mut reg = self.registry();
        let Some(members) = reg.channels.get(channel) else {
            return 0;
        };
        let targets: Vec<ClientId> = members
            .iter()
            .filter(|id| Some(id.as_str()) != exclude)
            .cloned()
            .collect();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for id in targets {
            match reg.clients.get(&id) {
                Some(client) if client.push(Outbound::Text(frame.clone())) => delivered += 1,
                _ => failed.push(id),
            }
        }
        if !failed.is_empty() {
            reg.remove_all(&failed, "send failed");
            self.update_gauge(&reg);
        }
        self.messages_sent.fetch_add(delivered as u64, Ordering::Relaxed);
        counter!(m::MESSAGES_SENT_TOTAL).increment(delivered as u64);
        debug!(channel, delivered, dropped = failed.len(), "broadcast");
        delivered
    }

    /// Deliver to every socket the user has open, on their `user:{id}`
    /// channel. With no live socket the frame is queued there, oldest
    /// dropped first once the queue is full. Returns sockets reached.
    pub fn send_to_user(&self, user_id: &str, data: Value) -> usize {
        let channel = channels::user(user_id);
        let Some(frame) = self.frame(ServerMessageKind::Data, Some(&channel), data) else {
            return 0;
        };
        let mut reg = self.registry();
        let sockets: Vec<ClientId> = reg
            .by_user
            .get(user_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for id in &sockets {
            if self.deliver(&mut reg, id, frame.clone()) {
                delivered += 1;
            }
        }
        if delivered == 0 {
            let max = self.config.max_queued_per_channel;
            if max == 0 {
                return 0;
            }
            if !reg.queues.contains_key(&channel)
                && reg.queues.len() >= self.config.max_queued_channels.max(1)
                && let Some(stalest) = reg
                    .queues
                    .iter()
                    .min_by_key(|(_, q)| q.updated_at)
                    .map(|(name, _)| name.clone())
            {
                reg.queues.remove(&stalest);
                debug!(channel = %stalest, "offline queue evicted to make room");
            }
            let queue = reg.queues.entry(channel).or_default();
            if queue.frames.len() >= max {
                queue.frames.pop_front();
            }
            queue.frames.push_back(frame);
            queue.updated_at = self.clock.now_ms();
            debug!(user_id, queued = queue.frames.len(), "user offline, message queued");
        }
        delivered
    }

    // ── Inbound frames ──────────────────────────────────────────────────────

    /// Refresh a client's liveness timestamp.
    pub fn record_pong(&self, client_id: &str) -> bool {
        let now = self.clock.now_ms();
        let mut reg = self.registry();
        match reg.clients.get_mut(client_id) {
            Some(client) => {
                client.last_ping = now;
                true
            },
            None => false,
        }
    }

    /// Apply one text frame from a client. Bad input earns the sender an
    /// error frame and is otherwise ignored.
    pub fn handle_client_message(
        &self,
        client_id: &str,
        text: &str,
    ) -> Result<(), RealtimeError> {
        let msg = match ClientMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(client_id, error = %e, "invalid client frame");
                self.reply_error(client_id, error_codes::INVALID_MESSAGE, e.to_string())?;
                return Ok(());
            },
        };
        let result = match msg {
            ClientMessage::Subscribe { channel } => self.subscribe(client_id, &channel),
            ClientMessage::Unsubscribe { channel } => self.unsubscribe(client_id, &channel),
            ClientMessage::Ping { channel } => {
                if !self.record_pong(client_id) {
                    return Err(RealtimeError::UnknownClient(client_id.to_string()));
                }
                if let Some(frame) =
                    self.frame(ServerMessageKind::Pong, channel.as_deref(), Value::Null)
                {
                    let mut reg = self.registry();
                    self.deliver(&mut reg, client_id, frame);
                }
                Ok(())
            },
        };
        match result {
            Err(RealtimeError::UnknownClient(id)) => Err(RealtimeError::UnknownClient(id)),
            Err(e) => self.reply_error(client_id, e.code(), e.to_string()),
            Ok(()) => Ok(()),
        }
    }

    fn reply_error(
        &self,
        client_id: &str,
        code: &str,
        message: String,
    ) -> Result<(), RealtimeError> {
        let mut reg = self.registry();
        if !reg.clients.contains_key(client_id) {
            return Err(RealtimeError::UnknownClient(client_id.to_string()));
        }
        if let Some(frame) = self.error_frame(code, message) {
            self.deliver(&mut reg, client_id, frame);
        }
        Ok(())
    }

    // ── Heartbeat ───────────────────────────────────────────────────────────

    /// Drop clients silent for longer than the heartbeat timeout and probe
    /// the rest. Offline queues past their ttl go too. Returns the evicted
    /// client ids.
    pub fn heartbeat_sweep(&self) -> Vec<ClientId> {
        let now = self.clock.now_ms();
        let probe = self.frame(ServerMessageKind::Ping, None, Value::Null);
        let mut reg = self.registry();

        let mut evicted = Vec::new();
        let mut failed = Vec::new();
        for (id, client) in &reg.clients {
            if now.saturating_sub(client.last_ping) > self.config.heartbeat_timeout_ms {
                evicted.push(id.clone());
            } else if let Some(probe) = &probe
                && !client.push(Outbound::Ping(probe.clone()))
            {
                failed.push(id.clone());
            }
        }
        reg.remove_all(&evicted, "heartbeat timeout");
        reg.remove_all(&failed, "send failed");

        let queues = reg.queues.len();
        let ttl = self.config.queue_ttl_ms;
        reg.queues
            .retain(|_, queue| now.saturating_sub(queue.updated_at) <= ttl);
        let expired = queues - reg.queues.len();
        if expired > 0 {
            debug!(expired, "dropped stale offline queues");
        }
        if !evicted.is_empty() || !failed.is_empty() {
            self.update_gauge(&reg);
        }
        if !evicted.is_empty() {
            self.heartbeat_evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            counter!(m::HEARTBEAT_EVICTIONS_TOTAL).increment(evicted.len() as u64);
            info!(evicted = evicted.len(), "evicted unresponsive websocket clients");
        }
        evicted
    }

    /// Run [`heartbeat_sweep`](Self::heartbeat_sweep) every heartbeat
    /// interval until the manager is dropped.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let every = Duration::from_millis(self.config.heartbeat_interval_ms.max(1));
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.heartbeat_sweep();
            }
        })
    }

    // ── Introspection ───────────────────────────────────────────────────────

    pub fn client_count(&self) -> usize {
        self.registry().clients.len()
    }

    pub fn client(&self, client_id: &str) -> Option<ClientInfo> {
        self.registry().clients.get(client_id).map(WebSocketClient::info)
    }

    pub fn subscribers(&self, channel: &str) -> Vec<ClientId> {
        let mut ids: Vec<_> = self
            .registry()
            .channels
            .get(channel)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn queued(&self, channel: &str) -> usize {
        self.registry()
            .queues
            .get(channel)
            .map_or(0, |queue| queue.frames.len())
    }

    pub fn get_stats(&self) -> RealtimeStats {
        let reg = self.registry();
        RealtimeStats {
            connections: reg.clients.len(),
            authenticated: reg.clients.values().filter(|c| c.user_id.is_some()).count(),
            max_connections: self.config.max_connections,
            channels: reg
                .channels
                .iter()
                .map(|(name, members)| (name.clone(), members.len()))
                .collect(),
            queued_messages: reg.queues.values().map(|queue| queue.frames.len()).sum(),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            heartbeat_evictions: self.heartbeat_evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use aegis_common::ManualClock;

    use {super::*, crate::config::SubscriptionLimits};

    fn manager(config: WebSocketConfig) -> (WebSocketManager, Arc<ManualClock>) {
        let clock = ManualClock::new(1_000_000);
        (WebSocketManager::with_clock(config, clock.clone()), clock)
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerMessage> {
        let mut frames = Vec::new();
        while let Ok(out) = rx.try_recv() {
            let (Outbound::Text(text) | Outbound::Ping(text)) = out;
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    fn kinds(frames: &[ServerMessage]) -> Vec<ServerMessageKind> {
        frames.iter().map(|f| f.kind).collect()
    }

    #[test]
    fn connect_sends_connected_frame() {
        let (ws, _) = manager(WebSocketConfig::default());
        let (id, mut rx) = ws.connect(None, None).unwrap();
        let frames = drain(&mut rx);
        assert_eq!(kinds(&frames), vec![ServerMessageKind::Connected]);
        assert_eq!(frames[0].data["clientId"], id.as_str());
        assert_eq!(ws.client_count(), 1);
    }

    #[test]
    fn fan_out_with_exclusion() {
        let (ws, _) = manager(WebSocketConfig::default());
        let mut clients = Vec::new();
        for _ in 0..3 {
            let (id, mut rx) = ws.connect(None, None).unwrap();
            ws.subscribe(&id, "skills").unwrap();
            drain(&mut rx);
            clients.push((id, rx));
        }

        let sender = clients[0].0.clone();
        let reached = ws.broadcast("skills", json!({"skill": "summarize"}), Some(&sender));
        assert_eq!(reached, 2);

        assert!(drain(&mut clients[0].1).is_empty());
        for (_, rx) in clients.iter_mut().skip(1) {
            let frames = drain(rx);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].kind, ServerMessageKind::Data);
            assert_eq!(frames[0].channel.as_deref(), Some("skills"));
            assert_eq!(frames[0].data["skill"], "summarize");
        }
    }

    #[test]
    fn broadcast_without_subscribers_is_dropped() {
        let (ws, _) = manager(WebSocketConfig::default());
        assert_eq!(ws.broadcast("nobody", json!(1), None), 0);
        assert_eq!(ws.queued("nobody"), 0);
    }

    #[test]
    fn heartbeat_evicts_silent_clients() {
        let (ws, clock) = manager(WebSocketConfig::default());
        let (quiet, _quiet_rx) = ws.connect(None, None).unwrap();
        let (chatty, mut chatty_rx) = ws.connect(None, None).unwrap();
        ws.subscribe(&quiet, "stats").unwrap();
        ws.subscribe(&chatty, "stats").unwrap();

        clock.advance(Duration::from_millis(45_000));
        ws.handle_client_message(&chatty, r#"{"type":"ping"}"#).unwrap();
        clock.advance(Duration::from_millis(20_000));

        let evicted = ws.heartbeat_sweep();
        assert_eq!(evicted, vec![quiet.clone()]);
        assert!(ws.client(&quiet).is_none());
        assert_eq!(ws.subscribers("stats"), vec![chatty.clone()]);
        assert_eq!(ws.get_stats().heartbeat_evictions, 1);

        let frames = drain(&mut chatty_rx);
        assert!(kinds(&frames).contains(&ServerMessageKind::Pong));
        assert_eq!(frames.last().map(|f| f.kind), Some(ServerMessageKind::Ping));
    }

    #[test]
    fn record_pong_keeps_client_alive() {
        let (ws, clock) = manager(WebSocketConfig::default());
        let (id, _rx) = ws.connect(None, None).unwrap();
        clock.advance(Duration::from_millis(59_000));
        assert!(ws.record_pong(&id));
        clock.advance(Duration::from_millis(59_000));
        assert!(ws.heartbeat_sweep().is_empty());
    }

    #[test]
    fn tier_subscription_caps() {
        let (ws, _) = manager(WebSocketConfig::default());
        let (id, mut rx) = ws.connect(None, None).unwrap();
        for ch in ["a", "b", "c"] {
            ws.subscribe(&id, ch).unwrap();
        }
        assert_eq!(
            ws.subscribe(&id, "d"),
            Err(RealtimeError::SubscriptionLimit {
                limit: 3,
                tier: Tier::Free
            })
        );
        // Re-subscribing to a held channel does not count against the cap.
        assert!(ws.subscribe(&id, "a").is_ok());

        ws.authenticate(&id, "u1", Tier::Pro).unwrap();
        assert!(ws.subscribe(&id, "d").is_ok());
        drain(&mut rx);
    }

    #[test]
    fn restricted_channels_need_enterprise() {
        let (ws, _) = manager(WebSocketConfig::default());
        let (id, _rx) = ws.connect(None, None).unwrap();
        ws.authenticate(&id, "u1", Tier::Business).unwrap();
        assert!(matches!(
            ws.subscribe(&id, "admin"),
            Err(RealtimeError::SubscriptionDenied { .. })
        ));
        assert!(ws.subscribe(&id, "system:alerts").is_err());

        ws.authenticate(&id, "u1", Tier::Enterprise).unwrap();
        assert!(ws.subscribe(&id, "admin").is_ok());
        assert!(ws.subscribe(&id, "system:alerts").is_ok());
    }

    #[test]
    fn user_channels_are_private() {
        let (ws, _) = manager(WebSocketConfig::default());
        let (id, _rx) = ws.connect(None, None).unwrap();
        assert!(ws.subscribe(&id, "user:u1").is_err());
        ws.authenticate(&id, "u2", Tier::Enterprise).unwrap();
        assert!(ws.subscribe(&id, "user:u1").is_err());
        assert!(ws.subscribe(&id, "user:u2").is_ok());
    }

    #[test]
    fn unlimited_enterprise() {
        let config = WebSocketConfig {
            subscription_limits: SubscriptionLimits {
                free: Some(0),
                ..Default::default()
            },
            ..Default::default()
        };
        let (ws, _) = manager(config);
        let (id, _rx) = ws.connect(None, None).unwrap();
        assert!(ws.subscribe(&id, "a").is_err());
        ws.authenticate(&id, "u1", Tier::Enterprise).unwrap();
        for i in 0..200 {
            ws.subscribe(&id, &format!("ch{i}")).unwrap();
        }
    }

    #[test]
    fn stale_offline_queues_are_swept() {
        let (ws, clock) = manager(WebSocketConfig {
            queue_ttl_ms: 10_000,
            heartbeat_timeout_ms: 60_000,
            ..Default::default()
        });
        ws.send_to_user("gone", json!(1));
        clock.advance(Duration::from_millis(6_000));
        ws.send_to_user("back-soon", json!(2));
        clock.advance(Duration::from_millis(5_000));

        ws.heartbeat_sweep();
        assert_eq!(ws.queued("user:gone"), 0);
        assert_eq!(ws.queued("user:back-soon"), 1);
        assert_eq!(ws.get_stats().queued_messages, 1);
    }

    #[test]
    fn offline_queue_count_is_capped() {
        let (ws, clock) = manager(WebSocketConfig {
            max_queued_channels: 2,
            ..Default::default()
        });
        ws.send_to_user("a", json!(1));
        clock.advance(Duration::from_millis(1));
        ws.send_to_user("b", json!(1));
        clock.advance(Duration::from_millis(1));
        ws.send_to_user("a", json!(2));
        clock.advance(Duration::from_millis(1));
        ws.send_to_user("c", json!(1));

        assert_eq!(ws.queued("user:a"), 2);
        assert_eq!(ws.queued("user:b"), 0);
        assert_eq!(ws.queued("user:c"), 1);
    }

    #[test]
    fn queued_messages_flush_on_subscribe() {
        let (ws, _) = manager(WebSocketConfig {
            max_queued_per_channel: 2,
            ..Default::default()
        });
        assert_eq!(ws.send_to_user("u1", json!({"n": 1})), 0);
        ws.send_to_user("u1", json!({"n": 2}));
        ws.send_to_user("u1", json!({"n": 3}));
        assert_eq!(ws.queued("user:u1"), 2);

        let (id, mut rx) = ws.connect(None, None).unwrap();
        ws.authenticate(&id, "u1", Tier::Free).unwrap();
        ws.subscribe(&id, "user:u1").unwrap();
        assert_eq!(ws.queued("user:u1"), 0);

        let frames = drain(&mut rx);
        assert_eq!(kinds(&frames), vec![
            ServerMessageKind::Connected,
            ServerMessageKind::Subscribed,
            ServerMessageKind::Data,
            ServerMessageKind::Data,
        ]);
        assert_eq!(frames[2].data["n"], 2);
        assert_eq!(frames[3].data["n"], 3);
    }

    #[test]
    fn send_to_user_reaches_every_socket() {
        let (ws, _) = manager(WebSocketConfig::default());
        let (a, mut rx_a) = ws.connect(None, None).unwrap();
        let (b, mut rx_b) = ws.connect(None, None).unwrap();
        ws.authenticate(&a, "u1", Tier::Pro).unwrap();
        ws.authenticate(&b, "u1", Tier::Pro).unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        assert_eq!(ws.send_to_user("u1", json!("hi")), 2);
        assert_eq!(drain(&mut rx_a)[0].channel.as_deref(), Some("user:u1"));
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert_eq!(ws.queued("user:u1"), 0);
    }

    #[test]
    fn closed_receiver_counts_as_disconnect() {
        let (ws, _) = manager(WebSocketConfig::default());
        let (gone, gone_rx) = ws.connect(None, None).unwrap();
        let (alive, _alive_rx) = ws.connect(None, None).unwrap();
        ws.subscribe(&gone, "stats").unwrap();
        ws.subscribe(&alive, "stats").unwrap();
        drop(gone_rx);

        assert_eq!(ws.broadcast("stats", json!({}), None), 1);
        assert!(ws.client(&gone).is_none());
        assert_eq!(ws.subscribers("stats"), vec![alive]);
    }

    #[test]
    fn slow_consumer_is_dropped() {
        let (ws, _) = manager(WebSocketConfig {
            send_buffer: 2,
            ..Default::default()
        });
        // Connected and subscribed frames fill the buffer.
        let (id, _rx) = ws.connect(None, None).unwrap();
        ws.subscribe(&id, "stats").unwrap();
        assert_eq!(ws.broadcast("stats", json!(1), None), 0);
        assert_eq!(ws.client_count(), 0);
    }

    #[test]
    fn disconnect_removes_from_all_channels() {
        let (ws, _) = manager(WebSocketConfig::default());
        let (id, _rx) = ws.connect(None, None).unwrap();
        ws.authenticate(&id, "u1", Tier::Pro).unwrap();
        for ch in ["a", "b", "user:u1"] {
            ws.subscribe(&id, ch).unwrap();
        }
        assert!(ws.disconnect(&id));
        assert!(!ws.disconnect(&id));
        let stats = ws.get_stats();
        assert!(stats.channels.is_empty());
        assert_eq!(stats.connections, 0);
        assert_eq!(ws.send_to_user("u1", json!(1)), 0);
    }

    #[test]
    fn unsubscribe_prunes_empty_channels() {
        let (ws, _) = manager(WebSocketConfig::default());
        let (id, _rx) = ws.connect(None, None).unwrap();
        ws.subscribe(&id, "a").unwrap();
        ws.unsubscribe(&id, "a").unwrap();
        assert!(ws.get_stats().channels.is_empty());
        assert_eq!(
            ws.unsubscribe(&id, "a"),
            Err(RealtimeError::NotSubscribed("a".into()))
        );
    }

    #[test]
    fn admission_checks() {
        let (ws, _) = manager(WebSocketConfig {
            max_connections: 1,
            allowed_origins: vec!["https://app.example.com".into()],
            ..Default::default()
        });
        assert!(matches!(
            ws.admit(Some("https://evil.example")),
            Err(RealtimeError::OriginNotAllowed { .. })
        ));
        assert!(ws.admit(None).is_ok());
        let _client = ws.connect(Some("https://app.example.com".into()), None).unwrap();
        assert_eq!(
            ws.connect(None, None).map(|(id, _)| id),
            Err(RealtimeError::AtCapacity { max: 1 })
        );
    }

    #[test]
    fn malformed_frames_get_error_replies() {
        let (ws, _) = manager(WebSocketConfig::default());
        let (id, mut rx) = ws.connect(None, None).unwrap();
        let (other, mut other_rx) = ws.connect(None, None).unwrap();
        drain(&mut rx);
        drain(&mut other_rx);

        ws.handle_client_message(&id, "not json").unwrap();
        ws.handle_client_message(&id, r#"{"type":"subscribe","channel":"admin"}"#)
            .unwrap();
        ws.handle_client_message(&id, r#"{"type":"unsubscribe","channel":"x"}"#)
            .unwrap();

        let frames = drain(&mut rx);
        let codes: Vec<_> = frames.iter().map(|f| f.data["code"].clone()).collect();
        assert_eq!(codes, vec![
            json!(error_codes::INVALID_MESSAGE),
            json!(error_codes::SUBSCRIPTION_DENIED),
            json!(error_codes::NOT_SUBSCRIBED),
        ]);
        assert!(drain(&mut other_rx).is_empty());
        assert!(ws.client(&other).is_some());

        assert_eq!(
            ws.handle_client_message("ghost", r#"{"type":"ping"}"#),
            Err(RealtimeError::UnknownClient("ghost".into()))
        );
    }
}

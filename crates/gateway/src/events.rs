use {
    aegis_protocol::channels,
    aegis_ratelimit::Identity,
    aegis_realtime::WebSocketManager,
    serde::Deserialize,
    serde_json::{Value, json},
    tracing::debug,
};

/// State changes the rest of the gateway announces to live clients.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// A skill run finished. The full result goes to the owning user's
    /// sockets (or their queue); the shared `skills` channel only sees a
    /// summary without the owner or the output.
    SkillExecutionCompleted {
        user_id: String,
        skill_id: String,
        execution_id: String,
        status: String,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        output: Value,
    },
    /// Message relayed into a channel, optionally skipping the sender.
    ChannelMessage {
        channel: String,
        data: Value,
        #[serde(default)]
        exclude_client_id: Option<String>,
    },
    StatsRefreshed(Value),
}

pub const SKILLS_CHANNEL: &str = "skills";

impl GatewayEvent {
    /// Anonymous callers may publish nothing. Authenticated users may relay
    /// into open channels; everything else needs an operator.
    pub fn permits(&self, identity: &Identity) -> bool {
        if !identity.authenticated {
            return false;
        }
        match self {
            Self::ChannelMessage { channel, .. }
                if !channels::is_restricted(channel)
                    && !channel.starts_with(channels::USER_PREFIX) =>
            {
                true
            },
            _ => identity.is_operator(),
        }
    }
}

/// Deliver an event through the realtime hub. Returns how many sockets were
/// reached.
pub fn publish(realtime: &WebSocketManager, event: GatewayEvent) -> usize {
    match event {
        GatewayEvent::SkillExecutionCompleted {
            user_id,
            skill_id,
            execution_id,
            status,
            duration_ms,
            output,
        } => {
            let summary = json!({
                "event": "skill.execution.completed",
                "skillId": skill_id,
                "executionId": execution_id,
                "status": status,
                "durationMs": duration_ms,
            });
            let mut full = summary.clone();
            full["userId"] = json!(user_id);
            full["output"] = output;
            let direct = realtime.send_to_user(&user_id, full);
            let shared = realtime.broadcast(SKILLS_CHANNEL, summary, None);
            debug!(user_id = %user_id, execution_id = %execution_id, direct, shared, "published skill completion");
            direct + shared
        },
        GatewayEvent::ChannelMessage {
            channel,
            data,
            exclude_client_id,
        } => realtime.broadcast(&channel, data, exclude_client_id.as_deref()),
        GatewayEvent::StatsRefreshed(stats) => realtime.broadcast(channels::STATS, stats, None),
    }
}

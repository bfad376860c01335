use {aegis_protocol::error_codes, aegis_ratelimit::Tier};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RealtimeError {
    #[error("connection limit of {max} reached")]
    AtCapacity { max: usize },
    #[error("origin {origin} is not allowed")]
    OriginNotAllowed { origin: String },
    #[error("unknown client {0}")]
    UnknownClient(String),
    #[error("{tier} tier may not subscribe to {channel}")]
    SubscriptionDenied { channel: String, tier: Tier },
    #[error("{tier} tier is limited to {limit} subscriptions")]
    SubscriptionLimit { limit: usize, tier: Tier },
    #[error("not subscribed to {0}")]
    NotSubscribed(String),
}

impl RealtimeError {
    /// Code carried in `{type:"error"}` frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AtCapacity { .. } => "AT_CAPACITY",
            Self::OriginNotAllowed { .. } => "ORIGIN_NOT_ALLOWED",
            Self::UnknownClient(_) => error_codes::UNKNOWN_CLIENT,
            Self::SubscriptionDenied { .. } => error_codes::SUBSCRIPTION_DENIED,
            Self::SubscriptionLimit { .. } => error_codes::SUBSCRIPTION_LIMIT,
            Self::NotSubscribed(_) => error_codes::NOT_SUBSCRIBED,
        }
    }

    /// Refusals that happen before the upgrade.
    pub fn is_admission(&self) -> bool {
        matches!(self, Self::AtCapacity { .. } | Self::OriginNotAllowed { .. })
    }
}

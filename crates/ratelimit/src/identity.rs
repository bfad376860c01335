use std::net::IpAddr;

use crate::tier::Tier;

/// Who a request is metered as.
///
/// Authenticated callers are keyed by user id at their own tier. Anyone
/// else becomes a synthetic `FREE` identity keyed by IP address, or by an
/// anonymous token when no address is known.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub key: String,
    pub tier: Tier,
    pub authenticated: bool,
}

impl Identity {
    pub fn user(user_id: impl Into<String>, tier: Tier) -> Self {
        Self {
            key: user_id.into(),
            tier,
            authenticated: true,
        }
    }

    pub fn anonymous(ip: Option<IpAddr>, token: Option<&str>) -> Self {
        let key = match (ip, token) {
            (Some(ip), _) => format!("ip:{ip}"),
            (None, Some(token)) if !token.is_empty() => format!("anon:{token}"),
            _ => "anon:unknown".to_string(),
        };
        Self {
            key,
            tier: Tier::Free,
            authenticated: false,
        }
    }

    /// Authenticated at the `ENTERPRISE` tier.
    pub fn is_operator(&self) -> bool {
        self.authenticated && self.tier == Tier::Enterprise
    }

    /// Resolve from optional request attributes.
    pub fn resolve(user_id: Option<&str>, tier: Option<Tier>, ip: Option<IpAddr>) -> Self {
        match user_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => Self::user(id, tier.unwrap_or_default()),
            None => Self::anonymous(ip, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_callers_are_free_and_keyed_by_ip() {
        let id = Identity::resolve(None, Some(Tier::Enterprise), "10.0.0.1".parse().ok());
        assert_eq!(id.key, "ip:10.0.0.1");
        assert_eq!(id.tier, Tier::Free);
        assert!(!id.authenticated);
    }

    #[test]
    fn anonymous_without_ip_uses_token() {
        assert_eq!(Identity::anonymous(None, Some("abc")).key, "anon:abc");
        assert_eq!(Identity::anonymous(None, None).key, "anon:unknown");
    }

    #[test]
    fn users_keep_their_tier() {
        let id = Identity::resolve(Some("u1"), Some(Tier::Pro), None);
        assert_eq!(id, Identity::user("u1", Tier::Pro));
        assert_eq!(Identity::resolve(Some(" "), None, None).key, "anon:unknown");
    }

    #[test]
    fn operators_are_authenticated_enterprise_users() {
        assert!(Identity::user("ops", Tier::Enterprise).is_operator());
        assert!(!Identity::user("u1", Tier::Business).is_operator());
        let mut spoofed = Identity::anonymous(None, None);
        spoofed.tier = Tier::Enterprise;
        assert!(!spoofed.is_operator());
    }
}

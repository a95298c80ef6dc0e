//! Access control decisions
//!
//! Pure decision logic, independent of where user records are stored.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A user known to the access-control system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub access_level: u8,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Why an access check was denied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    UnknownUser,
    Inactive,
    InsufficientLevel { have: u8, need: u8 },
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenialReason::UnknownUser => write!(f, "User does not exist"),
            DenialReason::Inactive => write!(f, "User is inactive"),
            DenialReason::InsufficientLevel { have, need } => {
                write!(f, "Insufficient access level ({} < {})", have, need)
            }
        }
    }
}

/// Result of an access check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Granted,
    Denied(DenialReason),
}

/// Decide whether `user` may act on `resource` at `required_level`
pub fn check_access(
    user: Option<&UserRecord>,
    resource: &str,
    required_level: u8,
) -> AccessDecision {
    let decision = match user {
        None => AccessDecision::Denied(DenialReason::UnknownUser),
        Some(user) if !user.active => AccessDecision::Denied(DenialReason::Inactive),
        Some(user) if user.access_level < required_level => {
            AccessDecision::Denied(DenialReason::InsufficientLevel {
                have: user.access_level,
                need: required_level,
            })
        }
        Some(_) => AccessDecision::Granted,
    };

    let user_id = user.map(|u| u.user_id.as_str()).unwrap_or("<unknown>");
    match &decision {
        AccessDecision::Granted => debug!(user_id, resource, "Access granted"),
        AccessDecision::Denied(reason) => {
            warn!(user_id, resource, reason = %reason, "Access denied")
        }
    }

    decision
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(level: u8, active: bool) -> UserRecord {
        UserRecord {
            user_id: "operator-1".into(),
            access_level: level,
            active,
        }
    }

    #[test]
    fn test_unknown_user_denied() {
        assert_eq!(
            check_access(None, "DEV001", 1),
            AccessDecision::Denied(DenialReason::UnknownUser)
        );
    }

    #[test]
    fn test_inactive_user_denied() {
        let u = user(5, false);
        assert_eq!(
            check_access(Some(&u), "DEV001", 1),
            AccessDecision::Denied(DenialReason::Inactive)
        );
    }

    #[test]
    fn test_insufficient_level_denied() {
        let u = user(1, true);
        assert_eq!(
            check_access(Some(&u), "DEV001", 2),
            AccessDecision::Denied(DenialReason::InsufficientLevel { have: 1, need: 2 })
        );
    }

    #[test]
    fn test_sufficient_level_granted() {
        let u = user(2, true);
        assert_eq!(check_access(Some(&u), "DEV001", 2), AccessDecision::Granted);
        assert_eq!(check_access(Some(&u), "DEV001", 0), AccessDecision::Granted);
    }

    #[test]
    fn test_user_record_defaults_to_active() {
        let u: UserRecord =
            serde_json::from_str(r#"{"user_id":"admin","access_level":3}"#).unwrap();
        assert!(u.active);
    }
}

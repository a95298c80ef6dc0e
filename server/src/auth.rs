//! Identity resolution for REST-origin requests
//!
//! Tokens are issued and validated by the external auth service; the gateway
//! only maps an already-validated bearer token to the user it represents.

use crate::config::TokenEntry;
use securex_shared::access::UserRecord;
use std::collections::HashMap;

/// Resolves a bearer token to a user
pub trait IdentityValidator: Send + Sync {
    fn validate(&self, token: &str) -> Option<UserRecord>;
}

/// Fixed table of pre-validated tokens from configuration
#[derive(Debug, Default)]
pub struct StaticTokenValidator {
    tokens: HashMap<String, UserRecord>,
}

impl StaticTokenValidator {
    pub fn new(entries: &[TokenEntry]) -> Self {
        let tokens = entries
            .iter()
            .map(|e| (e.token.clone(), e.user.clone()))
            .collect();
        Self { tokens }
    }
}

impl IdentityValidator for StaticTokenValidator {
    fn validate(&self, token: &str) -> Option<UserRecord> {
        self.tokens.get(token).cloned()
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer  abc "), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("abc"), None);
    }

    #[test]
    fn test_static_validator() {
        let validator = StaticTokenValidator::new(&[TokenEntry {
            token: "t-1".into(),
            user: UserRecord {
                user_id: "operator".into(),
                access_level: 2,
                active: true,
            },
        }]);

        assert_eq!(validator.validate("t-1").unwrap().user_id, "operator");
        assert!(validator.validate("t-2").is_none());
    }
}

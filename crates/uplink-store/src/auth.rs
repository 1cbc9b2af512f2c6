//! Auth directory — identifier → token + display-name lookup.
//!
//! Read-mostly; the add/remove paths exist for CLI-driven updates and
//! are never on the hot path. The two failure kinds are distinguished
//! internally but surfaced to peers as one opaque failure so
//! identifiers cannot be probed.

use std::collections::HashMap;
use std::sync::RwLock;

use uplink_core::config::ClientEntry;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unknown identifier: {0}")]
    UnknownIdentifier(String),
    #[error("invalid token for identifier: {0}")]
    InvalidToken(String),
}

pub struct AuthDirectory {
    tokens: RwLock<HashMap<String, ClientEntry>>,
}

impl AuthDirectory {
    pub fn new(tokens: impl IntoIterator<Item = (String, ClientEntry)>) -> Self {
        Self {
            tokens: RwLock::new(tokens.into_iter().collect()),
        }
    }

    /// Succeeds only when the identifier exists and the token matches
    /// exactly.
    pub fn authenticate(&self, identifier: &str, token: &str) -> Result<(), AuthError> {
        let tokens = self.tokens.read().expect("auth lock poisoned");
        let entry = tokens
            .get(identifier)
            .ok_or_else(|| AuthError::UnknownIdentifier(identifier.to_string()))?;
        if entry.token != token {
            return Err(AuthError::InvalidToken(identifier.to_string()));
        }
        Ok(())
    }

    /// Display name for an identifier, empty when unset or unknown.
    pub fn name(&self, identifier: &str) -> String {
        self.tokens
            .read()
            .expect("auth lock poisoned")
            .get(identifier)
            .map(|e| e.name.clone())
            .unwrap_or_default()
    }

    pub fn add(&self, identifier: impl Into<String>, token: impl Into<String>) {
        self.tokens.write().expect("auth lock poisoned").insert(
            identifier.into(),
            ClientEntry {
                token: token.into(),
                name: String::new(),
            },
        );
    }

    pub fn remove(&self, identifier: &str) {
        self.tokens
            .write()
            .expect("auth lock poisoned")
            .remove(identifier);
    }

    pub fn len(&self) -> usize {
        self.tokens.read().expect("auth lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> AuthDirectory {
        AuthDirectory::new([(
            "scooter-1".to_string(),
            ClientEntry {
                token: "secret".to_string(),
                name: "Front Yard".to_string(),
            },
        )])
    }

    #[test]
    fn valid_credentials_pass() {
        assert!(directory().authenticate("scooter-1", "secret").is_ok());
    }

    #[test]
    fn unknown_identifier_is_distinct_from_bad_token() {
        let dir = directory();
        assert!(matches!(
            dir.authenticate("ghost", "secret"),
            Err(AuthError::UnknownIdentifier(_))
        ));
        assert!(matches!(
            dir.authenticate("scooter-1", "wrong"),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn token_match_is_exact() {
        let dir = directory();
        assert!(dir.authenticate("scooter-1", "Secret").is_err());
        assert!(dir.authenticate("scooter-1", "secret ").is_err());
        assert!(dir.authenticate("scooter-1", "").is_err());
    }

    #[test]
    fn name_lookup() {
        let dir = directory();
        assert_eq!(dir.name("scooter-1"), "Front Yard");
        assert_eq!(dir.name("ghost"), "");
    }

    #[test]
    fn add_and_remove() {
        let dir = directory();
        dir.add("scooter-2", "t2");
        assert!(dir.authenticate("scooter-2", "t2").is_ok());
        assert_eq!(dir.name("scooter-2"), "");

        dir.remove("scooter-2");
        assert!(matches!(
            dir.authenticate("scooter-2", "t2"),
            Err(AuthError::UnknownIdentifier(_))
        ));
    }
}

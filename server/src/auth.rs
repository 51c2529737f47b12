//! # Token Verification
//!
//! Authentication is delegated behind [`TokenVerifier`] so a deployment can
//! plug in its identity service. The shipped implementation checks the
//! configured token table and yields that token's plan capabilities.

use crate::config::ServerConfig;
use fxtunnel_protocol::{unix_millis, Capabilities, ErrorCode};

/// What a successful verification grants to the new session.
#[derive(Debug, Clone)]
pub struct AuthGrant {
    /// Stable client id, when the identity service pins one.
    pub client_id: Option<String>,
    pub capabilities: Capabilities,
}

pub trait TokenVerifier: Send + Sync {
    /// Verifies a presented token, returning the grant or the terminal
    /// error code to put in `auth_result`.
    fn verify(&self, token: &str) -> Result<AuthGrant, ErrorCode>;
}

/// Verifier backed by the static `[[tokens]]` table in the config file.
///
/// An empty table accepts any token with default capabilities.
pub struct StaticTokenVerifier {
    entries: Vec<crate::config::TokenEntry>,
}

impl StaticTokenVerifier {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            entries: config.tokens.clone(),
        }
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<AuthGrant, ErrorCode> {
        if token.is_empty() {
            return Err(ErrorCode::AuthFailed);
        }
        if self.entries.is_empty() {
            return Ok(AuthGrant {
                client_id: None,
                capabilities: Capabilities::default(),
            });
        }
        let entry = self
            .entries
            .iter()
            .find(|e| e.token == token)
            .ok_or(ErrorCode::InvalidToken)?;
        if let Some(expires_at) = entry.expires_at {
            if unix_millis() >= expires_at {
                return Err(ErrorCode::TokenExpired);
            }
        }
        Ok(AuthGrant {
            client_id: entry.client_id.clone(),
            capabilities: entry.capabilities.clone().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenEntry;

    fn verifier(entries: Vec<TokenEntry>) -> StaticTokenVerifier {
        StaticTokenVerifier { entries }
    }

    #[test]
    fn unknown_token_is_invalid() {
        let v = verifier(vec![TokenEntry {
            token: "good".into(),
            client_id: None,
            expires_at: None,
            capabilities: None,
        }]);
        assert_eq!(v.verify("bad").unwrap_err(), ErrorCode::InvalidToken);
        assert!(v.verify("good").is_ok());
    }

    #[test]
    fn expired_token_is_refused() {
        let v = verifier(vec![TokenEntry {
            token: "old".into(),
            client_id: None,
            expires_at: Some(1),
            capabilities: None,
        }]);
        assert_eq!(v.verify("old").unwrap_err(), ErrorCode::TokenExpired);
    }

    #[test]
    fn empty_table_accepts_anything_but_blank() {
        let v = verifier(Vec::new());
        assert!(v.verify("whatever").is_ok());
        assert_eq!(v.verify("").unwrap_err(), ErrorCode::AuthFailed);
    }
}

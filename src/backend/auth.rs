//! Connection Authentication
//!
//! Every socket presents a token before the upgrade completes. Verification
//! lives behind a trait so the test harness can mint identities without
//! signing real tokens.

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The authenticated principal behind a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
}

/// Token verification seam.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, String>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// Subject: the user id as issued at login.
    sub: i64,
    exp: usize,
}

/// HMAC-signed JWT verification against the shared login secret.
pub struct JwtVerifier {
    key: DecodingKey,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self { key: DecodingKey::from_secret(secret.as_bytes()) }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Identity, String> {
        let data = decode::<Claims>(token, &self.key, &Validation::default())
            .map_err(|e| format!("Invalid token: {}", e))?;
        debug!("[Auth] Verified token for user {}", data.claims.sub);
        Ok(Identity { user_id: data.claims.sub })
    }
}

/// Accepts tokens of the form `user:<id>`. Test harness only.
#[derive(Default)]
pub struct StaticTokenVerifier;

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<Identity, String> {
        let id = token
            .strip_prefix("user:")
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| "Invalid token".to_string())?;
        Ok(Identity { user_id: id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn mint(secret: &str, sub: i64, exp: usize) -> String {
        let claims = Claims { sub, exp };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn test_jwt_roundtrip() {
        let verifier = JwtVerifier::new("sekrit");
        let token = mint("sekrit", 42, 4_102_444_800); // far future
        assert_eq!(verifier.verify(&token).unwrap(), Identity { user_id: 42 });
    }

    #[test]
    fn test_jwt_wrong_secret_rejected() {
        let verifier = JwtVerifier::new("sekrit");
        let token = mint("other", 42, 4_102_444_800);
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn test_jwt_expired_rejected() {
        let verifier = JwtVerifier::new("sekrit");
        let token = mint("sekrit", 42, 1_000_000);
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn test_static_verifier_parses_id() {
        let verifier = StaticTokenVerifier;
        assert_eq!(verifier.verify("user:7").unwrap().user_id, 7);
        assert!(verifier.verify("garbage").is_err());
    }
}

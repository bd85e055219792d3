use std::sync::Arc;

use axum::http::{HeaderMap, header};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::warn;

use parley_types::api::Claims;
use parley_types::models::Identity;

use crate::error::{HubError, HubResult};

/// Resolves a credential token to an identity.
pub trait TokenVerifier: Send + Sync + 'static {
    fn verify(&self, token: &str) -> HubResult<Identity>;
}

/// HS256 JWT verifier sharing its secret with the account service.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> HubResult<Identity> {
        let token_data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| HubError::Auth(e.to_string()))?;

        let claims = token_data.claims;
        if claims.username.trim().is_empty() {
            return Err(HubError::Auth("token has no username".into()));
        }
        Ok(Identity::new(claims.sub, claims.username))
    }
}

/// Admits connections before any hub state is touched.
#[derive(Clone)]
pub struct ConnectionGate {
    verifier: Arc<dyn TokenVerifier>,
}

impl ConnectionGate {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { verifier }
    }

    pub fn admit(&self, token: Option<&str>) -> HubResult<Identity> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| HubError::Auth("missing token".into()))?;

        self.verifier.verify(token).inspect_err(|e| {
            warn!("Gateway connection refused: {}", e);
        })
    }
}

/// Token from an `Authorization: Bearer ...` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use uuid::Uuid;

    const SECRET: &str = "test-secret";

    fn token(secret: &str, username: &str, exp_offset_secs: i64) -> String {
        let claims = Claims {
            sub: Uuid::from_u128(42),
            username: username.to_string(),
            exp: (chrono::Utc::now().timestamp() + exp_offset_secs) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn gate() -> ConnectionGate {
        ConnectionGate::new(Arc::new(JwtVerifier::new(SECRET)))
    }

    #[test]
    fn test_valid_token_admitted() {
        let identity = gate().admit(Some(&token(SECRET, "alice", 3600))).unwrap();
        assert_eq!(identity, Identity::new(Uuid::from_u128(42), "alice"));
    }

    #[test]
    fn test_bad_tokens_refused() {
        let gate = gate();
        assert!(matches!(gate.admit(None), Err(HubError::Auth(_))));
        assert!(matches!(gate.admit(Some("  ")), Err(HubError::Auth(_))));
        assert!(matches!(gate.admit(Some("not-a-jwt")), Err(HubError::Auth(_))));
        assert!(matches!(
            gate.admit(Some(&token("other-secret", "alice", 3600))),
            Err(HubError::Auth(_))
        ));
        assert!(matches!(
            gate.admit(Some(&token(SECRET, "alice", -3600))),
            Err(HubError::Auth(_))
        ));
        assert!(matches!(
            gate.admit(Some(&token(SECRET, "", 3600))),
            Err(HubError::Auth(_))
        ));
    }

    #[test]
    fn test_bearer_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }
}

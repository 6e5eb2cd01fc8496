use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;

/// Claims carried by a modification token.
///
/// The token binds an order id to a requester (customer session or guest
/// token). It is verified on every request and never stored.
#[derive(Debug, Serialize, Deserialize)]
pub struct ModificationClaims {
    /// Requester identity (customer id or guest token id).
    pub sub: String,
    /// Order the token grants modification access to.
    pub order_id: String,
    pub iat: i64,
    pub exp: i64,
}

/// Verifies modification tokens (HS256).
#[derive(Clone)]
pub struct TokenVerifier {
    secret: String,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        // order_id binding is checked explicitly, not via aud/iss
        validation.required_spec_claims.insert("exp".to_string());
        Self {
            secret: secret.into(),
            validation,
        }
    }

    /// Validates signature and expiry, then checks the token's bound
    /// order id against the requested order.
    pub fn verify(
        &self,
        token: &str,
        requested_order_id: Uuid,
    ) -> Result<ModificationClaims, ServiceError> {
        let claims = decode::<ModificationClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &self.validation,
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => ServiceError::TokenExpired,
            _ => ServiceError::TokenInvalid,
        })?
        .claims;

        let bound_order_id =
            Uuid::parse_str(&claims.order_id).map_err(|_| ServiceError::TokenInvalid)?;
        if bound_order_id != requested_order_id {
            return Err(ServiceError::TokenMismatch {
                requested_order_id,
            });
        }

        Ok(claims)
    }
}

/// Issues a modification token for an order. Used by the checkout
/// collaborator and by tests.
pub fn issue_token(
    secret: &str,
    subject: &str,
    order_id: Uuid,
    ttl: chrono::Duration,
) -> Result<String, ServiceError> {
    let now = Utc::now();
    let claims = ModificationClaims {
        sub: subject.to_string(),
        order_id: order_id.to_string(),
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ServiceError::InternalError(format!("failed to sign token: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const SECRET: &str = "test_secret_key_for_modification_tokens";

    #[test]
    fn test_valid_token_round_trip() {
        let order_id = Uuid::new_v4();
        let token =
            issue_token(SECRET, "cus_123", order_id, chrono::Duration::minutes(30)).unwrap();

        let claims = TokenVerifier::new(SECRET).verify(&token, order_id).unwrap();
        assert_eq!(claims.sub, "cus_123");
        assert_eq!(claims.order_id, order_id.to_string());
    }

    #[test]
    fn test_expired_token() {
        let order_id = Uuid::new_v4();
        let token =
            issue_token(SECRET, "cus_123", order_id, chrono::Duration::minutes(-5)).unwrap();

        let err = TokenVerifier::new(SECRET)
            .verify(&token, order_id)
            .unwrap_err();
        assert_matches!(err, ServiceError::TokenExpired);
    }

    #[test]
    fn test_wrong_signature() {
        let order_id = Uuid::new_v4();
        let token =
            issue_token("other_secret_entirely", "cus_123", order_id, chrono::Duration::minutes(5))
                .unwrap();

        let err = TokenVerifier::new(SECRET)
            .verify(&token, order_id)
            .unwrap_err();
        assert_matches!(err, ServiceError::TokenInvalid);
    }

    #[test]
    fn test_order_mismatch() {
        let bound = Uuid::new_v4();
        let requested = Uuid::new_v4();
        let token = issue_token(SECRET, "cus_123", bound, chrono::Duration::minutes(5)).unwrap();

        let err = TokenVerifier::new(SECRET)
            .verify(&token, requested)
            .unwrap_err();
        assert_matches!(err, ServiceError::TokenMismatch { requested_order_id } if requested_order_id == requested);
    }
}

//! Boundary with the device authentication service.
//!
//! Tokens are issued elsewhere. Here we only verify the bearer token of a request and expose
//! the venue it grants access to as a request extension, which handlers trust as is.
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::api::IngestError;

/// The claims of a verified device token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenueClaims {
    pub venue: String,
    /// Expiry, in seconds since the epoch.
    pub exp: u64,
}

pub trait ClaimsVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<VenueClaims, IngestError>;
}

/// Verifies HS256 signed device tokens.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl ClaimsVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<VenueClaims, IngestError> {
        decode::<VenueClaims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| IngestError::TokenValidationError(e.to_string()))
    }
}

/// Middleware rejecting requests without a valid bearer token, and attaching the
/// `VenueClaims` of valid ones.
pub async fn require_venue_claims(
    State(verifier): State<Arc<dyn ClaimsVerifier>>,
    mut req: Request,
    next: Next,
) -> Result<Response, IngestError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(IngestError::NoTokenError)?;

    let claims = verifier.verify(token)?;

    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &str, venue: &str, exp: u64) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &VenueClaims {
                venue: venue.to_owned(),
                exp,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn verifies_signed_token() {
        let verifier = JwtVerifier::new("secret");
        let claims = verifier
            .verify(&token("secret", "hall-A", 4_000_000_000))
            .unwrap();

        assert_eq!(claims.venue, "hall-A");
    }

    #[test]
    fn rejects_wrong_secret() {
        let verifier = JwtVerifier::new("secret");
        let result = verifier.verify(&token("other", "hall-A", 4_000_000_000));

        assert!(matches!(result, Err(IngestError::TokenValidationError(_))));
    }

    #[test]
    fn rejects_expired_token() {
        let verifier = JwtVerifier::new("secret");
        let result = verifier.verify(&token("secret", "hall-A", 1_000));

        assert!(matches!(result, Err(IngestError::TokenValidationError(_))));
    }
}

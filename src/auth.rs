use anyhow::{anyhow, Result};
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts, HeaderMap},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{error::ApiError, types::JwtClaims};

/// Verifies session tokens issued by the identity provider without a network
/// round trip, using the provider's published public key.
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
    authorized_parties: Vec<String>,
}

impl JwtVerifier {
    pub fn new(
        decoding_key: DecodingKey,
        algorithm: Algorithm,
        authorized_parties: Vec<String>,
    ) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;
        // Session tokens carry no audience
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            decoding_key,
            validation,
            authorized_parties,
        }
    }

    pub fn from_rsa_pem(pem: &str, authorized_parties: Vec<String>) -> Result<Self> {
        let decoding_key = DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| anyhow!("Invalid session token public key: {}", e))?;
        Ok(Self::new(decoding_key, Algorithm::RS256, authorized_parties))
    }

    pub fn verify(&self, token: &str) -> Result<JwtClaims> {
        let token_data = decode::<JwtClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| anyhow!("JWT validation failed: {}", e))?;
        let claims = token_data.claims;

        if let Some(azp) = &claims.azp {
            if !self.authorized_parties.is_empty() && !self.authorized_parties.contains(azp) {
                return Err(anyhow!("Unauthorized party: {}", azp));
            }
        }

        Ok(claims)
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ApiError::Unauthorized("Missing Authorization header".to_string()))?;

    let auth_str = auth_header
        .to_str()
        .map_err(|_| ApiError::Unauthorized("Invalid authorization header format".to_string()))?;

    auth_str
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::Unauthorized("Invalid authorization header format".to_string()))
}

/// The verified caller of a private operation.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
}

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
    Arc<JwtVerifier>: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let verifier = Arc::<JwtVerifier>::from_ref(state);
        let token = bearer_token(&parts.headers)?;

        match verifier.verify(token) {
            Ok(claims) => {
                debug!("Authenticated request from user: {}", claims.sub);
                Ok(AuthenticatedUser {
                    user_id: claims.sub,
                })
            }
            Err(e) => {
                warn!("{}", e);
                Err(ApiError::Unauthorized(e.to_string()))
            }
        }
    }
}

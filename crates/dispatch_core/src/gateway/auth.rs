//! Session credentials: a bearer token resolved to a worker identity once,
//! at session establishment.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::GatewayError;

pub trait CredentialVerifier: Send + Sync {
    /// Resolve a bearer token to the worker it identifies.
    fn verify(&self, token: &str) -> Result<String, GatewayError>;
}

/// Fixed token table, for tests and single-tenant deployments.
#[derive(Debug, Default, Clone)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: &str, worker_id: &str) -> Self {
        self.tokens.insert(token.to_string(), worker_id.to_string());
        self
    }
}

impl CredentialVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<String, GatewayError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(GatewayError::Unauthenticated)
    }
}

/// Claims of an access token minted by the auth service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessClaims {
    user_id: String,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    token_type: Option<String>,
    exp: i64,
}

/// HS256 JSON web tokens. Refresh tokens and expired tokens are refused.
#[derive(Clone)]
pub struct JwtVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let secret = secret.as_ref();
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Mint an access token for `worker_id` under this verifier's secret.
    pub fn issue(
        &self,
        worker_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = AccessClaims {
            user_id: worker_id.to_string(),
            roles: vec!["driver".to_string()],
            token_type: Some("access".to_string()),
            exp: expires_at.timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }
}

impl CredentialVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<String, GatewayError> {
        let claims = decode::<AccessClaims>(token, &self.decoding, &self.validation)
            .map_err(|_| GatewayError::Unauthenticated)?
            .claims;
        if claims.token_type.as_deref().is_some_and(|kind| kind != "access") {
            return Err(GatewayError::Unauthenticated);
        }
        if claims.user_id.trim().is_empty() {
            return Err(GatewayError::Unauthenticated);
        }
        Ok(claims.user_id)
    }
}

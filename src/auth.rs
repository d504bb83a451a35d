use anyhow::{Context, Result};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::AuthError;

/// Decoded identity payload for one request. Scoped to the request's
/// lifetime; never persisted or shared across requests.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id), optional for service tokens
    #[serde(default)]
    pub sub: Option<String>,
    /// Tenant schema identifier. Required; its absence is MissingClaim.
    #[serde(default)]
    pub profile: Option<String>,
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub iss: Option<String>,
}

impl Claims {
    /// The verified tenant, or MissingClaim if the token lacks one
    pub fn tenant(&self) -> Result<&str, AuthError> {
        self.profile
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingClaim)
    }
}

/// Verifies bearer credentials and extracts tenant claims.
///
/// Verify-only: the gateway never mints tokens. Supports RS256 with a
/// public key PEM, or HS256 with a shared secret.
pub struct AuthGate {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl AuthGate {
    pub fn new(config: &Config) -> Result<Self> {
        let (decoding_key, algorithm) = if let Some(public_key) = &config.jwt_public_key {
            tracing::info!("Initializing JWT verification with RS256 public key");
            let key = DecodingKey::from_rsa_pem(public_key.as_bytes())
                .context("Failed to parse JWT_PUBLIC_KEY as RSA PEM")?;
            (key, Algorithm::RS256)
        } else if let Some(secret) = &config.jwt_secret {
            tracing::warn!(
                "Using HS256 shared secret for JWT verification. Consider RS256 with JWT_PUBLIC_KEY"
            );
            (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256)
        } else {
            anyhow::bail!("No JWT key configured (JWT_PUBLIC_KEY or JWT_SECRET required)");
        };

        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&[config.jwt_issuer.clone()]);
        validation.set_audience(&[config.jwt_audience.clone()]);

        Ok(Self {
            decoding_key,
            validation,
        })
    }

    /// Authenticate a request from its Authorization header value.
    ///
    /// No side effects beyond the returned claims; route exemption is the
    /// controller's job, not this gate's.
    pub fn authenticate(&self, auth_header: Option<&str>) -> Result<Claims, AuthError> {
        let header = auth_header.ok_or(AuthError::MissingToken)?;
        let token = header.strip_prefix("Bearer ").ok_or(AuthError::MissingToken)?;

        let token_data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        let claims = token_data.claims;
        // Fail fast: a token without a tenant is useless to every route
        claims.tenant()?;

        Ok(claims)
    }
}

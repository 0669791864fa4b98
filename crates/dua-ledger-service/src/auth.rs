//! Authentication extractors.
//!
//! This module provides extractors for:
//! - `AuthUser` - End-user authentication via JWT validated against JWKS
//! - `ServiceAuth` - Service-to-service authentication via API key
//! - `AdminAuth` - Admin authentication for privileged endpoints
//!
//! The JWKS key set lives in a [`JwksCache`] owned by [`AppState`], not in
//! a process-wide static, so tests can point it at a mock issuer and drive
//! its expiry with a manual clock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use dua_ledger_core::UserId;

use crate::cache::{Clock, SystemClock, TtlCache};
use crate::error::ApiError;
use crate::state::AppState;

// ============================================================================
// Constants
// ============================================================================

/// How long to cache JWKS keys before refreshing.
pub const JWKS_CACHE_DURATION: Duration = Duration::from_secs(3600);

/// Timeout for JWKS fetch requests.
const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Cache slot for the key used by tokens without a `kid`.
const DEFAULT_KID: &str = "";

/// An authenticated end user.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// The user ID.
    pub user_id: UserId,
    /// The raw subject claim from the JWT.
    pub subject: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized)?;

        // Test tokens are only honoured in test builds or with the
        // "test-auth" feature, never in production builds.
        #[cfg(any(test, feature = "test-auth"))]
        if let Some(user_id_str) = token.strip_prefix("test-token:") {
            let user_id = user_id_str
                .parse::<UserId>()
                .map_err(|_| ApiError::Unauthorized)?;

            return Ok(AuthUser {
                user_id,
                subject: user_id_str.to_string(),
            });
        }

        let claims = validate_jwt(token, state).await?;

        let user_id = claims
            .sub
            .parse::<UserId>()
            .map_err(|_| ApiError::Unauthorized)?;

        Ok(AuthUser {
            user_id,
            subject: claims.sub,
        })
    }
}

/// Service authentication via API key.
///
/// Used by the UI backend for the internal ledger and job API.
#[derive(Debug, Clone)]
pub struct ServiceAuth {
    /// The service name or identifier.
    pub service_name: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for ServiceAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let api_key = parts
            .headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;

        let expected_key = state
            .config
            .service_api_key
            .as_deref()
            .ok_or(ApiError::Unauthorized)?;

        if !crate::crypto::constant_time_eq(api_key, expected_key) {
            return Err(ApiError::Unauthorized);
        }

        let service_name = parts
            .headers
            .get("x-service-name")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();

        Ok(ServiceAuth { service_name })
    }
}

/// Admin authentication via API key with admin scope.
///
/// Requires the `X-Admin-Key` header to match the configured admin key.
#[derive(Debug, Clone)]
pub struct AdminAuth {
    /// Admin identifier (for audit logging and adjustment records).
    pub admin_id: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let admin_key = parts
            .headers
            .get("x-admin-key")
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;

        let expected_key = state
            .config
            .admin_api_key
            .as_deref()
            .ok_or(ApiError::Unauthorized)?;

        if !crate::crypto::constant_time_eq(admin_key, expected_key) {
            return Err(ApiError::Unauthorized);
        }

        let admin_id = parts
            .headers
            .get("x-admin-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("admin")
            .to_string();

        tracing::info!(admin_id = %admin_id, "Admin authenticated");

        Ok(AdminAuth { admin_id })
    }
}

/// JWT claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (user ID).
    pub sub: String,
    /// Audience (can be string or array).
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
    /// Issuer.
    pub iss: String,
    /// Expiration time.
    pub exp: i64,
    /// Issued at.
    pub iat: i64,
}

// ============================================================================
// JWKS Cache and JWT Validation
// ============================================================================

/// JWKS (JSON Web Key Set) response structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwks {
    /// List of JWK keys.
    pub keys: Vec<Jwk>,
}

/// Single JSON Web Key.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key type (e.g., "RSA").
    pub kty: String,
    /// Key ID.
    pub kid: Option<String>,
    /// Algorithm (e.g., "RS256").
    pub alg: Option<String>,
    /// RSA public key modulus (base64url encoded).
    pub n: Option<String>,
    /// RSA public key exponent (base64url encoded).
    pub e: Option<String>,
    /// Key use (e.g., "sig" for signature).
    #[serde(rename = "use")]
    pub key_use: Option<String>,
}

/// Decoding keys fetched from the issuer's JWKS endpoint, cached for
/// [`JWKS_CACHE_DURATION`].
pub struct JwksCache {
    client: reqwest::Client,
    jwks_url: String,
    keys: TtlCache<String, DecodingKey>,
    /// Serializes refreshes so a burst of requests fetches once.
    refresh: tokio::sync::Mutex<()>,
}

impl JwksCache {
    /// Cache for the issuer at `auth_base_url`.
    #[must_use]
    pub fn new(auth_base_url: &str) -> Self {
        Self::with_clock(auth_base_url, Arc::new(SystemClock))
    }

    /// Cache whose expiry is driven by `clock`.
    #[must_use]
    pub fn with_clock(auth_base_url: &str, clock: Arc<dyn Clock>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(JWKS_FETCH_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            jwks_url: format!(
                "{}/.well-known/jwks.json",
                auth_base_url.trim_end_matches('/')
            ),
            keys: TtlCache::with_clock(JWKS_CACHE_DURATION, clock),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    /// The decoding key for `kid`, or the first published key when the
    /// token has no `kid`. Refetches the key set on a miss or expiry.
    ///
    /// # Errors
    ///
    /// `ApiError::Unauthorized` if the issuer doesn't publish the key,
    /// `ApiError::ExternalService` if the key set couldn't be fetched.
    pub async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, ApiError> {
        let slot = kid.unwrap_or(DEFAULT_KID);
        if let Some(key) = self.keys.get(slot) {
            return Ok(key);
        }

        let _refresh = self.refresh.lock().await;
        if let Some(key) = self.keys.get(slot) {
            return Ok(key);
        }

        let jwks = self.fetch().await?;
        self.keys.clear();
        for jwk in &jwks.keys {
            let Some(decoding_key) = jwk_to_decoding_key(jwk) else {
                continue;
            };
            if self.keys.get(DEFAULT_KID).is_none() {
                self.keys.insert(DEFAULT_KID.to_string(), decoding_key.clone());
            }
            if let Some(key_kid) = &jwk.kid {
                self.keys.insert(key_kid.clone(), decoding_key);
            }
        }

        self.keys.get(slot).ok_or(ApiError::Unauthorized)
    }

    async fn fetch(&self) -> Result<Jwks, ApiError> {
        tracing::debug!(url = %self.jwks_url, "Fetching JWKS");

        let response = self.client.get(&self.jwks_url).send().await.map_err(|e| {
            tracing::error!(error = %e, url = %self.jwks_url, "Failed to fetch JWKS");
            ApiError::ExternalService("Failed to fetch authentication keys".into())
        })?;

        if !response.status().is_success() {
            tracing::error!(
                status = %response.status(),
                url = %self.jwks_url,
                "JWKS fetch returned non-success status"
            );
            return Err(ApiError::ExternalService(
                "Failed to fetch authentication keys".into(),
            ));
        }

        let jwks: Jwks = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to parse JWKS response");
            ApiError::ExternalService("Failed to parse authentication keys".into())
        })?;

        tracing::info!(keys_count = %jwks.keys.len(), "JWKS fetched successfully");

        Ok(jwks)
    }
}

impl std::fmt::Debug for JwksCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwksCache")
            .field("jwks_url", &self.jwks_url)
            .field("keys", &self.keys.len())
            .finish_non_exhaustive()
    }
}

/// Validate a JWT against the issuer's key set.
async fn validate_jwt(token: &str, state: &AppState) -> Result<JwtClaims, ApiError> {
    let header = decode_header(token).map_err(|e| {
        tracing::debug!(error = %e, "Failed to decode JWT header");
        ApiError::Unauthorized
    })?;

    let decoding_key = state.jwks.decoding_key(header.kid.as_deref()).await?;

    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_audience(&[&state.config.auth_audience]);
    validation.set_issuer(&[&state.config.auth_base_url]);

    let token_data = decode::<JwtClaims>(token, &decoding_key, &validation).map_err(|e| {
        tracing::debug!(error = %e, "JWT validation failed");
        ApiError::Unauthorized
    })?;

    Ok(token_data.claims)
}

/// Convert a JWK to a `DecodingKey`.
fn jwk_to_decoding_key(jwk: &Jwk) -> Option<DecodingKey> {
    // Only RSA keys are published by the issuer
    if jwk.kty != "RSA" {
        tracing::debug!(kty = %jwk.kty, "Skipping non-RSA JWK");
        return None;
    }

    let n = jwk.n.as_ref()?;
    let e = jwk.e.as_ref()?;

    DecodingKey::from_rsa_components(n, e).ok()
}

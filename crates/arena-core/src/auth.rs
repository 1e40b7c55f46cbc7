//! Verification of identity-provider tokens presented in the `auth` handshake.
//!
//! Tokens are RS256 JWTs. The signing key is looked up by `kid` in the issuer's
//! JWKS document; keys are cached per `kid` for a bounded time so a rotated key
//! costs one fetch the first time it is seen.

use std::sync::Arc;
use std::time::Duration;

use arena_models::gateway::{AuthRequest, EVENT_AUTH};
use arena_models::room::MemberProfile;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use moka::future::Cache;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid auth message")]
    InvalidMessage,
    #[error("expected auth message")]
    UnexpectedType,
    #[error("missing token")]
    MissingToken,
    #[error("malformed token")]
    MalformedToken,
    #[error("token has no key id")]
    MissingKeyId,
    #[error("failed to fetch signing keys: {0}")]
    KeyFetch(String),
    #[error("signing key not found")]
    KeyNotFound,
    #[error("invalid signing key")]
    InvalidKey,
    #[error("unsupported signing algorithm")]
    UnsupportedAlgorithm,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    TokenExpired,
    #[error("issuer mismatch")]
    IssuerMismatch,
    #[error("token has no subject")]
    MissingSubject,
    #[error("user id does not match token subject")]
    UserMismatch,
    #[error("invalid token")]
    InvalidToken,
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub issuer: String,
    /// Defaults to `<issuer>/.well-known/jwks.json`.
    pub jwks_url: Option<String>,
    pub fetch_timeout: Duration,
    pub key_ttl: Duration,
}

/// Who a verified token belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub user_id: String,
    pub issuer: String,
    pub expires_at: i64,
    pub username: String,
    pub image_url: String,
}

impl VerifiedIdentity {
    pub fn profile(&self) -> MemberProfile {
        MemberProfile {
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            image_url: self.image_url.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: String,
    #[serde(default)]
    iss: String,
    exp: i64,
    #[serde(default)]
    username: Option<String>,
    #[serde(default, rename = "imageUrl", alias = "image_url")]
    image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwkSet {
    #[serde(default)]
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: String,
    #[serde(default)]
    kty: String,
    #[serde(default)]
    n: String,
    #[serde(default)]
    e: String,
}

pub struct TokenVerifier {
    issuer: String,
    jwks_url: String,
    http: reqwest::Client,
    keys: Cache<String, Arc<DecodingKey>>,
}

impl TokenVerifier {
    pub fn new(config: VerifierConfig) -> Result<Self, AuthError> {
        let issuer = config.issuer.trim_end_matches('/').to_string();
        let jwks_url = config
            .jwks_url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| format!("{issuer}/.well-known/jwks.json"));
        let http = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        let keys = Cache::builder()
            .max_capacity(64)
            .time_to_live(config.key_ttl)
            .build();
        Ok(Self {
            issuer,
            jwks_url,
            http,
            keys,
        })
    }

    pub fn jwks_url(&self) -> &str {
        &self.jwks_url
    }

    /// Verifies a raw `auth` message. A `userId` in the message, when present,
    /// must equal the token subject.
    pub async fn verify_message(&self, raw: &str) -> Result<VerifiedIdentity, AuthError> {
        let request: AuthRequest =
            serde_json::from_str(raw).map_err(|_| AuthError::InvalidMessage)?;
        if request.event_type != EVENT_AUTH {
            return Err(AuthError::UnexpectedType);
        }
        let token = request.token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let identity = self.verify_token(token).await?;
        match request.user_id.as_deref().map(str::trim) {
            Some(claimed) if !claimed.is_empty() && claimed != identity.user_id => {
                Err(AuthError::UserMismatch)
            }
            _ => Ok(identity),
        }
    }

    pub async fn verify_token(&self, token: &str) -> Result<VerifiedIdentity, AuthError> {
        let header = decode_header(token).map_err(|_| AuthError::MalformedToken)?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::UnsupportedAlgorithm);
        }
        let kid = header
            .kid
            .filter(|kid| !kid.is_empty())
            .ok_or(AuthError::MissingKeyId)?;
        let key = self.decoding_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        let claims = decode::<Claims>(token, &key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                ErrorKind::InvalidAlgorithm => AuthError::UnsupportedAlgorithm,
                _ => AuthError::InvalidToken,
            })?
            .claims;

        if claims.iss.trim_end_matches('/') != self.issuer {
            return Err(AuthError::IssuerMismatch);
        }
        if claims.sub.is_empty() {
            return Err(AuthError::MissingSubject);
        }
        Ok(VerifiedIdentity {
            user_id: claims.sub,
            issuer: claims.iss,
            expires_at: claims.exp,
            username: claims.username.unwrap_or_default(),
            image_url: claims.image_url.unwrap_or_default(),
        })
    }

    async fn decoding_key(&self, kid: &str) -> Result<Arc<DecodingKey>, AuthError> {
        if let Some(key) = self.keys.get(kid).await {
            return Ok(key);
        }
        let jwks = self.fetch_jwks().await?;
        let jwk = jwks
            .keys
            .into_iter()
            .find(|jwk| jwk.kid == kid && jwk.kty == "RSA")
            .ok_or(AuthError::KeyNotFound)?;
        let key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)
            .map(Arc::new)
            .map_err(|_| AuthError::InvalidKey)?;
        self.keys.insert(kid.to_string(), key.clone()).await;
        tracing::debug!(kid, "cached signing key");
        Ok(key)
    }

    async fn fetch_jwks(&self) -> Result<JwkSet, AuthError> {
        let response = self
            .http
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| AuthError::KeyFetch(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::KeyFetch(format!("status {status}")));
        }
        response
            .json::<JwkSet>()
            .await
            .map_err(|e| AuthError::KeyFetch(e.to_string()))
    }
}

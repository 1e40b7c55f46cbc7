pub mod auth;
pub mod broadcast;
pub mod error;
pub mod profiles;
pub mod registry;
pub mod rooms;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use arena_models::room::DEFAULT_MAX_USERS;

use crate::auth::{AuthError, TokenVerifier, VerifierConfig};
use crate::profiles::ProfileCache;
use crate::registry::Registry;
use crate::rooms::RoomCoordinator;
use crate::store::Store;

/// Settings resolved from the server configuration at startup.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Expected `iss` claim of client tokens.
    pub auth_issuer: String,
    /// JWKS endpoint override. Defaults to `<issuer>/.well-known/jwks.json`.
    pub jwks_url: Option<String>,
    pub jwks_fetch_timeout_secs: u64,
    /// How long a fetched verification key is reused before it is fetched again.
    pub jwks_key_ttl_secs: u64,
    /// Capacity used when a client creates a room without one.
    pub default_max_users: u32,
    /// Idle read deadline of a gateway connection.
    pub idle_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            auth_issuer: String::new(),
            jwks_url: None,
            jwks_fetch_timeout_secs: 5,
            jwks_key_ttl_secs: 3600,
            default_max_users: DEFAULT_MAX_USERS,
            idle_timeout_secs: 60,
        }
    }
}

impl AppConfig {
    /// Registry entries outlive the idle deadline slightly so a crashed
    /// instance's entries expire on their own.
    pub fn registry_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs + 10)
    }

    pub fn verifier_config(&self) -> VerifierConfig {
        VerifierConfig {
            issuer: self.auth_issuer.clone(),
            jwks_url: self.jwks_url.clone(),
            fetch_timeout: Duration::from_secs(self.jwks_fetch_timeout_secs),
            key_ttl: Duration::from_secs(self.jwks_key_ttl_secs),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub registry: Arc<Registry>,
    pub rooms: Arc<RoomCoordinator>,
    pub verifier: Arc<TokenVerifier>,
    /// Best-effort cache of usernames and avatars keyed by user id.
    pub profiles: ProfileCache,
}

impl AppState {
    pub fn new(config: AppConfig, store: Store, registry: Registry) -> Result<Self, AuthError> {
        let verifier = TokenVerifier::new(config.verifier_config())?;
        let profiles = ProfileCache::new(store.clone());
        let rooms = RoomCoordinator::new(store, profiles.clone(), config.default_max_users);
        Ok(Self {
            config,
            registry: Arc::new(registry),
            rooms: Arc::new(rooms),
            verifier: Arc::new(verifier),
            profiles,
        })
    }
}

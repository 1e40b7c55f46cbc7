use anyhow::{bail, Result};
use arena_core::AppConfig;
use arena_models::room::DEFAULT_MAX_USERS;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub rooms: RoomsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Expected `iss` claim. Keys are fetched from `<issuer>/.well-known/jwks.json`.
    #[serde(default)]
    pub issuer: String,
    #[serde(default)]
    pub jwks_url: Option<String>,
    #[serde(default = "default_jwks_timeout_secs")]
    pub jwks_timeout_secs: u64,
    #[serde(default = "default_jwks_key_ttl_secs")]
    pub jwks_key_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            jwks_url: None,
            jwks_timeout_secs: default_jwks_timeout_secs(),
            jwks_key_ttl_secs: default_jwks_key_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

impl StoreBackend {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "redis" => Some(Self::Redis),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Redis => "redis",
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default)]
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    #[default]
    Local,
    Shared,
}

impl RegistryBackend {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Some(Self::Local),
            "shared" | "redis" => Some(Self::Shared),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Shared => "shared",
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub registry: RegistryBackend,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            registry: RegistryBackend::default(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RoomsConfig {
    #[serde(default = "default_max_users")]
    pub max_users: u32,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            max_users: default_max_users(),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Emit newline-delimited JSON instead of the human readable format.
    #[serde(default)]
    pub json: bool,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::info!(
                "Config file not found at '{}', generating defaults...",
                path
            );
            let config = Config::default();

            if let Some(parent) = std::path::Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }

            fs::write(path, generate_config_template(&config))?;
            tracing::info!("Generated default config at '{}'", path);
            config
        };

        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Applies `ARENA_*` overrides, falling back to the legacy unprefixed names.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |names: &[&str]| names.iter().find_map(|name| lookup(*name));

        if let Some(value) = first(&["ARENA_BIND_ADDRESS"]) {
            self.server.bind_address = value;
        }
        if let Some(value) = first(&["ARENA_AUTH_ISSUER", "CLERK_ISSUER"]) {
            self.auth.issuer = value;
        }
        if let Some(value) = first(&["ARENA_AUTH_JWKS_URL", "CLERK_JWKS_URL"]) {
            self.auth.jwks_url = Some(value).filter(|url| !url.trim().is_empty());
        }
        if let Some(value) = first(&["ARENA_AUTH_JWKS_TIMEOUT_SECS"]) {
            if let Ok(parsed) = value.parse::<u64>() {
                self.auth.jwks_timeout_secs = parsed;
            }
        }
        if let Some(value) = first(&["ARENA_STORE_BACKEND"]) {
            match StoreBackend::parse(&value) {
                Some(backend) => self.store.backend = backend,
                None => tracing::warn!(
                    "Ignoring invalid ARENA_STORE_BACKEND value '{}'; expected memory or redis",
                    value
                ),
            }
        }
        if let Some(value) = first(&["ARENA_REDIS_URL", "REDIS_URL"]) {
            self.store.redis_url = Some(value).filter(|url| !url.trim().is_empty());
        }
        if let Some(value) = first(&["ARENA_REGISTRY_BACKEND"]) {
            match RegistryBackend::parse(&value) {
                Some(backend) => self.gateway.registry = backend,
                None => tracing::warn!(
                    "Ignoring invalid ARENA_REGISTRY_BACKEND value '{}'; expected local or shared",
                    value
                ),
            }
        }
        if let Some(value) = first(&["ARENA_ROOM_MAX_USERS", "ROOM_MAX_USERS"]) {
            if let Ok(parsed) = value.parse::<u32>() {
                self.rooms.max_users = parsed;
            }
        }
        if let Some(value) = first(&["ARENA_IDLE_TIMEOUT_SECS"]) {
            if let Ok(parsed) = value.parse::<u64>() {
                self.gateway.idle_timeout_secs = parsed;
            }
        }
        if let Some(value) = first(&["ARENA_LOG_JSON"]) {
            if let Ok(parsed) = value.parse::<bool>() {
                self.logging.json = parsed;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth.issuer.trim().is_empty() {
            bail!("auth.issuer is required (set it in the config file or via ARENA_AUTH_ISSUER)");
        }
        if self.rooms.max_users == 0 {
            bail!("rooms.max_users must be at least 1");
        }
        if self.needs_redis() && self.redis_url().is_none() {
            bail!(
                "store.redis_url is required when store.backend = \"redis\" or gateway.registry = \"shared\""
            );
        }
        Ok(())
    }

    pub fn needs_redis(&self) -> bool {
        self.store.backend == StoreBackend::Redis
            || self.gateway.registry == RegistryBackend::Shared
    }

    pub fn redis_url(&self) -> Option<&str> {
        self.store
            .redis_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub fn app_config(&self) -> AppConfig {
        AppConfig {
            auth_issuer: self.auth.issuer.trim().to_string(),
            jwks_url: self.auth.jwks_url.clone(),
            jwks_fetch_timeout_secs: self.auth.jwks_timeout_secs,
            jwks_key_ttl_secs: self.auth.jwks_key_ttl_secs,
            default_max_users: self.rooms.max_users,
            idle_timeout_secs: self.gateway.idle_timeout_secs,
        }
    }
}

fn generate_config_template(config: &Config) -> String {
    format!(
        r#"# Arena Server Configuration
# Generated automatically on first run. Edit as needed.

[server]
bind_address = "{bind_address}"

[auth]
# Issuer of client session tokens, e.g. "https://your-app.clerk.accounts.dev".
# Required. May also be supplied through ARENA_AUTH_ISSUER or CLERK_ISSUER.
issuer = ""
# Defaults to "<issuer>/.well-known/jwks.json".
# jwks_url = "https://your-app.clerk.accounts.dev/.well-known/jwks.json"
jwks_timeout_secs = {jwks_timeout_secs}
jwks_key_ttl_secs = {jwks_key_ttl_secs}

[store]
# Room store backend: "memory" (single instance) or "redis".
backend = "{store_backend}"
# redis_url = "redis://127.0.0.1:6379"

[gateway]
# Connection registry: "local" (in-process) or "shared" (Redis).
registry = "{registry_backend}"
idle_timeout_secs = {idle_timeout_secs}

[rooms]
# Capacity used when a client creates a room without maxUsers.
max_users = {max_users}

[logging]
json = {log_json}
"#,
        bind_address = config.server.bind_address,
        jwks_timeout_secs = config.auth.jwks_timeout_secs,
        jwks_key_ttl_secs = config.auth.jwks_key_ttl_secs,
        store_backend = config.store.backend.as_str(),
        registry_backend = config.gateway.registry.as_str(),
        idle_timeout_secs = config.gateway.idle_timeout_secs,
        max_users = config.rooms.max_users,
        log_json = config.logging.json,
    )
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_jwks_timeout_secs() -> u64 {
    5
}
fn default_jwks_key_ttl_secs() -> u64 {
    3600
}
fn default_idle_timeout_secs() -> u64 {
    60
}
fn default_max_users() -> u32 {
    DEFAULT_MAX_USERS
}

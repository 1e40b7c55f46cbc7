use anyhow::{Context, Result};
use arena_core::registry::{Registry, SharedRegistry};
use arena_core::store::{RedisStore, Store};
use arena_core::AppState;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

use config::{Config, RegistryBackend, StoreBackend};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    let generated = !std::path::Path::new(&args.config).exists();
    let mut config = Config::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }

    init_tracing(config.logging.json);
    if generated {
        tracing::info!(path = %args.config, "generated default config");
    }

    let app_config = config.app_config();
    let registry_ttl = app_config.registry_ttl();

    let store = match config.store.backend {
        StoreBackend::Memory => Store::memory(),
        StoreBackend::Redis => {
            let url = config
                .redis_url()
                .context("store.redis_url is required for the redis backend")?;
            Store::Redis(
                RedisStore::connect(url)
                    .await
                    .with_context(|| format!("failed to connect to redis at {url}"))?,
            )
        }
    };

    let registry = match config.gateway.registry {
        RegistryBackend::Local => Registry::local(),
        RegistryBackend::Shared => {
            let conn = match &store {
                Store::Redis(redis) => redis.connection(),
                Store::Memory(_) => {
                    let url = config
                        .redis_url()
                        .context("store.redis_url is required for the shared registry")?;
                    let client = redis::Client::open(url)?;
                    redis::aio::ConnectionManager::new(client)
                        .await
                        .with_context(|| format!("failed to connect to redis at {url}"))?
                }
            };
            Registry::Shared(SharedRegistry::new(conn, registry_ttl))
        }
    };

    tracing::info!(
        store = store.backend_name(),
        registry = config.gateway.registry.as_str(),
        issuer = %app_config.auth_issuer,
        max_users = app_config.default_max_users,
        "backends ready"
    );

    let state = AppState::new(app_config, store, registry).context("invalid auth settings")?;
    let app = arena_ws::gateway_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_address))?;
    tracing::info!("Arena gateway listening on ws://{}/ws", listener.local_addr()?);

    let shutdown_signal = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutting down (ctrl-c)...");
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("arena=info,tower_http=debug"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

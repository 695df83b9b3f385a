use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use tileserver_rs::app::{self, AppState};
use tileserver_rs::config::Config;
use tileserver_rs::registry::JobRegistry;
use tileserver_rs::telemetry;

mod cli;

#[cfg(feature = "postgres")]
async fn build_postgres_pool(config: &Config) -> anyhow::Result<Option<Arc<tileserver_rs::sources::postgres::PostgresPool>>> {
    use tileserver_rs::sources::postgres::{PoolSettings, PostgresPool};

    let Some(pg) = &config.postgres else {
        return Ok(None);
    };

    let settings = PoolSettings {
        max_size: pg.pool_size,
        wait_timeout_ms: pg.pool_wait_timeout_ms,
        create_timeout_ms: pg.pool_create_timeout_ms,
        recycle_timeout_ms: pg.pool_recycle_timeout_ms,
    };

    let pool = PostgresPool::new(
        &pg.connection_string,
        settings,
        pg.ssl_cert.as_ref(),
        pg.ssl_key.as_ref(),
        pg.ssl_root_cert.as_ref(),
    )
    .await?;

    Ok(Some(Arc::new(pool)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = cli::Cli::parse_args();

    let mut config = Config::load(cli.config.clone())?;
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    let telemetry_layer = telemetry::init_telemetry::<tracing_subscriber::Registry>(&config.telemetry);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    let job_registry = Arc::new(JobRegistry::open(&config.job_registry.path)?);
    let reconciled = job_registry.reconcile_startup()?;
    if reconciled > 0 {
        tracing::warn!(reconciled, "reconciled stale running jobs from a previous crash");
    }

    #[cfg(feature = "postgres")]
    let postgres_pool = match build_postgres_pool(&config).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(error = %e, "PostgreSQL pool unavailable; vector datasources will serve no content");
            None
        }
    };

    #[cfg(feature = "postgres")]
    let state = AppState::new(&config, job_registry, PathBuf::from("data"), PathBuf::from("tiles"), postgres_pool);
    #[cfg(not(feature = "postgres"))]
    let state = AppState::new(&config, job_registry, PathBuf::from("data"), PathBuf::from("tiles"));

    let router = app::build_router(state, &config.server.cors_origins);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(%addr, "starting tileserver-rs");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router.into_make_service()).await?;

    telemetry::shutdown_telemetry();
    Ok(())
}

//! Shared fixtures for the HTTP-surface integration tests.

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use tileserver_rs::app::AppState;
use tileserver_rs::config::Config;
use tileserver_rs::registry::JobRegistry;

/// Keeps the backing temp directory alive for the duration of a test; the
/// `AppState` it's paired with holds paths into it.
pub struct Guard(#[allow(dead_code)] TempDir);

/// Builds an `AppState` rooted in a fresh temp directory, with an empty
/// DataSource catalog and no PostgreSQL pool.
pub fn spawn_test_app() -> (Guard, AppState) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = Config::default();
    let job_registry = Arc::new(JobRegistry::open(&dir.path().join("tiler.db")).expect("job registry"));

    #[cfg(feature = "postgres")]
    let state = AppState::new(
        &config,
        job_registry,
        dir.path().join("work"),
        dir.path().join("tiles"),
        None,
    );
    #[cfg(not(feature = "postgres"))]
    let state = AppState::new(&config, job_registry, dir.path().join("work"), dir.path().join("tiles"));

    (Guard(dir), state)
}

/// A minimal valid raster `DataSourceConfig` JSON payload, pointing at a file
/// path that need not exist (tests that actually render tiles create one).
pub fn raster_datasource(id: &str) -> serde_json::Value {
    json!({
        "id": id,
        "kind": "raster",
        "bounds": [-180.0, -85.05112878, 180.0, 85.05112878],
        "minzoom": 0,
        "maxzoom": 14,
        "data_store": { "type": "file", "path": "/nonexistent.tif" },
        "pyramid": {},
    })
}

//! Router and request-handling surface (spec §6 HTTP API), extracted from the
//! binary entrypoint so integration tests can exercise it directly via
//! [`axum_test::TestServer`]-style drivers without spawning a real listener.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::config::{Config, DataSourceConfig, DataSourceKind, DataStore, PyramidEngineConfig};
use crate::error::{Result, TileServerError, ValidationIssue};
use crate::grid::MercatorGrid;
use crate::job;
use crate::logging::request_logger;
use crate::registry::JobRegistry;
use crate::serving::{TileGenerator, TileServingPath, ZoomRange};
use crate::sink::{ArchiveSink, FsSink, TileSink};

#[cfg(feature = "postgres")]
use crate::sources::postgres::PostgresPool;
#[cfg(feature = "postgres")]
use crate::vector::{filter, LayerSpec, VectorTileBuilder};

const TILE_CACHE_MAX_BYTES: u64 = 256 * 1024 * 1024;
const TILE_CACHE_TTL_SECS: u64 = 300;

/// Everything the HTTP surface needs: the in-memory DataSource catalog, the
/// lazily-built serving paths, and the handles shared with the pyramid
/// engine (job registry, tuning, on-disk roots).
#[derive(Clone)]
pub struct AppState {
    pub datasources: Arc<RwLock<HashMap<String, DataSourceConfig>>>,
    pub serving: Arc<RwLock<HashMap<String, Arc<TileServingPath>>>>,
    pub job_registry: Arc<JobRegistry>,
    pub engine_config: PyramidEngineConfig,
    pub work_dir: PathBuf,
    pub tiles_root: PathBuf,
    #[cfg(feature = "postgres")]
    pub postgres_pool: Option<Arc<PostgresPool>>,
}

impl AppState {
    pub fn new(
        config: &Config,
        job_registry: Arc<JobRegistry>,
        work_dir: PathBuf,
        tiles_root: PathBuf,
        #[cfg(feature = "postgres")] postgres_pool: Option<Arc<PostgresPool>>,
    ) -> Self {
        let datasources: HashMap<String, DataSourceConfig> = config
            .datasources
            .iter()
            .cloned()
            .map(|ds| (ds.id.clone(), ds))
            .collect();

        Self {
            datasources: Arc::new(RwLock::new(datasources)),
            serving: Arc::new(RwLock::new(HashMap::new())),
            job_registry,
            engine_config: config.pyramid_engine.clone(),
            work_dir,
            tiles_root,
            #[cfg(feature = "postgres")]
            postgres_pool,
        }
    }

    /// Returns the serving path for `id`, building (and preprocessing, for a
    /// raster DataSource) it on first use.
    async fn serving_path(&self, id: &str) -> Result<Arc<TileServingPath>> {
        if let Some(path) = self.serving.read().await.get(id) {
            return Ok(path.clone());
        }

        let ds = self
            .datasources
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TileServerError::DataSourceNotFound(id.to_string()))?;

        let built = Arc::new(self.build_serving_path(&ds).await?);
        self.serving.write().await.insert(id.to_string(), built.clone());
        Ok(built)
    }

    async fn build_serving_path(&self, ds: &DataSourceConfig) -> Result<TileServingPath> {
        let sink: Box<dyn TileSink> = if ds.pyramid.archive {
            let archive_path = self.tiles_root.join(format!("{}.mbtiles", ds.id));
            Box::new(ArchiveSink::open(
                &archive_path,
                self.engine_config.busy_retry_attempts,
                self.engine_config.busy_retry_backoff_ms,
            )?)
        } else {
            Box::new(FsSink::new(&self.tiles_root, &ds.id, "png"))
        };

        let generator: Arc<dyn TileGenerator> = match ds.kind {
            DataSourceKind::Raster => self.raster_generator_for(ds).await?,
            DataSourceKind::Vector => self.vector_generator_for(ds)?,
        };

        let sidecar_path = self.work_dir.join(&ds.id).join(format!("{}.db", ds.id));

        Ok(TileServingPath::with_sidecar(
            ds.id.clone(),
            ZoomRange {
                minzoom: ds.minzoom,
                maxzoom: ds.maxzoom,
            },
            sink,
            generator,
            TILE_CACHE_MAX_BYTES,
            TILE_CACHE_TTL_SECS,
            Some(sidecar_path),
        ))
    }

    async fn raster_generator_for(&self, ds: &DataSourceConfig) -> Result<Arc<dyn TileGenerator>> {
        match &ds.data_store {
            #[cfg(feature = "raster")]
            DataStore::File { .. } | DataStore::Folder { .. } => {
                Ok(Arc::new(raster_generator(ds, &self.work_dir).await?))
            }
            #[cfg(not(feature = "raster"))]
            DataStore::File { .. } | DataStore::Folder { .. } => {
                Err(TileServerError::MissingPrerequisite(
                    "raster serving requires the `raster` feature".to_string(),
                ))
            }
            DataStore::ExternalTemplate { url_template } => {
                Ok(Arc::new(ExternalTemplateGenerator::new(url_template.clone())))
            }
            DataStore::ExternalArchive { path } => {
                Ok(Arc::new(ExternalArchiveGenerator::open(path)?))
            }
        }
    }

    fn vector_generator_for(&self, ds: &DataSourceConfig) -> Result<Arc<dyn TileGenerator>> {
        #[cfg(feature = "postgres")]
        {
            if let (Some(pool), false) = (self.postgres_pool.clone(), ds.layers.is_empty()) {
                let layers = ds
                    .layers
                    .iter()
                    .map(|l| {
                        let mut pairs: Vec<(String, String)> =
                            l.fields.iter().map(|f| (f.clone(), f.clone())).collect();
                        pairs.push((l.geometry_column.clone(), l.geometry_column.clone()));
                        let mapping = filter::FieldMapping::new(pairs);
                        let filter = l
                            .filter
                            .as_ref()
                            .map(|json| filter::parse(json, &l.geometry_column, &mapping))
                            .transpose()?;

                        Ok(LayerSpec {
                            id: l.id.clone(),
                            table: l.table.clone(),
                            geometry_column: l.geometry_column.clone(),
                            minzoom: l.minzoom,
                            maxzoom: l.maxzoom,
                            simplify: l.simplify,
                            filter,
                            fields: l.fields.clone(),
                            extent: l.extent,
                            buffer: l.buffer,
                        })
                    })
                    .collect::<Result<Vec<LayerSpec>>>()?;

                return Ok(Arc::new(PostgresVectorGenerator(VectorTileBuilder::new(pool, layers))));
            }
        }

        Ok(Arc::new(VectorUnavailableGenerator))
    }
}

/// Resolves a DataSource's raw inputs and preprocesses each of them (C3),
/// reusing whatever the pyramid engine already produced under `work_dir`.
#[cfg(feature = "raster")]
async fn raster_generator(ds: &DataSourceConfig, work_dir: &Path) -> Result<RasterTileGenerator> {
    use crate::raster::preprocess::{preprocess, PreprocessOptions};

    let inputs: Vec<PathBuf> = match &ds.data_store {
        DataStore::File { path } => vec![path.clone()],
        DataStore::Folder { path } => {
            let mut paths = Vec::new();
            for entry in std::fs::read_dir(path)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    paths.push(entry.path());
                }
            }
            paths.sort();
            paths
        }
        DataStore::ExternalTemplate { .. } | DataStore::ExternalArchive { .. } => {
            return Err(TileServerError::MissingPrerequisite(
                "on-demand preprocessing requires a local file or folder data store".to_string(),
            ))
        }
    };

    if inputs.is_empty() {
        return Err(TileServerError::MissingPrerequisite(format!(
            "datasource {} has no input files",
            ds.id
        )));
    }

    let target_srs_wkt = gdal::spatial_ref::SpatialRef::from_epsg(3857)
        .and_then(|sr| sr.to_wkt())
        .map_err(|e| TileServerError::UnknownSrs(format!("EPSG:3857: {e}")))?;

    let opts = PreprocessOptions {
        target_srs_wkt,
        tile_size: ds.pyramid.tile_size,
        warp_resampling: ds.pyramid.resampling,
        overview_resampling: ds.pyramid.resampling,
    };

    let ds_work_dir = work_dir.join(&ds.id);
    let mut preprocessed = Vec::with_capacity(inputs.len());
    for input in inputs {
        let work_dir = ds_work_dir.clone();
        let opts = opts.clone();
        let pre = tokio::task::spawn_blocking(move || preprocess(&input, &work_dir, &opts))
            .await
            .map_err(|e| TileServerError::Internal(anyhow::anyhow!("preprocess task panicked: {e}")))??;
        preprocessed.push(pre.path);
    }

    Ok(RasterTileGenerator {
        paths: preprocessed,
        opts: ds.pyramid.clone(),
        grid: MercatorGrid::new(ds.pyramid.tile_size),
    })
}

/// On-demand single-tile raster generation, reusing the exact window/merge/
/// encode path the batch pyramid build uses (`job::render_tile`).
#[cfg(feature = "raster")]
struct RasterTileGenerator {
    paths: Vec<PathBuf>,
    opts: crate::config::PyramidOptions,
    grid: MercatorGrid,
}

#[cfg(feature = "raster")]
#[async_trait::async_trait]
impl TileGenerator for RasterTileGenerator {
    async fn generate(&self, z: u8, x: u32, y: u32) -> Result<Option<Vec<u8>>> {
        use crate::raster::adapter::GdalRasterAdapter;
        use crate::tiling::engine::TileOutcome;
        use crate::tiling::planner::TileDetail;

        let paths = self.paths.clone();
        let opts = self.opts.clone();
        let grid = self.grid;
        let bounds = grid.tile_bounds(x as i64, y as i64, z);
        let detail = TileDetail { tz: z, tx: x, ty: y, bounds, window: None };

        let outcome = tokio::task::spawn_blocking(move || -> Result<TileOutcome> {
            let mut adapters: Vec<GdalRasterAdapter> = paths
                .iter()
                .map(|p| GdalRasterAdapter::open(p))
                .collect::<Result<_>>()?;
            job::render_tile(&mut adapters, &detail, &opts, &grid)
        })
        .await
        .map_err(|e| TileServerError::Internal(anyhow::anyhow!("tile render task panicked: {e}")))??;

        match outcome {
            TileOutcome::Emitted(bytes) => Ok(Some(bytes)),
            TileOutcome::EmptyNodata => Ok(None),
        }
    }
}

/// Forwards tile requests to an externally hosted `{z}/{x}/{y}` URL
/// template, for a DataSource whose raw data lives behind someone else's
/// tile service rather than a local raster this process can preprocess.
struct ExternalTemplateGenerator {
    client: reqwest::Client,
    url_template: String,
}

impl ExternalTemplateGenerator {
    fn new(url_template: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url_template,
        }
    }

    fn url_for(&self, z: u8, x: u32, y: u32) -> String {
        self.url_template
            .replace("{z}", &z.to_string())
            .replace("{x}", &x.to_string())
            .replace("{y}", &y.to_string())
    }
}

#[async_trait::async_trait]
impl TileGenerator for ExternalTemplateGenerator {
    async fn generate(&self, z: u8, x: u32, y: u32) -> Result<Option<Vec<u8>>> {
        let url = self.url_for(z, x, y);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TileServerError::Internal(anyhow::anyhow!("external tile fetch {url}: {e}")))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp
            .error_for_status()
            .map_err(|e| TileServerError::Internal(anyhow::anyhow!("external tile fetch {url}: {e}")))?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| TileServerError::Internal(anyhow::anyhow!("external tile read {url}: {e}")))?;
        Ok(Some(bytes.to_vec()))
    }
}

/// Reads tiles from a pre-built packed archive (spec §3 `ExternalArchive`),
/// reusing the sink's own read path rather than a second SQLite layer.
struct ExternalArchiveGenerator {
    sink: tokio::sync::Mutex<ArchiveSink>,
}

impl ExternalArchiveGenerator {
    fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            sink: tokio::sync::Mutex::new(ArchiveSink::open(path, 10, 200)?),
        })
    }
}

#[async_trait::async_trait]
impl TileGenerator for ExternalArchiveGenerator {
    async fn generate(&self, z: u8, x: u32, y: u32) -> Result<Option<Vec<u8>>> {
        self.sink.lock().await.read_tile(z, x, y)
    }
}

#[cfg(feature = "postgres")]
struct PostgresVectorGenerator(VectorTileBuilder);

#[cfg(feature = "postgres")]
#[async_trait::async_trait]
impl TileGenerator for PostgresVectorGenerator {
    async fn generate(&self, z: u8, x: u32, y: u32) -> Result<Option<Vec<u8>>> {
        let bytes = self.0.build_tile(z, x, y).await?;
        if bytes.is_empty() {
            Ok(None)
        } else {
            Ok(Some(bytes.to_vec()))
        }
    }
}

/// Fallback for a vector DataSource with no configured layers or no
/// available PostgreSQL pool: reports absence rather than guessing.
struct VectorUnavailableGenerator;

#[async_trait::async_trait]
impl TileGenerator for VectorUnavailableGenerator {
    async fn generate(&self, _z: u8, _x: u32, _y: u32) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    worker_pid: u32,
    worker_type: &'static str,
    worker_status: &'static str,
}

async fn health() -> Json<HealthStatus> {
    Json(HealthStatus {
        worker_pid: std::process::id(),
        worker_type: "tokio",
        worker_status: "running",
    })
}

async fn get_tile(
    State(state): State<AppState>,
    AxumPath((datasource, z, x, y_ext)): AxumPath<(String, u8, u32, String)>,
) -> Result<Response> {
    let (y_str, ext) = y_ext
        .split_once('.')
        .ok_or(TileServerError::InvalidTileRequest)?;
    let y: u32 = y_str.parse().map_err(|_| TileServerError::InvalidTileRequest)?;

    let serving = state.serving_path(&datasource).await?;
    let Some(bytes) = serving.get_tile(z, x, y).await? else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };

    let content_type = match ext {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "pbf" | "mvt" => "application/x-protobuf",
        _ => "application/octet-stream",
    };

    let nts = neighbor_header_value(z, x, y);
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(content_type)),
            (header::CACHE_CONTROL, crate::cache_control::tile_cache_headers()),
        ],
        [("Nts", nts)],
        bytes,
    )
        .into_response())
}

/// Lists the 8-neighborhood addresses generated opportunistically alongside
/// this tile (spec §6 `Nts` header), independent of whether those neighbor
/// writes have actually landed yet.
fn neighbor_header_value(z: u8, x: u32, y: u32) -> String {
    let max = 1i64 << z;
    let mut items = Vec::with_capacity(8);
    for (dx, dy) in [(-1, -1), (0, -1), (1, -1), (-1, 0), (1, 0), (-1, 1), (0, 1), (1, 1)] {
        let nx = x as i64 + dx;
        let ny = y as i64 + dy;
        if nx >= 0 && ny >= 0 && nx < max && ny < max {
            items.push(format!("{z}/{nx}/{ny}"));
        }
    }
    items.join(",")
}

#[derive(Debug, Deserialize)]
struct PyramidRequest {
    datasource_id: String,
}

async fn launch_pyramid(
    State(state): State<AppState>,
    Json(req): Json<PyramidRequest>,
) -> Result<(StatusCode, Json<job::PyramidLaunch>)> {
    let ds = state
        .datasources
        .read()
        .await
        .get(&req.datasource_id)
        .cloned()
        .ok_or_else(|| TileServerError::DataSourceNotFound(req.datasource_id.clone()))?;

    let launch = job::launch(
        state.job_registry.clone(),
        ds,
        state.engine_config.clone(),
        state.work_dir.clone(),
        state.tiles_root.clone(),
    )
    .await?;

    Ok((StatusCode::ACCEPTED, Json(launch)))
}

async fn list_datasources(State(state): State<AppState>) -> Json<Vec<DataSourceConfig>> {
    Json(state.datasources.read().await.values().cloned().collect())
}

async fn get_datasource(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<DataSourceConfig>> {
    state
        .datasources
        .read()
        .await
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or(TileServerError::DataSourceNotFound(id))
}

#[derive(Debug, Serialize)]
struct UpsertResponse {
    datasource_id: String,
    message: String,
}

async fn upsert_datasource(
    State(state): State<AppState>,
    Json(ds): Json<DataSourceConfig>,
) -> Result<Json<UpsertResponse>> {
    ds.validate().map_err(|e| {
        TileServerError::Validation(vec![ValidationIssue::new("datasource", e, "validation_error")])
    })?;

    let id = ds.id.clone();
    let replaced = state.datasources.write().await.insert(id.clone(), ds).is_some();
    state.serving.write().await.remove(&id);

    Ok(Json(UpsertResponse {
        datasource_id: id,
        message: if replaced { "replaced".to_string() } else { "created".to_string() },
    }))
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    id: String,
}

async fn delete_datasource(
    State(state): State<AppState>,
    Json(req): Json<DeleteRequest>,
) -> Result<Json<serde_json::Value>> {
    state.datasources.write().await.remove(&req.id);
    state.serving.write().await.remove(&req.id);
    Ok(Json(serde_json::json!({ "removed": req.id })))
}

#[derive(Debug, Deserialize)]
struct LoadFilesRequest {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
struct LoadFilesReport {
    load_vector_datasources: usize,
    load_raster_datasources: usize,
    errors: Vec<String>,
}

/// Batch-ingests DataSources from a folder of raster files (spec §6
/// `load_files`). Each recognized raster (`.tif`/`.tiff`) becomes a
/// world-bounds placeholder DataSource the catalog can refine via a
/// follow-up upsert; vector ingestion has no on-disk format to scan for
/// (vector sources come from a spatial database, not files).
async fn load_files(
    State(state): State<AppState>,
    Json(req): Json<LoadFilesRequest>,
) -> std::result::Result<Json<LoadFilesReport>, (StatusCode, Json<LoadFilesReport>)> {
    let mut report = LoadFilesReport {
        load_vector_datasources: 0,
        load_raster_datasources: 0,
        errors: Vec::new(),
    };

    let entries = match std::fs::read_dir(&req.path) {
        Ok(entries) => entries,
        Err(e) => {
            report.errors.push(format!("{}: {e}", req.path.display()));
            return Err((StatusCode::INTERNAL_SERVER_ERROR, Json(report)));
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                report.errors.push(e.to_string());
                continue;
            }
        };
        let path = entry.path();
        let is_raster = matches!(
            path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()),
            Some(ext) if ext == "tif" || ext == "tiff"
        );
        if !is_raster {
            continue;
        }

        let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            report.errors.push(format!("{}: unreadable file stem", path.display()));
            continue;
        };

        let ds = DataSourceConfig {
            id: id.clone(),
            kind: DataSourceKind::Raster,
            bounds: [-180.0, -85.051_128_78, 180.0, 85.051_128_78],
            center: None,
            minzoom: 0,
            maxzoom: 14,
            data_store: DataStore::File { path },
            pyramid: Default::default(),
            layers: Vec::new(),
        };

        state.datasources.write().await.insert(id, ds);
        report.load_raster_datasources += 1;
    }

    Ok(Json(report))
}

async fn openapi_json(State(_state): State<AppState>) -> Json<serde_json::Value> {
    Json(crate::openapi::generate_openapi_spec(
        "http://localhost:8080",
        env!("CARGO_PKG_VERSION"),
    ))
}

async fn swagger_ui() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head><title>tileserver-rs API docs</title>
<link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist/swagger-ui.css" />
</head>
<body>
<div id="swagger-ui"></div>
<script src="https://unpkg.com/swagger-ui-dist/swagger-ui-bundle.js"></script>
<script>
window.onload = () => SwaggerUIBundle({ url: "/api/openapi.json", dom_id: "#swagger-ui" });
</script>
</body>
</html>"#,
    )
}

pub fn build_cors(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    CorsLayer::new().allow_origin(origins)
}

/// Builds the full `/api/*` router with every middleware layer the server
/// binary installs (request logging, tracing, compression, CORS, CSP).
pub fn build_router(state: AppState, cors_origins: &[String]) -> Router {
    let cors = build_cors(cors_origins);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/tile/{datasource}/{z}/{x}/{y_ext}", get(get_tile))
        .route("/api/pyramid", post(launch_pyramid))
        .route(
            "/api/datasources",
            get(list_datasources)
                .post(upsert_datasource)
                .put(upsert_datasource)
                .delete(delete_datasource),
        )
        .route("/api/datasources/{id}", get(get_datasource))
        .route("/api/datasources/load_files", post(load_files))
        .route("/api/openapi.json", get(openapi_json))
        .route("/api/docs", get(swagger_ui))
        .with_state(state)
        .layer(axum::middleware::from_fn(request_logger))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static("default-src 'self'"),
        ))
}

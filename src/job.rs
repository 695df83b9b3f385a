//! Pyramid job orchestrator (spec §3 `PyramidJob`, §4.7 lifecycle).
//!
//! Wires C3 (preprocess) -> C4 (mosaic, when merging) -> C6 (planner) ->
//! C7 (parallel engine) -> C8 (sink), bracketed by C9 (registry). Grounded on
//! the reference tiler's top-level `tiler.py` driver, expressed through the
//! module seams the rest of this crate already builds rather than one
//! monolithic script.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use image::{ImageBuffer, Luma, Rgba};
use tokio::sync::mpsc;

use crate::config::{DataSourceConfig, DataStore, PyramidEngineConfig, PyramidOptions};
use crate::error::{Result, TileServerError};
use crate::grid::MercatorGrid;
use crate::raster::adapter::GdalRasterAdapter;
use crate::raster::mosaic::merge_rasters;
use crate::raster::preprocess::{preprocess, PreprocessOptions};
use crate::raster::{encode, RasterAdapter};
use crate::registry::JobRegistry;
use crate::sink::{ArchiveSink, FsSink, TileSink};
use crate::tiling::engine::{PyramidEngine, TileEvent, TileOutcome};
use crate::tiling::planner::{compute_window, plan_tiles, RasterGeometry, TileDetail, OVERSAMPLE};
use crate::tiling::sidecar::{SidecarDb, TileJobRow};

/// Response body for `POST /pyramid` (spec §6).
#[derive(Debug, Clone, serde::Serialize)]
pub struct PyramidLaunch {
    pub pyramid_id: String,
    pub already_running: bool,
}

/// Tallies from a finished pyramid build. Not part of the HTTP response
/// (the client only ever sees [`PyramidLaunch`]) but useful for logs/tests.
#[derive(Debug, Clone, Default)]
pub struct PyramidJobReport {
    pub emitted: usize,
    pub skipped_nodata: usize,
    pub failed: usize,
    pub dropped: usize,
}

fn new_job_id(datasource_id: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{datasource_id}-{nanos:x}")
}

fn input_paths(store: &DataStore) -> Result<Vec<PathBuf>> {
    match store {
        DataStore::File { path } => Ok(vec![path.clone()]),
        DataStore::Folder { path } => {
            let mut paths = Vec::new();
            for entry in std::fs::read_dir(path)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    paths.push(entry.path());
                }
            }
            paths.sort();
            if paths.is_empty() {
                return Err(TileServerError::MissingPrerequisite(format!(
                    "folder {} contains no input files",
                    path.display()
                )));
            }
            Ok(paths)
        }
        DataStore::ExternalTemplate { .. } | DataStore::ExternalArchive { .. } => Err(
            TileServerError::MissingPrerequisite(
                "pyramid build requires a local file or folder data store".to_string(),
            ),
        ),
    }
}

fn dataset_label(store: &DataStore) -> String {
    match store {
        DataStore::File { path } | DataStore::Folder { path } | DataStore::ExternalArchive { path } => {
            path.display().to_string()
        }
        DataStore::ExternalTemplate { url_template } => url_template.clone(),
    }
}

/// Launches (or joins) a pyramid build for `ds`, honoring invariant 5 (at
/// most one running job per datasource — spec §8, scenario S5). Returns
/// immediately; the build itself runs detached.
///
/// `work_dir` is the scratch root (`data/`, preprocessing artifacts land
/// under `work_dir/<id>/`); `tiles_root` is the filesystem-sink root
/// (`tiles/`), used when `ds.pyramid.archive` is false.
pub async fn launch(
    registry: Arc<JobRegistry>,
    ds: DataSourceConfig,
    engine_config: PyramidEngineConfig,
    work_dir: PathBuf,
    tiles_root: PathBuf,
) -> Result<PyramidLaunch> {
    let running_registry = registry.clone();
    let datasource_id = ds.id.clone();
    let existing = tokio::task::spawn_blocking(move || running_registry.running_for(&datasource_id))
        .await
        .map_err(|e| TileServerError::Internal(anyhow::anyhow!("registry task panicked: {e}")))??;
    if let Some(existing) = existing {
        return Ok(PyramidLaunch {
            pyramid_id: existing,
            already_running: true,
        });
    }

    let job_id = new_job_id(&ds.id);
    let params = serde_json::to_string(&ds.pyramid).unwrap_or_default();

    let register_registry = registry.clone();
    let register_job_id = job_id.clone();
    let register_ds_id = ds.id.clone();
    let register_dataset = dataset_label(&ds.data_store);
    tokio::task::spawn_blocking(move || {
        register_registry.register(&register_job_id, &register_ds_id, &register_dataset, &params)
    })
    .await
    .map_err(|e| TileServerError::Internal(anyhow::anyhow!("registry task panicked: {e}")))??;

    let job_id_for_task = job_id.clone();
    tokio::spawn(async move {
        let result = run_job(ds, engine_config, work_dir, tiles_root).await;
        match result {
            Ok(report) => tracing::info!(
                job_id = %job_id_for_task,
                emitted = report.emitted,
                skipped_nodata = report.skipped_nodata,
                failed = report.failed,
                dropped = report.dropped,
                "pyramid build complete"
            ),
            Err(e) => tracing::error!(job_id = %job_id_for_task, error = %e, "pyramid build failed"),
        }
        let finish_job_id = job_id_for_task.clone();
        let finish_result = tokio::task::spawn_blocking(move || registry.finish(&finish_job_id)).await;
        match finish_result {
            Ok(Err(e)) => tracing::error!(job_id = %job_id_for_task, error = %e, "failed to record job completion"),
            Err(e) => tracing::error!(job_id = %job_id_for_task, error = %e, "registry task panicked"),
            Ok(Ok(())) => {}
        }
    });

    Ok(PyramidLaunch {
        pyramid_id: job_id,
        already_running: false,
    })
}

async fn run_job(
    ds: DataSourceConfig,
    engine_config: PyramidEngineConfig,
    work_dir: PathBuf,
    tiles_root: PathBuf,
) -> Result<PyramidJobReport> {
    let ds_work_dir = work_dir.join(&ds.id);
    let inputs = input_paths(&ds.data_store)?;

    let target_srs_wkt = gdal::spatial_ref::SpatialRef::from_epsg(3857)
        .and_then(|sr| sr.to_wkt())
        .map_err(|e| TileServerError::UnknownSrs(format!("EPSG:3857: {e}")))?;

    let preprocess_opts = PreprocessOptions {
        target_srs_wkt,
        tile_size: ds.pyramid.tile_size,
        warp_resampling: ds.pyramid.resampling,
        overview_resampling: ds.pyramid.resampling,
    };

    let mut preprocessed_paths = Vec::with_capacity(inputs.len());
    for input in &inputs {
        let input = input.clone();
        let work_dir = ds_work_dir.clone();
        let opts = preprocess_opts.clone();
        let pre = tokio::task::spawn_blocking(move || preprocess(&input, &work_dir, &opts))
            .await
            .map_err(|e| TileServerError::Internal(anyhow::anyhow!("preprocess task panicked: {e}")))??;
        preprocessed_paths.push(pre.path);
    }

    let grid = MercatorGrid::new(ds.pyramid.tile_size);
    let [w, s, e, n] = ds.bounds;
    let (min_x, min_y) = grid.latlon_to_meters(w, s);
    let (max_x, max_y) = grid.latlon_to_meters(e, n);
    let envelope = (min_x.min(max_x), min_y.min(max_y), min_x.max(max_x), min_y.max(max_y));

    let primary_path = preprocessed_paths[0].clone();
    let raster_geometry: RasterGeometry = tokio::task::spawn_blocking(move || -> Result<RasterGeometry> {
        let adapter = GdalRasterAdapter::open(&primary_path)?;
        Ok(RasterGeometry {
            geotransform: adapter.geotransform(),
            size: adapter.size(),
        })
    })
    .await
    .map_err(|e| TileServerError::Internal(anyhow::anyhow!("raster geometry task panicked: {e}")))??;

    let tiles = plan_tiles(envelope, ds.minzoom, ds.maxzoom, &grid, Some(&raster_geometry));

    let sink: Box<dyn TileSink> = if ds.pyramid.archive {
        let archive_path = tiles_root.join(format!("{}.mbtiles", ds.id));
        Box::new(ArchiveSink::open(
            &archive_path,
            engine_config.busy_retry_attempts,
            engine_config.busy_retry_backoff_ms,
        )?)
    } else {
        Box::new(FsSink::new(&tiles_root, &ds.id, "png"))
    };

    write_sidecar(&ds, &ds_work_dir, &preprocessed_paths, &grid, envelope, &tiles).await?;

    let (results_tx, results_rx) = mpsc::channel::<TileEvent>(64);
    let sidecar_path = ds_work_dir.join(format!("{}.db", ds.id));
    let sink_task = tokio::spawn(drain_sink(sink, results_rx, sidecar_path));

    let pyramid_opts = ds.pyramid.clone();
    let paths_for_workers = preprocessed_paths.clone();
    let grid_for_workers = grid;

    let engine = PyramidEngine::new(ds.id.clone(), &engine_config);
    let report = engine
        .run(
            tiles,
            move || {
                let adapters: Result<Vec<GdalRasterAdapter>> = paths_for_workers
                    .iter()
                    .map(|p| GdalRasterAdapter::open(p))
                    .collect();
                let mut adapters = adapters?;
                let opts = pyramid_opts.clone();
                let grid = grid_for_workers;
                Ok(move |detail: TileDetail| render_tile(&mut adapters, &detail, &opts, &grid))
            },
            results_tx,
        )
        .await;

    let sink = sink_task
        .await
        .map_err(|e| TileServerError::Internal(anyhow::anyhow!("sink task panicked: {e}")))??;
    sink.close()?;

    if engine_config.remove_processing_raster_files {
        for path in &preprocessed_paths {
            let _ = std::fs::remove_file(path);
        }
    }

    Ok(PyramidJobReport {
        emitted: report.emitted,
        skipped_nodata: report.skipped_nodata,
        failed: report.failed,
        dropped: report.dropped,
    })
}

/// Persists the planner's output and the `TileJob` parameters the run used
/// into the per-dataset sidecar database (spec §4.6, §6), ahead of handing
/// tiles to the engine.
async fn write_sidecar(
    ds: &DataSourceConfig,
    ds_work_dir: &Path,
    preprocessed_paths: &[PathBuf],
    grid: &MercatorGrid,
    envelope: (f64, f64, f64, f64),
    tiles: &[TileDetail],
) -> Result<()> {
    let sidecar_path = ds_work_dir.join(format!("{}.db", ds.id));
    let assets: Vec<String> = preprocessed_paths.iter().map(|p| p.display().to_string()).collect();
    let primary_asset = assets.first().cloned().unwrap_or_default();
    let opts = ds.pyramid.clone();
    let minzoom = ds.minzoom;
    let maxzoom = ds.maxzoom;
    let tiles = tiles.to_vec();
    let grid = *grid;

    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut db = SidecarDb::open(&sidecar_path)?;
        db.write_tile_job(&TileJobRow {
            data_bands_count: 1,
            nodata: None,
            src_file: &primary_asset,
            tile_extension: if opts.archive { "mbtiles" } else { "png" },
            tile_size: opts.tile_size,
            tile_driver: "PNG",
            profile: "mercator",
            querysize: opts.tile_size * OVERSAMPLE,
            xyz: !opts.tms,
            in_file: &primary_asset,
            input_file: &primary_asset,
            encode_to_rgba: opts.encode_to_rgba,
            has_alpha_band: opts.encode_to_rgba,
            pixel_selection_method: opts.pixel_selection,
            resampling_method: opts.resampling,
            merge: opts.merge,
        })?;
        for asset in &assets {
            db.write_asset(asset)?;
        }
        db.write_tminz_tmaxz(minzoom, maxzoom, &primary_asset)?;
        for z in minzoom..=maxzoom {
            let (tminx, tmaxx, tminy, tmaxy) = grid.tile_range_for_bounds(envelope, z);
            db.write_tminmax(z, tminx, tmaxx, tminy, tmaxy, &primary_asset)?;
        }
        db.write_tile_details(&tiles)?;
        Ok(())
    })
    .await
    .map_err(|e| TileServerError::Internal(anyhow::anyhow!("sidecar task panicked: {e}")))?
}

async fn drain_sink(
    mut sink: Box<dyn TileSink>,
    mut rx: mpsc::Receiver<TileEvent>,
    sidecar_path: PathBuf,
) -> Result<Box<dyn TileSink>> {
    let mut empty: Vec<(u8, u32, u32)> = Vec::new();
    while let Some(event) = rx.recv().await {
        match event {
            TileEvent::Tile(tile) => {
                if let Err(e) = sink.write_tile(tile.tz, tile.tx, tile.ty, &tile.bytes) {
                    tracing::error!(tz = tile.tz, tx = tile.tx, ty = tile.ty, error = %e, "sink write failed");
                }
            }
            TileEvent::Empty { tz, tx, ty } => empty.push((tz, tx, ty)),
        }
    }

    if !empty.is_empty() {
        let result = tokio::task::spawn_blocking(move || -> Result<()> {
            let db = SidecarDb::open(&sidecar_path)?;
            for (z, x, y) in empty {
                db.mark_empty_tile(z, x, y)?;
            }
            Ok(())
        })
        .await;
        match result {
            Ok(Err(e)) => tracing::error!(error = %e, "failed to persist empty tiles to sidecar"),
            Err(e) => tracing::error!(error = %e, "sidecar empty-tile task panicked"),
            Ok(Ok(())) => {}
        }
    }

    Ok(sink)
}

/// Box-downsamples an oversampled `src_w × src_h` buffer down to
/// `dst_w × dst_h`, averaging only the pixels each destination cell's source
/// mask marks valid (spec §3/§4.7 step 2: "oversampled `querysize` read
/// down-sampled to `tile_size`" for high-quality antialiasing instead of one
/// direct resample).
fn downsample_box(src: &[f32], src_mask: &[bool], src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> (Vec<f32>, Vec<bool>) {
    let mut out = vec![0.0f32; (dst_w * dst_h) as usize];
    let mut out_mask = vec![false; (dst_w * dst_h) as usize];
    if dst_w == 0 || dst_h == 0 || src_w == 0 || src_h == 0 {
        return (out, out_mask);
    }

    for dy in 0..dst_h {
        let sy0 = (dy as u64 * src_h as u64 / dst_h as u64) as u32;
        let sy1 = (((dy + 1) as u64 * src_h as u64).div_ceil(dst_h as u64) as u32)
            .max(sy0 + 1)
            .min(src_h);
        for dx in 0..dst_w {
            let sx0 = (dx as u64 * src_w as u64 / dst_w as u64) as u32;
            let sx1 = (((dx + 1) as u64 * src_w as u64).div_ceil(dst_w as u64) as u32)
                .max(sx0 + 1)
                .min(src_w);

            let mut sum = 0.0f64;
            let mut n = 0u32;
            for sy in sy0..sy1 {
                for sx in sx0..sx1 {
                    let idx = (sy * src_w + sx) as usize;
                    if src_mask[idx] {
                        sum += src[idx] as f64;
                        n += 1;
                    }
                }
            }
            let out_idx = (dy * dst_w + dx) as usize;
            if n > 0 {
                out[out_idx] = (sum / n as f64) as f32;
                out_mask[out_idx] = true;
            }
        }
    }

    (out, out_mask)
}

/// Renders one planned tile against already-open adapters: for each, computes
/// an oversampled read window (§4.7 step 2), downsamples it, pastes it into
/// the tile canvas, then merges (C4) when more than one input covers the tile
/// and encodes the result either as a plain visual PNG or, when
/// `opts.encode_to_rgba` is set, as a float-packed RGBA PNG (C5). Exposed
/// beyond this module so the on-demand serving path (main.rs) can reuse the
/// exact same window/merge/encode logic a batch pyramid build uses.
pub fn render_tile(
    adapters: &mut [GdalRasterAdapter],
    detail: &TileDetail,
    opts: &PyramidOptions,
    _grid: &MercatorGrid,
) -> Result<TileOutcome> {
    let tile_size = opts.tile_size;
    let len = (tile_size * tile_size) as usize;

    let mut windows: Vec<(Vec<f32>, Vec<bool>)> = Vec::with_capacity(adapters.len());
    let mut any_hit = false;

    for adapter in adapters.iter_mut() {
        let size = adapter.size();
        let geotransform = adapter.geotransform();
        let nodata = adapter.nodata();

        let mut canvas = vec![crate::raster::mosaic::MOSAIC_NODATA; len];
        let mut canvas_mask = vec![false; len];

        if let Some(w) = compute_window(geotransform, size, tile_size, detail.bounds) {
            any_hit = true;

            let scale_x = w.wxsize as f64 / tile_size as f64;
            let scale_y = w.wysize as f64 / tile_size as f64;
            let query_w = ((w.querysize as f64 * scale_x).round() as u32).max(1);
            let query_h = ((w.querysize as f64 * scale_y).round() as u32).max(1);

            let oversampled = adapter.read_window(w.rx, w.ry, w.rxsize, w.rysize, query_w, query_h, opts.resampling)?;
            let band = oversampled
                .bands
                .first()
                .cloned()
                .unwrap_or_else(|| vec![0.0; (query_w * query_h) as usize]);
            let src_mask: Vec<bool> = band
                .iter()
                .map(|&v| match nodata {
                    Some(nd) => (v as f64 - nd).abs() > 1e-9,
                    None => true,
                })
                .collect();

            let (down, down_mask) = downsample_box(&band, &src_mask, query_w, query_h, w.wxsize, w.wysize);

            for row in 0..w.wysize {
                for col in 0..w.wxsize {
                    let dst_x = w.wx + col;
                    let dst_y = w.wy + row;
                    if dst_x >= tile_size || dst_y >= tile_size {
                        continue;
                    }
                    let src_idx = (row * w.wxsize + col) as usize;
                    let dst_idx = (dst_y * tile_size + dst_x) as usize;
                    canvas[dst_idx] = down[src_idx];
                    canvas_mask[dst_idx] = down_mask[src_idx];
                }
            }
        }

        windows.push((canvas, canvas_mask));
    }

    if !any_hit {
        return Ok(TileOutcome::EmptyNodata);
    }

    let merged = if windows.len() > 1 || opts.merge {
        merge_rasters(opts.pixel_selection, &windows, crate::raster::mosaic::MOSAIC_NODATA)
    } else {
        windows.into_iter().next().map(|(d, _)| d).unwrap_or_default()
    };

    if merged.iter().all(|&v| v == crate::raster::mosaic::MOSAIC_NODATA) {
        return Ok(TileOutcome::EmptyNodata);
    }

    let bytes = if opts.encode_to_rgba {
        encode_rgba_tile(&merged, crate::raster::mosaic::MOSAIC_NODATA as f64, opts.nodata_tolerance, tile_size)?
    } else {
        encode_grayscale_tile(&merged, crate::raster::mosaic::MOSAIC_NODATA, tile_size)?
    };

    Ok(TileOutcome::Emitted(bytes))
}

fn encode_rgba_tile(values: &[f32], nodata: f64, tolerance: f64, tile_size: u32) -> Result<Vec<u8>> {
    let mut img: ImageBuffer<Rgba<u8>, Vec<u8>> = ImageBuffer::new(tile_size, tile_size);
    for (i, &v) in values.iter().enumerate() {
        let x = (i as u32) % tile_size;
        let y = (i as u32) / tile_size;
        let rgba = encode::encode(v as f64, nodata, tolerance);
        img.put_pixel(x, y, Rgba(rgba));
    }
    encode_png(&img)
}

fn encode_grayscale_tile(values: &[f32], nodata: f32, tile_size: u32) -> Result<Vec<u8>> {
    let mut img: ImageBuffer<Luma<u8>, Vec<u8>> = ImageBuffer::new(tile_size, tile_size);
    for (i, &v) in values.iter().enumerate() {
        let x = (i as u32) % tile_size;
        let y = (i as u32) / tile_size;
        let gray = if v == nodata { 0 } else { v.clamp(0.0, 255.0) as u8 };
        img.put_pixel(x, y, Luma([gray]));
    }
    encode_png(&img)
}

fn encode_png<P, C>(img: &ImageBuffer<P, C>) -> Result<Vec<u8>>
where
    P: image::Pixel<Subpixel = u8> + image::PixelWithColorType,
    C: std::ops::Deref<Target = [u8]>,
{
    let mut bytes = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut bytes);
    img.write_to(&mut cursor, image::ImageFormat::Png)
        .map_err(|e| TileServerError::RasterError(format!("PNG encode: {e}")))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downsample_box_averages_only_valid_pixels() {
        // 4x4 source, top-left 2x2 quadrant nodata, rest value 10.0; downsampled to 2x2.
        let src = vec![
            0.0, 0.0, 10.0, 10.0,
            0.0, 0.0, 10.0, 10.0,
            10.0, 10.0, 10.0, 10.0,
            10.0, 10.0, 10.0, 10.0,
        ];
        let mask = vec![
            false, false, true, true,
            false, false, true, true,
            true, true, true, true,
            true, true, true, true,
        ];
        let (down, down_mask) = downsample_box(&src, &mask, 4, 4, 2, 2);
        assert_eq!(down.len(), 4);
        assert!(!down_mask[0], "quadrant with no valid pixels stays masked out");
        assert!(down_mask[1] && down_mask[2] && down_mask[3]);
        assert_eq!(down[1], 10.0);
    }

    #[test]
    fn downsample_box_handles_degenerate_dimensions() {
        let (down, mask) = downsample_box(&[1.0], &[true], 1, 1, 0, 0);
        assert!(down.is_empty() && mask.is_empty());
    }
}

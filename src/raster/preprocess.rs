//! Preprocessor (C3): warp → internal-tiled translate → external overviews.
//!
//! Mirrors the reference tiler's `tiles_processing.py` GDAL pipeline (warp to
//! target SRS when needed, `gdal_translate`-equivalent tiling, then
//! `gdaladdo`-equivalent overview building), expressed through the `gdal`
//! crate's `Dataset`/driver API instead of shelling out to the CLI tools.

use std::path::{Path, PathBuf};

use gdal::raster::ResampleAlg;
use gdal::{Dataset, DriverManager};

use crate::config::ResamplingMethod;
use crate::error::{Result, TileServerError};
use crate::raster::adapter::is_bigtiff;

/// Threshold (bytes) above which output is written as BigTIFF even if the
/// source wasn't already BigTIFF (spec §4.3: "source exceeds ~3.7 GB").
const BIGTIFF_THRESHOLD_BYTES: u64 = 3_700_000_000;

#[derive(Debug, Clone)]
pub struct PreprocessOptions {
    pub target_srs_wkt: String,
    pub tile_size: u32,
    pub warp_resampling: ResamplingMethod,
    pub overview_resampling: ResamplingMethod,
}

/// Result of preprocessing: the path to the tiling-ready raster plus whether
/// a warp step actually ran (informs the on-disk artifact naming in spec §6).
#[derive(Debug, Clone)]
pub struct PreprocessedRaster {
    pub path: PathBuf,
    pub warped: bool,
}

/// Runs the full pipeline for `input` under `work_dir`, producing
/// `<stem>_TR_OV.tif` (or `<stem>_WARP_TR_OV.tif` if a warp step ran).
///
/// Step 1 of spec §4.3: if the output already exists, preprocessing is
/// skipped and the existing file is reused.
pub fn preprocess(
    input: &Path,
    work_dir: &Path,
    opts: &PreprocessOptions,
) -> Result<PreprocessedRaster> {
    std::fs::create_dir_all(work_dir)?;

    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| TileServerError::RasterError(format!("invalid input path {}", input.display())))?;

    let needs_warp = dataset_srs_wkt(input)? != Some(opts.target_srs_wkt.clone());

    let suffix = if needs_warp { "_WARP_TR_OV.tif" } else { "_TR_OV.tif" };
    let output = work_dir.join(format!("{stem}{suffix}"));

    if output.exists() {
        tracing::info!(path = %output.display(), "reusing existing preprocessed raster");
        return Ok(PreprocessedRaster {
            path: output,
            warped: needs_warp,
        });
    }

    let translate_source = if needs_warp {
        let warped = work_dir.join(format!("{stem}_WARP.tif"));
        warp_to_srs(input, &warped, &opts.target_srs_wkt, opts.warp_resampling)?;
        warped
    } else {
        input.to_path_buf()
    };

    translate_tiled(&translate_source, &output, opts.tile_size)?;
    build_overviews(&output, opts.tile_size, opts.overview_resampling)?;

    if needs_warp {
        let _ = std::fs::remove_file(&translate_source);
    }

    Ok(PreprocessedRaster {
        path: output,
        warped: needs_warp,
    })
}

fn dataset_srs_wkt(path: &Path) -> Result<Option<String>> {
    let dataset = Dataset::open(path)
        .map_err(|e| TileServerError::RasterError(format!("open {}: {}", path.display(), e)))?;
    Ok(dataset.spatial_ref().ok().and_then(|sr| sr.to_wkt().ok()))
}

/// Step 2: warp to the target SRS, multi-threaded, using the configured
/// warp-resampling algorithm.
fn warp_to_srs(
    input: &Path,
    output: &Path,
    target_srs_wkt: &str,
    resampling: ResamplingMethod,
) -> Result<()> {
    let src = Dataset::open(input)
        .map_err(|e| TileServerError::RasterError(format!("open {}: {}", input.display(), e)))?;

    let dst_srs = gdal::spatial_ref::SpatialRef::from_wkt(target_srs_wkt)
        .map_err(|e| TileServerError::UnknownSrs(format!("invalid target SRS: {e}")))?;

    let alg = match resampling {
        ResamplingMethod::Nearest => ResampleAlg::NearestNeighbour,
        ResamplingMethod::Bilinear => ResampleAlg::Bilinear,
        ResamplingMethod::Cubic => ResampleAlg::Cubic,
        ResamplingMethod::CubicSpline => ResampleAlg::CubicSpline,
        ResamplingMethod::Lanczos => ResampleAlg::Lanczos,
        ResamplingMethod::Average => ResampleAlg::Average,
        ResamplingMethod::Mode => ResampleAlg::Mode,
    };

    gdal::raster::reproject(&src, &dst_srs, output, alg)
        .map_err(|e| TileServerError::RasterError(format!("warp: {e}")))?;

    Ok(())
}

/// Step 3: write an internally block-tiled GeoTIFF with
/// `BLOCKXSIZE=BLOCKYSIZE=tile_size`, `INTERLEAVE=BAND`, and a compression /
/// BigTIFF policy matching spec §4.3.
fn translate_tiled(input: &Path, output: &Path, tile_size: u32) -> Result<()> {
    let src = Dataset::open(input)
        .map_err(|e| TileServerError::RasterError(format!("open {}: {}", input.display(), e)))?;

    let src_size_bytes = std::fs::metadata(input).map(|m| m.len()).unwrap_or(0);
    let big = src_size_bytes > BIGTIFF_THRESHOLD_BYTES || is_bigtiff(input).unwrap_or(false);

    let mut options = vec![
        format!("BLOCKXSIZE={tile_size}"),
        format!("BLOCKYSIZE={tile_size}"),
        "TILED=YES".to_string(),
        "INTERLEAVE=BAND".to_string(),
    ];
    if big {
        options.push("COMPRESS=LZW".to_string());
        options.push("BIGTIFF=YES".to_string());
    } else {
        options.push("COMPRESS=PACKBITS".to_string());
    }

    let driver = DriverManager::get_driver_by_name("GTiff")
        .map_err(|e| TileServerError::RasterError(format!("GTiff driver: {e}")))?;

    let opt_refs: Vec<&str> = options.iter().map(|s| s.as_str()).collect();
    driver
        .create_copy(&src, output, &opt_refs)
        .map_err(|e| TileServerError::RasterError(format!("translate: {e}")))?;

    Ok(())
}

/// Step 4: add external overview levels `2, 4, …, 2^L` where
/// `L = ⌈log₂(max(xsize, ysize)/tile_size)⌉`.
fn build_overviews(path: &Path, tile_size: u32, resampling: ResamplingMethod) -> Result<()> {
    let dataset = Dataset::open(path)
        .map_err(|e| TileServerError::RasterError(format!("open {}: {}", path.display(), e)))?;
    let (xsize, ysize) = dataset.raster_size();
    let levels = crate::grid::raw_raster_native_zoom(xsize as u32, ysize as u32, tile_size);

    if levels == 0 {
        return Ok(());
    }

    let factors: Vec<i32> = (1..=levels).map(|l| 1i32 << l).collect();
    let alg_name = match resampling {
        ResamplingMethod::Nearest => "NEAREST",
        ResamplingMethod::Bilinear => "BILINEAR",
        ResamplingMethod::Cubic => "CUBIC",
        ResamplingMethod::CubicSpline => "CUBICSPLINE",
        ResamplingMethod::Lanczos => "LANCZOS",
        ResamplingMethod::Average => "AVERAGE",
        ResamplingMethod::Mode => "MODE",
    };

    dataset
        .build_overviews(alg_name, &factors, &[])
        .map_err(|e| TileServerError::RasterError(format!("build overviews: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bigtiff_threshold_matches_spec_proxy() {
        // Spec's ~3.7 GB cutoff sits comfortably under the classic-TIFF 4 GiB
        // offset ceiling; just sanity check the constant's rough magnitude.
        assert!(BIGTIFF_THRESHOLD_BYTES < 4 * 1024 * 1024 * 1024);
        assert!(BIGTIFF_THRESHOLD_BYTES > 3 * 1024 * 1024 * 1024);
    }
}

//! Raster-side components of the tile-pyramid production engine:
//! C2 (adapter), C3 (preprocessor), C4 (mosaic merger), C5 (RGBA encoder).

pub mod encode;
pub mod mosaic;
pub mod preprocess;

#[cfg(feature = "raster")]
pub mod adapter;

use crate::config::ResamplingMethod;
use crate::error::Result;

/// One data band's worth of decoded pixels plus its validity mask, read from
/// a window of a raster dataset and already resampled to the requested
/// output size (spec §4.2).
#[derive(Debug, Clone)]
pub struct RasterWindow {
    pub width: u32,
    pub height: u32,
    pub bands: Vec<Vec<f32>>,
    pub nodata: Option<f64>,
}

/// Raster adapter (C2): open/read-window/resample/bounds over a georeferenced
/// raster dataset. A narrow trait so C7/C11 depend on this abstraction rather
/// than directly on `gdal::Dataset`, mirroring the `TileSource` seam in
/// `crate::sources`.
///
/// *Contract*: implementations must be safe for concurrent reads of disjoint
/// windows of the *same* open handle, but must never be shared across worker
/// tasks/processes — each worker opens its own handle (spec §4.2, §5).
pub trait RasterAdapter: Send {
    /// Number of raster bands.
    fn band_count(&self) -> usize;

    /// Geotransform `[origin_x, pixel_w, row_rot, origin_y, col_rot, pixel_h]`.
    fn geotransform(&self) -> [f64; 6];

    /// Raster size in pixels `(xsize, ysize)`.
    fn size(&self) -> (u32, u32);

    /// Spatial reference as WKT, if known.
    fn srs_wkt(&self) -> Option<String>;

    /// Per-band nodata sentinel, if set.
    fn nodata(&self) -> Option<f64>;

    /// `true` if the dataset carries a dedicated alpha/mask band.
    fn has_alpha_band(&self) -> bool;

    /// Reads a window `(rx, ry, rxsize, rysize)` in source pixels and
    /// resamples it to `(out_w, out_h)` using `resampling`.
    fn read_window(
        &mut self,
        rx: i64,
        ry: i64,
        rxsize: u32,
        rysize: u32,
        out_w: u32,
        out_h: u32,
        resampling: ResamplingMethod,
    ) -> Result<RasterWindow>;
}

/// Geographic envelope `(west, south, east, north)` in the dataset's own SRS
/// units (meters for Web-Mercator, degrees for Geodetic).
pub fn dataset_envelope(geotransform: [f64; 6], xsize: u32, ysize: u32) -> (f64, f64, f64, f64) {
    let [ox, pw, _, oy, _, ph] = geotransform;
    let x0 = ox;
    let x1 = ox + pw * xsize as f64;
    let y0 = oy;
    let y1 = oy + ph * ysize as f64;
    (x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_handles_negative_pixel_height() {
        // North-up rasters have a negative pixel height (row origin at the top).
        let gt = [0.0, 1.0, 0.0, 100.0, 0.0, -1.0];
        let (w, s, e, n) = dataset_envelope(gt, 100, 100);
        assert_eq!((w, s, e, n), (0.0, 0.0, 100.0, 100.0));
    }
}

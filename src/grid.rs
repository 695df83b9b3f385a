//! Tiling-grid math (C1): meters↔tile↔lon/lat conversions, tile bounds,
//! per-zoom tile ranges, and XYZ/TMS address conversion.
//!
//! The Web-Mercator formulas mirror the reference tiler's `GlobalMercator`
//! class; they are kept as free functions over an explicit `tile_size`
//! rather than a stateful object, since nothing here carries mutable state.

use std::f64::consts::PI;

/// WGS84 semi-major axis in meters, the Web-Mercator sphere radius.
pub const EARTH_RADIUS: f64 = 6_378_137.0;

/// Maximum absolute latitude representable in Web-Mercator (EPSG:3857).
pub const MAX_LATITUDE: f64 = 85.05112878;

/// A `(z, x, y)` tile address. `z` is the zoom level, `x`/`y` are the
/// column/row under the XYZ convention (origin top-left).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileAddress {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileAddress {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// `true` iff `0 ≤ z ≤ 20` and `0 ≤ x, y < 2^z` (spec invariant 1).
    pub fn is_valid(&self) -> bool {
        if self.z > 20 {
            return false;
        }
        let max = 1u32 << self.z;
        self.x < max && self.y < max
    }

    /// Converts an XYZ row to the TMS row: `y_tms = (2^z − 1) − y_xyz`.
    pub fn to_tms_row(&self) -> u32 {
        xyz_to_tms_row(self.z, self.y)
    }
}

/// `y_tms = (2^z − 1) − y_xyz`. Self-inverse: applying it twice is the identity
/// (spec invariant 7).
pub fn xyz_to_tms_row(z: u8, y_xyz: u32) -> u32 {
    let max = (1u32 << z) - 1;
    max - y_xyz
}

/// Web-Mercator tiling grid for a configurable tile size (default 256px).
#[derive(Debug, Clone, Copy)]
pub struct MercatorGrid {
    pub tile_size: u32,
}

impl Default for MercatorGrid {
    fn default() -> Self {
        Self { tile_size: 256 }
    }
}

impl MercatorGrid {
    pub fn new(tile_size: u32) -> Self {
        Self { tile_size }
    }

    /// `resolution(z) = 2·π·R / (tile_size · 2^z)`, the ground size in meters
    /// of one pixel at zoom `z`.
    pub fn resolution(&self, z: u8) -> f64 {
        (2.0 * PI * EARTH_RADIUS) / (self.tile_size as f64 * (1u64 << z) as f64)
    }

    /// The largest `z` such that `resolution(z) ≥ px`. `resolution` is
    /// strictly decreasing in `z`, so the first `z` whose resolution drops
    /// below `px` is one zoom level too deep; step back to the previous one
    /// (clamped at 0).
    pub fn zoom_for_pixel_size(&self, px: f64) -> u8 {
        for z in 0..=20u8 {
            if self.resolution(z) < px {
                return z.saturating_sub(1);
            }
        }
        20
    }

    /// `meters_to_tile(mx, my, z)`: the `(tx, ty)` tile column/row (origin
    /// bottom-left / TMS convention, as in the reference implementation)
    /// containing the EPSG:3857 point `(mx, my)`.
    pub fn meters_to_tile(&self, mx: f64, my: f64, z: u8) -> (i64, i64) {
        let res = self.resolution(z);
        let origin = PI * EARTH_RADIUS;
        let tx = ((mx + origin) / (self.tile_size as f64 * res)).floor() as i64;
        let ty = ((my + origin) / (self.tile_size as f64 * res)).floor() as i64;
        (tx, ty)
    }

    /// The EPSG:3857 envelope `(min_x, min_y, max_x, max_y)` of tile
    /// `(tx, ty)` at zoom `z`, under the TMS (bottom-left origin) convention.
    pub fn tile_bounds(&self, tx: i64, ty: i64, z: u8) -> (f64, f64, f64, f64) {
        let res = self.resolution(z);
        let origin = PI * EARTH_RADIUS;
        let min_x = tx as f64 * self.tile_size as f64 * res - origin;
        let min_y = ty as f64 * self.tile_size as f64 * res - origin;
        let max_x = (tx + 1) as f64 * self.tile_size as f64 * res - origin;
        let max_y = (ty + 1) as f64 * self.tile_size as f64 * res - origin;
        (min_x, min_y, max_x, max_y)
    }

    /// Inverse Mercator projection, clamped to `|lat| ≤ 85.05112878°`.
    pub fn meters_to_latlon(&self, mx: f64, my: f64) -> (f64, f64) {
        let lon = (mx / EARTH_RADIUS).to_degrees();
        let lat = (2.0 * ((my / EARTH_RADIUS).exp().atan()) - PI / 2.0).to_degrees();
        (lon, lat.clamp(-MAX_LATITUDE, MAX_LATITUDE))
    }

    /// Forward Mercator projection from WGS84 degrees to EPSG:3857 meters.
    pub fn latlon_to_meters(&self, lon: f64, lat: f64) -> (f64, f64) {
        let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
        let mx = lon.to_radians() * EARTH_RADIUS;
        let my = ((PI / 4.0 + lat.to_radians() / 2.0).tan()).ln() * EARTH_RADIUS;
        (mx, my)
    }

    /// `(tminx, tmaxx, tminy, tmaxy)` covering an EPSG:3857 envelope at zoom
    /// `z`, clipped to the valid tile range `[0, 2^z − 1]`.
    pub fn tile_range_for_bounds(
        &self,
        bounds: (f64, f64, f64, f64),
        z: u8,
    ) -> (u32, u32, u32, u32) {
        let (w, s, e, n) = bounds;
        let (tminx, tminy) = self.meters_to_tile(w, s, z);
        let (tmaxx, tmaxy) = self.meters_to_tile(e, n, z);
        let max_tile = (1i64 << z) - 1;
        let clip = |v: i64| v.clamp(0, max_tile) as u32;
        (
            clip(tminx.min(tmaxx)),
            clip(tminx.max(tmaxx)),
            clip(tminy.min(tmaxy)),
            clip(tminy.max(tmaxy)),
        )
    }
}

/// Geodetic (EPSG:4326) grid: degrees-per-tile halves each zoom level,
/// starting from a 2x1 tile world at z=0.
#[derive(Debug, Clone, Copy)]
pub struct GeodeticGrid {
    pub tile_size: u32,
}

impl GeodeticGrid {
    pub fn new(tile_size: u32) -> Self {
        Self { tile_size }
    }

    /// Degrees per pixel at zoom `z`.
    pub fn resolution(&self, z: u8) -> f64 {
        180.0 / (self.tile_size as f64 * (1u64 << z) as f64)
    }

    pub fn lonlat_to_tile(&self, lon: f64, lat: f64, z: u8) -> (i64, i64) {
        let res = self.resolution(z);
        let tx = ((lon + 180.0) / (self.tile_size as f64 * res)).floor() as i64;
        let ty = ((lat + 90.0) / (self.tile_size as f64 * res)).floor() as i64;
        (tx, ty)
    }
}

/// Raw-raster profile: tiling directly in pixel space with no reprojection.
/// `nativezoom` is the zoom at which the raster's native pixel grid lines up
/// 1:1 with the tile grid.
///
/// Spec Open Question: the reference implementation computes this as
/// `⌈log(max(xsize, ysize) / tile_size) / log(2)⌉`, which for exact powers of
/// two can round one level too high due to floating-point log noise (e.g.
/// `log(1024/256)/log(2)` evaluating to `2.0000000000000004`). We preserve
/// the reference's rounding rule verbatim — resolved in DESIGN.md — because
/// the serving path and the preprocessor must agree on the same `nativezoom`,
/// and the reference behavior is what on-disk fixtures were generated against.
pub fn raw_raster_native_zoom(xsize: u32, ysize: u32, tile_size: u32) -> u8 {
    let max_dim = xsize.max(ysize).max(1) as f64;
    let ratio = max_dim / tile_size as f64;
    if ratio <= 1.0 {
        return 0;
    }
    ratio.log2().ceil() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_halves_each_zoom() {
        let grid = MercatorGrid::default();
        let r0 = grid.resolution(0);
        let r1 = grid.resolution(1);
        assert!((r0 / 2.0 - r1).abs() < 1e-9);
    }

    #[test]
    fn xyz_tms_roundtrip_is_identity() {
        for z in 0..6u8 {
            for y in 0..(1u32 << z) {
                let tms = xyz_to_tms_row(z, y);
                let back = xyz_to_tms_row(z, tms);
                assert_eq!(back, y);
            }
        }
    }

    #[test]
    fn tile_address_validity() {
        assert!(TileAddress::new(0, 0, 0).is_valid());
        assert!(TileAddress::new(21, 0, 0).is_valid() == false);
        assert!(TileAddress::new(2, 4, 0).is_valid() == false);
        assert!(TileAddress::new(2, 3, 3).is_valid());
    }

    #[test]
    fn zoom_for_pixel_size_picks_the_coarser_side_of_a_crossover() {
        let grid = MercatorGrid::default();
        let r10 = grid.resolution(10);
        let r11 = grid.resolution(11);
        let between = (r10 + r11) / 2.0;
        assert_eq!(grid.zoom_for_pixel_size(between), 10);
        assert_eq!(grid.zoom_for_pixel_size(r10), 10);
    }

    #[test]
    fn meters_to_latlon_clamped() {
        let grid = MercatorGrid::default();
        let (_, lat) = grid.meters_to_latlon(0.0, 1e20);
        assert!(lat <= MAX_LATITUDE);
    }

    #[test]
    fn s1_scenario_tile_range_at_z0_and_z1() {
        // S1: bounds (-1,-1,1,1) meters, minzoom=0 maxzoom=1 -> single root
        // tile at z=0 and exactly the four z=1 tiles.
        let grid = MercatorGrid::default();
        let bounds = (-1.0, -1.0, 1.0, 1.0);
        let (tminx, tmaxx, tminy, tmaxy) = grid.tile_range_for_bounds(bounds, 0);
        assert_eq!((tminx, tmaxx, tminy, tmaxy), (0, 0, 0, 0));
        let (tminx, tmaxx, tminy, tmaxy) = grid.tile_range_for_bounds(bounds, 1);
        assert_eq!(tminx, 0);
        assert_eq!(tmaxx, 1);
        assert_eq!(tminy, 0);
        assert_eq!(tmaxy, 1);
    }

    #[test]
    fn raw_raster_native_zoom_matches_reference_rounding() {
        assert_eq!(raw_raster_native_zoom(256, 256, 256), 0);
        assert_eq!(raw_raster_native_zoom(512, 256, 256), 1);
        assert_eq!(raw_raster_native_zoom(1000, 1000, 256), 2);
    }
}

//! Tile-index planner (C6): for each zoom level in range, compute which
//! `(z, x, y)` addresses the pyramid must emit, and the read/write windows
//! each one needs (spec §3 `TileDetail`, §4.6, §4.7 step 2).

use crate::grid::MercatorGrid;

/// How many times larger than `tile_size` the oversampled read request is.
/// GDAL resamples the read window down to this size first, and the engine
/// box-downsamples that again onto the write window, rather than a single
/// direct resample straight to the final pixel count — this is the
/// "oversampled `querysize` for high-quality downsampling" spec §3 calls
/// for.
pub const OVERSAMPLE: u32 = 4;

/// A raster's geotransform and pixel dimensions, as much as the planner
/// needs to compute per-tile read/write windows ahead of time.
#[derive(Debug, Clone, Copy)]
pub struct RasterGeometry {
    pub geotransform: [f64; 6],
    pub size: (u32, u32),
}

/// Read/write window for one planned tile (spec §3 `TileDetail`): a read
/// window `(rx, ry, rxsize, rysize)` in source pixels, a write window
/// `(wx, wy, wxsize, wysize)` in tile pixels, and the oversampled
/// `querysize` to request from the adapter before downsampling onto the
/// write window.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReadWriteWindow {
    pub rx: i64,
    pub ry: i64,
    pub rxsize: u32,
    pub rysize: u32,
    pub wx: u32,
    pub wy: u32,
    pub wxsize: u32,
    pub wysize: u32,
    pub querysize: u32,
}

/// One planned tile: its address, the Web-Mercator envelope it covers, and
/// (for raster-profile reads against a known raster geometry) its
/// read/write window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileDetail {
    pub tz: u8,
    pub tx: u32,
    pub ty: u32,
    pub bounds: (f64, f64, f64, f64),
    pub window: Option<ReadWriteWindow>,
}

/// Chunk width used to group adjacent tile columns together in the
/// dispatch order, so neighboring meta-tiles are generated close together
/// in time and can share a warm reader cache (spec §4.6: "stride of 3").
const COLUMN_STRIDE: u32 = 3;

/// Maps `tile_bounds` onto `geotransform`/`raster_size`, returning the
/// read window (clipped to the raster) and the write window (clipped to
/// fit inside one `tile_size × tile_size` tile), or `None` if the tile's
/// bounds don't intersect the raster at all (spec §3 invariant: "tiles
/// whose union of read windows is empty are never emitted").
pub fn compute_window(
    geotransform: [f64; 6],
    raster_size: (u32, u32),
    tile_size: u32,
    tile_bounds: (f64, f64, f64, f64),
) -> Option<ReadWriteWindow> {
    let [ox, pw, _, oy, _, ph] = geotransform;
    let (rxtotal, rytotal) = raster_size;
    let (tminx, tminy, tmaxx, tmaxy) = tile_bounds;

    if pw == 0.0 || ph == 0.0 || rxtotal == 0 || rytotal == 0 {
        return None;
    }

    let raster_x0 = ox;
    let raster_x1 = ox + rxtotal as f64 * pw;
    let raster_y0 = oy;
    let raster_y1 = oy + rytotal as f64 * ph;

    let raster_minx = raster_x0.min(raster_x1);
    let raster_maxx = raster_x0.max(raster_x1);
    let raster_miny = raster_y0.min(raster_y1);
    let raster_maxy = raster_y0.max(raster_y1);

    let ix_min = tminx.max(raster_minx);
    let ix_max = tmaxx.min(raster_maxx);
    let iy_min = tminy.max(raster_miny);
    let iy_max = tmaxy.min(raster_maxy);

    if ix_max <= ix_min || iy_max <= iy_min {
        return None;
    }

    let rx0 = (ix_min - ox) / pw;
    let rx1 = (ix_max - ox) / pw;
    let ry0 = (iy_max - oy) / ph;
    let ry1 = (iy_min - oy) / ph;

    let rx_min = rx0.min(rx1).max(0.0);
    let rx_max = rx0.max(rx1).min(rxtotal as f64);
    let ry_min = ry0.min(ry1).max(0.0);
    let ry_max = ry0.max(ry1).min(rytotal as f64);

    let rx = rx_min.floor() as i64;
    let ry = ry_min.floor() as i64;
    let rxsize = (rx_max.ceil() - rx as f64).max(1.0) as u32;
    let rysize = (ry_max.ceil() - ry as f64).max(1.0) as u32;

    let tile_res_x = (tmaxx - tminx) / tile_size as f64;
    let tile_res_y = (tmaxy - tminy) / tile_size as f64;
    if tile_res_x <= 0.0 || tile_res_y <= 0.0 {
        return None;
    }

    let wx = ((ix_min - tminx) / tile_res_x).round().max(0.0) as u32;
    let wx_end = (((ix_max - tminx) / tile_res_x).round().max(0.0) as u32).min(tile_size);
    let wy = ((tmaxy - iy_max) / tile_res_y).round().max(0.0) as u32;
    let wy_end = (((tmaxy - iy_min) / tile_res_y).round().max(0.0) as u32).min(tile_size);

    let wx = wx.min(tile_size);
    let wy = wy.min(tile_size);
    let wxsize = wx_end.saturating_sub(wx).max(1).min(tile_size - wx);
    let wysize = wy_end.saturating_sub(wy).max(1).min(tile_size - wy);

    Some(ReadWriteWindow {
        rx,
        ry,
        rxsize,
        rysize,
        wx,
        wy,
        wxsize,
        wysize,
        querysize: tile_size * OVERSAMPLE,
    })
}

/// Enumerates every tile in `[tminz..=tmaxz]` whose bounds intersect
/// `envelope` (a Web-Mercator `(west, south, east, north)` rectangle),
/// ordered by zoom ascending, then by column-stride group, then by
/// column ascending, then by row ascending.
///
/// When `raster` is given, each tile's read/write window is computed
/// against it and tiles with no intersection are dropped from the plan
/// (spec §3 invariant). When `raster` is `None` (vector profiles, or
/// callers that resolve windows per-adapter themselves) every tile in the
/// computed range is kept with `window: None`.
pub fn plan_tiles(
    envelope: (f64, f64, f64, f64),
    tminz: u8,
    tmaxz: u8,
    grid: &MercatorGrid,
    raster: Option<&RasterGeometry>,
) -> Vec<TileDetail> {
    let mut out = Vec::new();
    if tminz > tmaxz {
        return out;
    }

    for z in tminz..=tmaxz {
        let (tminx, tmaxx, tminy, tmaxy) = grid.tile_range_for_bounds(envelope, z);

        let mut columns: Vec<u32> = (tminx..=tmaxx).collect();
        columns.sort_by_key(|&tx| (tx / COLUMN_STRIDE, tx));

        for tx in columns {
            for ty in tminy..=tmaxy {
                let bounds = grid.tile_bounds(tx as i64, ty as i64, z);
                let window = match raster {
                    Some(r) => match compute_window(r.geotransform, r.size, grid.tile_size, bounds) {
                        Some(w) => Some(w),
                        None => continue,
                    },
                    None => None,
                };
                out.push(TileDetail {
                    tz: z,
                    tx,
                    ty,
                    bounds,
                    window,
                });
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_scenario_planned_order_and_coverage() {
        let grid = MercatorGrid::default();
        let envelope = (-1.0, -1.0, 1.0, 1.0);
        let tiles = plan_tiles(envelope, 0, 1, &grid, None);

        let z0: Vec<_> = tiles.iter().filter(|t| t.tz == 0).collect();
        assert_eq!(z0.len(), 1);
        assert_eq!((z0[0].tx, z0[0].ty), (0, 0));

        let z1: Vec<(u32, u32)> = tiles
            .iter()
            .filter(|t| t.tz == 1)
            .map(|t| (t.tx, t.ty))
            .collect();
        assert_eq!(z1, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
    }

    #[test]
    fn invariant_1_every_planned_tile_is_in_range() {
        let grid = MercatorGrid::default();
        let envelope = (-2e7, -2e7, 2e7, 2e7);
        for t in plan_tiles(envelope, 0, 5, &grid, None) {
            let max = 1u32 << t.tz;
            assert!(t.tx < max && t.ty < max);
        }
    }

    #[test]
    fn empty_range_yields_no_tiles() {
        let grid = MercatorGrid::default();
        assert!(plan_tiles((-1.0, -1.0, 1.0, 1.0), 3, 1, &grid, None).is_empty());
    }

    #[test]
    fn windowed_plan_drops_tiles_outside_raster_and_fits_write_window_in_tile() {
        let grid = MercatorGrid::default();
        let envelope = (-2e7, -2e7, 2e7, 2e7);
        let raster = RasterGeometry {
            // Raster covers only the top-left quadrant of the z=1 tile grid.
            geotransform: [-2e7, 2e7 / 256.0, 0.0, 2e7, 0.0, -(2e7 / 256.0)],
            size: (256, 256),
        };

        let tiles = plan_tiles(envelope, 1, 1, &grid, Some(&raster));
        assert_eq!(tiles.len(), 1);
        let t = tiles[0];
        // tile_bounds uses the TMS (bottom-left-origin) convention, so the
        // raster's northern half lands in row ty=1, not ty=0.
        assert_eq!((t.tx, t.ty), (0, 1));
        let w = t.window.expect("raster-profile tile must carry a window");
        assert!(w.wx + w.wxsize <= grid.tile_size);
        assert!(w.wy + w.wysize <= grid.tile_size);
        assert!(w.rxsize <= raster.size.0 && w.rysize <= raster.size.1);
        assert_eq!(w.querysize, grid.tile_size * OVERSAMPLE);
    }

    #[test]
    fn raster_with_no_overlap_plans_zero_tiles() {
        let grid = MercatorGrid::default();
        let envelope = (-1.0, -1.0, 1.0, 1.0);
        let raster = RasterGeometry {
            geotransform: [1e9, 1.0, 0.0, 1e9, 0.0, -1.0],
            size: (10, 10),
        };
        assert!(plan_tiles(envelope, 0, 0, &grid, Some(&raster)).is_empty());
    }
}

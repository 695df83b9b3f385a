//! Per-dataset sidecar database (C6 persistence, spec §4.6/§6 "Sidecar
//! schema"): records the planner's per-tile windows, the `TileJob`
//! parameters that produced them, the per-zoom tile ranges, the input
//! assets, and which tiles turned out to be entirely nodata.
//!
//! Lives at `data/<datasource_id>/<datasource_id>.db`. The serving path
//! (`serving.rs`) watches this file's modification time and invalidates its
//! cached readers when a new pyramid run rewrites it (spec §4.11).
//!
//! Grounded on the reference tiler's `server/sqlite_db.py`/`init_db.py`
//! table definitions, ported to the same `rusqlite` + WAL + busy-timeout
//! idiom this crate already uses for the job registry and archive sink.

use std::path::Path;

use rusqlite::Connection;

use crate::config::{PixelSelectionMethod, ResamplingMethod};
use crate::error::Result;
use crate::tiling::planner::TileDetail;

/// A `tile_job` row: the `TileJob` parameters a pyramid build ran with
/// (spec §3 `TileJob`).
pub struct TileJobRow<'a> {
    pub data_bands_count: u32,
    pub nodata: Option<f64>,
    pub src_file: &'a str,
    pub tile_extension: &'a str,
    pub tile_size: u32,
    pub tile_driver: &'a str,
    pub profile: &'a str,
    pub querysize: u32,
    pub xyz: bool,
    pub in_file: &'a str,
    pub input_file: &'a str,
    pub encode_to_rgba: bool,
    pub has_alpha_band: bool,
    pub pixel_selection_method: PixelSelectionMethod,
    pub resampling_method: ResamplingMethod,
    pub merge: bool,
}

pub struct SidecarDb {
    conn: Connection,
}

impl SidecarDb {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=240000;
             CREATE TABLE IF NOT EXISTS tiles_detail (
                 tz INTEGER NOT NULL,
                 tx INTEGER NOT NULL,
                 ty INTEGER NOT NULL,
                 rx INTEGER NOT NULL,
                 ry INTEGER NOT NULL,
                 rxsize INTEGER NOT NULL,
                 rysize INTEGER NOT NULL,
                 wx INTEGER NOT NULL,
                 wy INTEGER NOT NULL,
                 wxsize INTEGER NOT NULL,
                 wysize INTEGER NOT NULL,
                 querysize INTEGER NOT NULL,
                 PRIMARY KEY (tz, tx, ty)
             );
             CREATE TABLE IF NOT EXISTS tile_job (
                 data_bands_count INTEGER NOT NULL,
                 nodata REAL,
                 src_file TEXT NOT NULL,
                 tile_extension TEXT NOT NULL,
                 tile_size INTEGER NOT NULL,
                 tile_driver TEXT NOT NULL,
                 profile TEXT NOT NULL,
                 querysize INTEGER NOT NULL,
                 xyz INTEGER NOT NULL,
                 in_file TEXT NOT NULL,
                 input_file TEXT NOT NULL,
                 encode_to_rgba INTEGER NOT NULL,
                 has_alpha_band INTEGER NOT NULL,
                 pixel_selection_method TEXT NOT NULL,
                 resampling_method TEXT NOT NULL,
                 merge INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS tminmax (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 tz INTEGER NOT NULL,
                 tminx INTEGER NOT NULL,
                 tmaxx INTEGER NOT NULL,
                 tminy INTEGER NOT NULL,
                 tmaxy INTEGER NOT NULL,
                 asset TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS tminz_tmaxz (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 tminz INTEGER NOT NULL,
                 tmaxz INTEGER NOT NULL,
                 asset TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS empty_tiles (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 x INTEGER NOT NULL,
                 y INTEGER NOT NULL,
                 z INTEGER NOT NULL,
                 UNIQUE(x, y, z)
             );
             CREATE TABLE IF NOT EXISTS assets (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 asset TEXT NOT NULL
             );",
        )?;
        Ok(Self { conn })
    }

    /// Replaces the single `tile_job` row with the parameters of the run
    /// that just (re)planned this dataset.
    pub fn write_tile_job(&self, row: &TileJobRow) -> Result<()> {
        self.conn.execute("DELETE FROM tile_job;", [])?;
        self.conn.execute(
            "INSERT INTO tile_job (
                data_bands_count, nodata, src_file, tile_extension, tile_size, tile_driver,
                profile, querysize, xyz, in_file, input_file, encode_to_rgba, has_alpha_band,
                pixel_selection_method, resampling_method, merge
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
            rusqlite::params![
                row.data_bands_count,
                row.nodata,
                row.src_file,
                row.tile_extension,
                row.tile_size,
                row.tile_driver,
                row.profile,
                row.querysize,
                row.xyz,
                row.in_file,
                row.input_file,
                row.encode_to_rgba,
                row.has_alpha_band,
                format!("{:?}", row.pixel_selection_method),
                format!("{:?}", row.resampling_method),
                row.merge,
            ],
        )?;
        Ok(())
    }

    pub fn write_tminmax(&self, tz: u8, tminx: u32, tmaxx: u32, tminy: u32, tmaxy: u32, asset: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO tminmax (tz, tminx, tmaxx, tminy, tmaxy, asset) VALUES (?1,?2,?3,?4,?5,?6)",
            rusqlite::params![tz, tminx, tmaxx, tminy, tmaxy, asset],
        )?;
        Ok(())
    }

    pub fn write_tminz_tmaxz(&self, tminz: u8, tmaxz: u8, asset: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO tminz_tmaxz (tminz, tmaxz, asset) VALUES (?1,?2,?3)",
            rusqlite::params![tminz, tmaxz, asset],
        )?;
        Ok(())
    }

    pub fn write_asset(&self, asset: &str) -> Result<()> {
        self.conn
            .execute("INSERT INTO assets (asset) VALUES (?1)", rusqlite::params![asset])?;
        Ok(())
    }

    /// Batch-persists the planner's output so a sidecar reader can see the
    /// exact read/write window each tile was (or will be) generated with,
    /// without re-deriving it from the raster's geotransform.
    pub fn write_tile_details(&mut self, details: &[TileDetail]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO tiles_detail
                 (tz, tx, ty, rx, ry, rxsize, rysize, wx, wy, wxsize, wysize, querysize)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            )?;
            for d in details {
                let w = d.window.unwrap_or_default();
                stmt.execute(rusqlite::params![
                    d.tz, d.tx, d.ty, w.rx, w.ry, w.rxsize, w.rysize, w.wx, w.wy, w.wxsize, w.wysize, w.querysize,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Records a tile that rendered as entirely nodata/transparent, so a
    /// future serving-path lookup can skip straight to 204 without
    /// regenerating it (invariant 8: empty tiles are never persisted to the
    /// sink, but are worth remembering here).
    pub fn mark_empty_tile(&self, z: u8, x: u32, y: u32) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO empty_tiles (x, y, z) VALUES (?1,?2,?3)",
            rusqlite::params![x, y, z],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiling::planner::ReadWriteWindow;

    #[test]
    fn round_trips_tile_job_and_tile_details() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ds.db");
        let mut db = SidecarDb::open(&path).unwrap();

        db.write_tile_job(&TileJobRow {
            data_bands_count: 4,
            nodata: Some(-9_999_999.0),
            src_file: "in_TR_OV.tif",
            tile_extension: "png",
            tile_size: 256,
            tile_driver: "PNG",
            profile: "mercator",
            querysize: 1024,
            xyz: true,
            in_file: "in.tif",
            input_file: "in.tif",
            encode_to_rgba: false,
            has_alpha_band: true,
            pixel_selection_method: PixelSelectionMethod::First,
            resampling_method: ResamplingMethod::Bilinear,
            merge: false,
        })
        .unwrap();

        db.write_tminmax(0, 0, 0, 0, 0, "in_TR_OV.tif").unwrap();
        db.write_tminz_tmaxz(0, 5, "in_TR_OV.tif").unwrap();
        db.write_asset("in_TR_OV.tif").unwrap();
        db.mark_empty_tile(3, 1, 2).unwrap();
        db.mark_empty_tile(3, 1, 2).unwrap();

        let details = vec![TileDetail {
            tz: 0,
            tx: 0,
            ty: 0,
            bounds: (0.0, 0.0, 1.0, 1.0),
            window: Some(ReadWriteWindow {
                rx: 0,
                ry: 0,
                rxsize: 256,
                rysize: 256,
                wx: 0,
                wy: 0,
                wxsize: 256,
                wysize: 256,
                querysize: 1024,
            }),
        }];
        db.write_tile_details(&details).unwrap();

        let job_count: i64 = db.conn.query_row("SELECT COUNT(*) FROM tile_job", [], |r| r.get(0)).unwrap();
        assert_eq!(job_count, 1);
        let detail_count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM tiles_detail", [], |r| r.get(0))
            .unwrap();
        assert_eq!(detail_count, 1);
        let empty_count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM empty_tiles", [], |r| r.get(0))
            .unwrap();
        assert_eq!(empty_count, 1, "duplicate mark_empty_tile must not create a second row");
    }
}

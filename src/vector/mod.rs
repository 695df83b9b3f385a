//! Vector tile builder (C10): assembles one composite MVT blob per request
//! from a datasource's configured layers.
//!
//! Query shape is grounded on `sources/postgres/table.rs::build_tile_query`
//! (the same `ST_AsMVTGeom`/`ST_AsMVT`/`ST_TileEnvelope` CTE pattern), but
//! generalized from "one fixed query per source" to "one query per
//! declared layer, composed at request time," since a vector DataSource can
//! carry several independently zoom-gated layers.

pub mod filter;

use std::f64::consts::PI;

use crate::grid::EARTH_RADIUS;
use filter::Expr;

#[cfg(feature = "postgres")]
use std::sync::Arc;

#[cfg(feature = "postgres")]
use bytes::Bytes;

#[cfg(feature = "postgres")]
use crate::error::{Result, TileServerError};
#[cfg(feature = "postgres")]
use crate::sources::postgres::PostgresPool;

/// One layer of a vector DataSource (spec §4.10).
#[derive(Debug, Clone)]
pub struct LayerSpec {
    pub id: String,
    pub table: String,
    pub geometry_column: String,
    pub minzoom: u8,
    pub maxzoom: u8,
    pub simplify: bool,
    pub filter: Option<Expr>,
    pub fields: Vec<String>,
    pub extent: u32,
    pub buffer: u32,
}

impl LayerSpec {
    fn active_at(&self, z: u8) -> bool {
        z >= self.minzoom && z <= self.maxzoom
    }

    /// Builds the per-layer CTE query. Returns `None` for layers not active
    /// at `z` (the caller skips those without ever reaching the database).
    fn build_sql(&self, z: u8) -> Option<String> {
        if !self.active_at(z) {
            return None;
        }

        let attrs = if self.fields.is_empty() {
            String::new()
        } else {
            format!(
                ", {}",
                self.fields
                    .iter()
                    .map(|f| format!("\"{f}\""))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };

        let geom_expr = if self.simplify {
            let tolerance = simplify_tolerance(z, self.extent);
            format!(
                "ST_AsMVTGeom(ST_SimplifyPreserveTopology(\"{}\", {tolerance}), ST_TileEnvelope($1, $2, $3), {}, {})",
                self.geometry_column, self.extent, self.buffer
            )
        } else {
            format!(
                "ST_AsMVTGeom(\"{}\", ST_TileEnvelope($1, $2, $3), {}, {})",
                self.geometry_column, self.extent, self.buffer
            )
        };

        let filter_sql = self
            .filter
            .as_ref()
            .map(|f| format!(" AND {}", f.to_sql()))
            .unwrap_or_default();

        Some(format!(
            "WITH mvtgeom AS (
                 SELECT {geom_expr} AS geom{attrs}
                 FROM {table} t
                 WHERE t.\"{geom_col}\" IS NOT NULL
                   AND t.\"{geom_col}\" && ST_TileEnvelope($1, $2, $3, margin => 0.25){filter_sql}
             )
             SELECT ST_AsMVT(mvtgeom.*, '{layer_id}', {extent}, 'geom') FROM mvtgeom",
            geom_expr = geom_expr,
            attrs = attrs,
            table = self.table,
            geom_col = self.geometry_column,
            filter_sql = filter_sql,
            layer_id = self.id,
            extent = self.extent,
        ))
    }
}

/// Simplification tolerance at zoom `z` for an MVT `extent` (spec §4.10).
///
/// The low end (`z ≤ 11`) uses a fixed function of the Web-Mercator map
/// width alone; above that the extent-relative term with a tapering
/// multiplier `m` takes over (`m = 1` once `z > 5`, which is always true for
/// `z > 11`, so the single `if` below expresses the complete rule).
pub fn simplify_tolerance(z: u8, extent: u32) -> f64 {
    let map_width_meters = 2.0 * PI * EARTH_RADIUS;
    if z <= 11 {
        return map_width_meters / 2f64.powi(z as i32 + 8);
    }
    let m = if z > 5 { 1.0 } else { 2.2 - 0.2 * z as f64 };
    m * map_width_meters / (extent as f64 * 2f64.powi(z as i32))
}

/// Assembles composite MVT tiles from a fixed set of layers against one
/// PostGIS-backed pool.
#[cfg(feature = "postgres")]
pub struct VectorTileBuilder {
    pool: Arc<PostgresPool>,
    layers: Vec<LayerSpec>,
}

#[cfg(feature = "postgres")]
impl VectorTileBuilder {
    pub fn new(pool: Arc<PostgresPool>, layers: Vec<LayerSpec>) -> Self {
        Self { pool, layers }
    }

    /// Builds the composite tile for `(z, x, y)`. Returns an empty `Bytes`
    /// when no layer is active at `z` or every active layer is empty
    /// (spec §4.10 "Returns an empty blob ... when no layer intersects").
    pub async fn build_tile(&self, z: u8, x: u32, y: u32) -> Result<Bytes> {
        let mut composite = Vec::new();
        let conn = self.pool.get().await?;

        for layer in &self.layers {
            let Some(sql) = layer.build_sql(z) else {
                continue;
            };
            let row = conn
                .query_opt(&sql, &[&(z as i32), &(x as i32), &(y as i32)])
                .await
                .map_err(|e| TileServerError::PostgresError(format!("layer '{}': {e}", layer.id)))?;
            if let Some(row) = row {
                let blob: Vec<u8> = row.get(0);
                if !blob.is_empty() {
                    composite.extend_from_slice(&blob);
                }
            }
        }

        Ok(Bytes::from(composite))
    }
}

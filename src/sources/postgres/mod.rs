//! PostgreSQL connection pooling for PostGIS-backed vector datasources.
//!
//! The table/function source abstractions this module once carried have been
//! superseded by [`crate::vector::VectorTileBuilder`], which composes layer
//! queries directly against a `PostgresPool`. Only the pool itself remains.

mod pool;

pub use pool::{PoolSettings, PostgresPool};

use semver::Version;

/// Minimum PostgreSQL version required (11.0.0)
pub const MINIMUM_POSTGRES_VERSION: Version = Version::new(11, 0, 0);

/// Minimum PostGIS version required (3.0.0) for ST_TileEnvelope support
pub const MINIMUM_POSTGIS_VERSION: Version = Version::new(3, 0, 0);

/// PostGIS version that supports margin parameter in ST_TileEnvelope (3.1.0)
pub const ST_TILE_ENVELOPE_MARGIN_VERSION: Version = Version::new(3, 1, 0);

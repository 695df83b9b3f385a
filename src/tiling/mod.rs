//! Tile-index planning (C6) and the parallel tile-generation engine (C7).

pub mod engine;
pub mod planner;
pub mod sidecar;

pub use engine::{EngineReport, GeneratedTile, PyramidEngine, TileEvent, TileOutcome};
pub use planner::{compute_window, plan_tiles, ReadWriteWindow, RasterGeometry, TileDetail, OVERSAMPLE};
pub use sidecar::{SidecarDb, TileJobRow};

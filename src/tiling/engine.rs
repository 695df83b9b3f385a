//! Parallel tile engine (C7).
//!
//! Grounded on the reference tiler's `multi_process_tiling` /
//! `process_tiling_in_separate_processes` (`original_source/raster_tiles/multiprocess.py`):
//! per-worker bounded queues (capacity 5), round-robin dispatch with a
//! per-enqueue timeout, and a `"terminate"` sentinel that closes each queue.
//! Workers are realized as `tokio::task::spawn_blocking` tasks rather than OS
//! processes — see the rendition note in `SPEC_FULL.md` §4.7 — because each
//! blocking task already gets its own OS thread and opens its own adapter
//! handle, never sharing one across tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::PyramidEngineConfig;
use crate::error::Result;
use crate::tiling::planner::TileDetail;

/// Outcome of rendering a single planned tile.
pub enum TileOutcome {
    /// Tile has data; carries the encoded image bytes.
    Emitted(Vec<u8>),
    /// Tile is entirely nodata/transparent — not persisted (invariant 8).
    EmptyNodata,
}

/// A successfully rendered tile, ready for the sink.
#[derive(Debug, Clone)]
pub struct GeneratedTile {
    pub tz: u8,
    pub tx: u32,
    pub ty: u32,
    pub bytes: Vec<u8>,
}

/// What a worker reports back for one planned tile: either bytes for the
/// sink, or an address that rendered empty, so the sidecar's `empty_tiles`
/// table can be populated (spec §6) without the sink ever seeing a write.
#[derive(Debug, Clone)]
pub enum TileEvent {
    Tile(GeneratedTile),
    Empty { tz: u8, tx: u32, ty: u32 },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EngineReport {
    pub emitted: usize,
    pub skipped_nodata: usize,
    pub failed: usize,
    pub dropped: usize,
}

enum WorkItem {
    Tile(TileDetail),
    Terminate,
}

/// Drives a pool of blocking tile-render workers over a planned tile list.
pub struct PyramidEngine {
    datasource_id: String,
    worker_count: usize,
    queue_capacity: usize,
    enqueue_timeout: Duration,
}

impl PyramidEngine {
    pub fn new(datasource_id: impl Into<String>, config: &PyramidEngineConfig) -> Self {
        let worker_count = config.worker_count.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        Self {
            datasource_id: datasource_id.into(),
            worker_count: worker_count.max(1),
            queue_capacity: config.queue_capacity,
            enqueue_timeout: Duration::from_secs(config.enqueue_timeout_secs),
        }
    }

    /// Runs `tiles` (already ordered by the planner) through the worker pool.
    ///
    /// `worker_factory` is called once per worker, on the worker's own
    /// blocking thread, to build that worker's renderer — this is where each
    /// worker opens its own reader for the warped source. Successfully
    /// rendered tiles are pushed onto `results_tx`, consumed by the sink
    /// (C8) concurrently with generation.
    pub async fn run<F, W>(
        &self,
        tiles: Vec<TileDetail>,
        worker_factory: F,
        results_tx: mpsc::Sender<TileEvent>,
    ) -> EngineReport
    where
        F: Fn() -> Result<W> + Send + Sync + 'static,
        W: FnMut(TileDetail) -> Result<TileOutcome> + Send + 'static,
    {
        let worker_factory = Arc::new(worker_factory);
        let mut senders = Vec::with_capacity(self.worker_count);
        let mut handles = Vec::with_capacity(self.worker_count);

        for idx in 0..self.worker_count {
            let (tx, rx) = mpsc::channel::<WorkItem>(self.queue_capacity);
            senders.push(tx);

            let factory = worker_factory.clone();
            let results_tx = results_tx.clone();
            let datasource_id = self.datasource_id.clone();

            handles.push(tokio::task::spawn_blocking(move || {
                let build: &F = &factory;
                let worker = match build() {
                    Ok(w) => w,
                    Err(e) => {
                        tracing::error!(
                            datasource_id = %datasource_id,
                            worker = idx,
                            error = %e,
                            "failed to open tile worker"
                        );
                        return EngineReport::default();
                    }
                };
                worker_loop(worker, rx, results_tx, idx, &datasource_id)
            }));
        }

        let mut dropped = 0usize;
        let n = self.worker_count;
        for (i, tile) in tiles.into_iter().enumerate() {
            let sender = &senders[i % n];
            match timeout(self.enqueue_timeout, sender.send(WorkItem::Tile(tile))).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    dropped += 1;
                    tracing::warn!(datasource_id = %self.datasource_id, tz = tile.tz, tx = tile.tx, ty = tile.ty, "worker queue closed, tile dropped");
                }
                Err(_) => {
                    dropped += 1;
                    tracing::warn!(datasource_id = %self.datasource_id, tz = tile.tz, tx = tile.tx, ty = tile.ty, "enqueue timed out after 180s, tile dropped");
                }
            }
        }

        for sender in &senders {
            let _ = sender.send(WorkItem::Terminate).await;
        }
        drop(senders);

        let mut report = EngineReport {
            dropped,
            ..Default::default()
        };
        for handle in handles {
            if let Ok(worker_report) = handle.await {
                report.emitted += worker_report.emitted;
                report.skipped_nodata += worker_report.skipped_nodata;
                report.failed += worker_report.failed;
            }
        }
        report
    }
}

fn worker_loop<W>(
    mut worker: W,
    mut rx: mpsc::Receiver<WorkItem>,
    results_tx: mpsc::Sender<TileEvent>,
    worker_idx: usize,
    datasource_id: &str,
) -> EngineReport
where
    W: FnMut(TileDetail) -> Result<TileOutcome>,
{
    let mut report = EngineReport::default();
    while let Some(item) = rx.blocking_recv() {
        let detail = match item {
            WorkItem::Tile(detail) => detail,
            WorkItem::Terminate => break,
        };

        match worker(detail) {
            Ok(TileOutcome::Emitted(bytes)) => {
                report.emitted += 1;
                let tile = GeneratedTile {
                    tz: detail.tz,
                    tx: detail.tx,
                    ty: detail.ty,
                    bytes,
                };
                if results_tx.blocking_send(TileEvent::Tile(tile)).is_err() {
                    break;
                }
            }
            Ok(TileOutcome::EmptyNodata) => {
                report.skipped_nodata += 1;
                let _ = results_tx.blocking_send(TileEvent::Empty {
                    tz: detail.tz,
                    tx: detail.tx,
                    ty: detail.ty,
                });
            }
            Err(e) => {
                report.failed += 1;
                tracing::error!(
                    datasource_id = %datasource_id,
                    worker = worker_idx,
                    z = detail.tz,
                    x = detail.tx,
                    y = detail.ty,
                    error = %e,
                    "tile generation failed"
                );
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::MercatorGrid;
    use crate::tiling::planner::plan_tiles;

    #[tokio::test]
    async fn s4_scenario_every_seventh_tile_fails() {
        let grid = MercatorGrid::default();
        let tiles = plan_tiles((-2e7, -2e7, 2e7, 2e7), 8, 8, &grid, None);
        assert_eq!(tiles.len(), 256);

        let config = PyramidEngineConfig {
            worker_count: Some(4),
            queue_capacity: 5,
            enqueue_timeout_secs: 180,
            busy_retry_attempts: 10,
            busy_retry_backoff_ms: 200,
            remove_processing_raster_files: false,
        };
        let engine = PyramidEngine::new("s4-fixture", &config);

        let (tx, mut rx) = mpsc::channel::<TileEvent>(64);
        let drain = tokio::spawn(async move {
            let mut count = 0usize;
            while let Some(event) = rx.recv().await {
                if matches!(event, TileEvent::Tile(_)) {
                    count += 1;
                }
            }
            count
        });

        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let report = engine
            .run(
                tiles,
                move || {
                    let counter = counter.clone();
                    Ok(move |_detail: TileDetail| {
                        let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        if n % 7 == 6 {
                            Err(crate::error::TileServerError::RasterError(
                                "simulated failure".into(),
                            ))
                        } else {
                            Ok(TileOutcome::Emitted(vec![0u8]))
                        }
                    })
                },
                tx,
            )
            .await;

        let sunk = drain.await.unwrap();
        assert_eq!(report.emitted, sunk);
        assert_eq!(report.emitted + report.failed, 256);
        assert_eq!(report.failed, 36);
        assert_eq!(report.emitted, 220);
    }
}

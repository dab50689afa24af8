//! Simulated cell segmentation executor.

use tracing::debug;

use crate::model::Job;
use crate::worker::{ExecutionOutcome, JobExecutor, ProgressSink};

use super::{process_tile, tile_count};

/// Walks the slide tile by tile at full resolution, reporting progress after
/// every tile. Progress is `tiles_done / tiles_total`.
pub struct CellSegmentationExecutor {
    tile_px: u64,
}

impl Default for CellSegmentationExecutor {
    fn default() -> Self {
        Self { tile_px: 512 }
    }
}

impl CellSegmentationExecutor {
    pub fn new(tile_px: u64) -> Self {
        Self {
            tile_px: tile_px.max(1),
        }
    }
}

impl JobExecutor for CellSegmentationExecutor {
    fn execute(&self, job: &Job, progress: &ProgressSink) -> ExecutionOutcome {
        let tiles_total = tile_count(&job.image_path, self.tile_px);
        debug!(
            job_id = %job.job_id,
            image_path = %job.image_path,
            tiles_total,
            "segmenting cells"
        );

        let mut checksum: u64 = 0;
        for tile in 0..tiles_total {
            checksum ^= process_tile(tile);
            progress.update(
                (tile + 1) as f64 / tiles_total as f64,
                Some(tile + 1),
                Some(tiles_total),
            );
        }

        ExecutionOutcome::Succeeded {
            result_path: format!(
                "results/{}/{}/cells_{checksum:016x}.json",
                job.workflow_id, job.job_id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::sync::mpsc;

    use crate::model::{JobStatus, JobType};
    use crate::worker::{ExecutorRegistry, WorkerEvent, WorkerPool};
    use std::sync::Arc;

    fn job() -> Job {
        Job {
            job_id: "seg".to_string(),
            workflow_id: "w1".to_string(),
            tenant_id: "t1".to_string(),
            job_type: JobType::CellSegmentation,
            branch: "main".to_string(),
            depends_on: Vec::new(),
            image_path: "/slides/case_0001.svs".to_string(),
            status: JobStatus::Running,
            progress: 0.0,
            tiles_processed: None,
            tiles_total: None,
            error_message: None,
            result_path: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn reports_monotone_progress_up_to_one() {
        let mut registry = ExecutorRegistry::new();
        registry.register(
            JobType::CellSegmentation,
            Arc::new(CellSegmentationExecutor::new(4096)),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(1, Arc::new(registry), tx);
        pool.submit(job());

        let mut last = 0.0;
        loop {
            match rx.recv().await.unwrap() {
                WorkerEvent::Progress { progress, .. } => {
                    assert!(progress >= last);
                    assert!(progress <= 1.0);
                    last = progress;
                }
                WorkerEvent::Finished { outcome, .. } => {
                    assert!(last >= 1.0 - 1e-9);
                    match outcome {
                        ExecutionOutcome::Succeeded { result_path } => {
                            assert!(result_path.starts_with("results/w1/seg/cells_"));
                        }
                        other => panic!("unexpected outcome: {other:?}"),
                    }
                    break;
                }
            }
        }
    }
}

//! Simulated tissue mask executor.

use tracing::debug;

use crate::model::Job;
use crate::worker::{ExecutionOutcome, JobExecutor, ProgressSink};

use super::{process_tile, tile_count};

/// Builds a low-resolution tissue mask. Works on a coarser grid than cell
/// segmentation and reports progress in chunks rather than per tile.
pub struct TissueMaskExecutor {
    tile_px: u64,
    report_every: u64,
}

impl Default for TissueMaskExecutor {
    fn default() -> Self {
        Self {
            tile_px: 2_048,
            report_every: 4,
        }
    }
}

impl JobExecutor for TissueMaskExecutor {
    fn execute(&self, job: &Job, progress: &ProgressSink) -> ExecutionOutcome {
        let tiles_total = tile_count(&job.image_path, self.tile_px);
        debug!(
            job_id = %job.job_id,
            image_path = %job.image_path,
            tiles_total,
            "building tissue mask"
        );

        let mut covered: u64 = 0;
        for tile in 0..tiles_total {
            covered = covered.wrapping_add(process_tile(tile) & 0xff);
            let done = tile + 1;
            if done % self.report_every == 0 || done == tiles_total {
                progress.update(
                    done as f64 / tiles_total as f64,
                    Some(done),
                    Some(tiles_total),
                );
            }
        }

        ExecutionOutcome::Succeeded {
            result_path: format!(
                "results/{}/{}/tissue_mask_{covered}.png",
                job.workflow_id, job.job_id
            ),
        }
    }
}

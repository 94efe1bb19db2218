//! Rendering, scheduling and the batch driver.

mod job;
mod metrics;
mod render;
mod scheduler;

pub use job::{archive_key, job_manifest, run_job, BranchFailurePolicy, JobOptions, JobStats};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use render::{
    FootprintRenderer, RenderExecutor, RenderRequest, RenderedTile, TileFormat, Transformation,
};
pub use scheduler::{BranchOutput, MaterializationScheduler, SchedulerConfig};

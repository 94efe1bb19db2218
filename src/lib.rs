//! Land Cover Tiles
//!
//! Materializes a global land-cover layer as pyramids of Tapalcatl 2 tile
//! archives, choosing for every tile the best mix of overlapping sources.
//!
//! # Architecture
//!
//! - **Catalog**: footprint records, R-tree spatial indexes and the greedy
//!   [`SourceResolver`](catalog::SourceResolver)
//! - **Pyramid**: quadtree enumeration and sub-pyramid planning
//! - **Pipeline**: bounded, order-preserving rendering and the batch driver
//! - **I/O**: zip archive packaging and local/S3 sinks
//!
//! # Usage
//!
//! ```no_run
//! use landcover_tiles::{Config, run_materialization};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     run_materialization(config).await?;
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod crs;
pub mod error;
pub mod io;
pub mod pipeline;
pub mod pyramid;
pub mod tile;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::{
    EphemeralIndex, PersistentIndex, QueryRegion, RankedSource, Source, SourceResolver,
    SpatialIndex,
};
pub use config::Config;
pub use error::Error;
pub use io::{ArchivePackager, Sink, UriSink};
pub use pipeline::{JobOptions, JobStats, MaterializationScheduler, SchedulerConfig};
pub use pyramid::{MaterializationPlan, PyramidPlanner};
pub use tile::Tile;

use anyhow::Context;
use pipeline::{FootprintRenderer, Metrics};
use std::sync::Arc;

/// Result type for the library core.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Build the materialization plan described by a configuration.
pub fn plan_from_config(config: &Config) -> anyhow::Result<MaterializationPlan> {
    let job = &config.job;
    let root = job.root()?;
    Ok(MaterializationPlan::new(
        root,
        job.max_zoom,
        job.metatile,
        &job.materialize,
    )?)
}

/// Run a full materialization job with the given configuration.
pub async fn run_materialization(config: Config) -> anyhow::Result<JobStats> {
    config.validate()?;
    let plan = plan_from_config(&config)?;

    tracing::info!("Starting land cover materialization");

    let catalog = load_catalog(&config.catalog.path).await?;

    let index: Arc<dyn SpatialIndex> = if config.catalog.cache_sources {
        Arc::new(EphemeralIndex::populate(&catalog, plan.root, plan.max_zoom, plan.metatile)?)
    } else {
        Arc::new(catalog)
    };

    let format = config.output.format;
    let scheduler = MaterializationScheduler::new(
        index,
        Arc::new(FootprintRenderer),
        Metrics::new(),
        SchedulerConfig {
            concurrency: config.processing.concurrency,
            format,
            transformation: format.transformation(config.output.buffer),
            scale: config.job.scale,
        },
    );

    let options = JobOptions {
        plan,
        target: config.output.target.clone(),
        hash: config.output.hash,
        skip_meta: config.output.skip_meta,
        name: config.output.name.clone(),
        description: config.output.description.clone(),
        on_branch_failure: config.processing.on_branch_failure,
        metrics_interval_secs: config
            .processing
            .enable_metrics
            .then_some(config.processing.metrics_interval_secs),
        metrics_output_path: config.processing.metrics_output_path.clone(),
    };

    pipeline::run_job(&scheduler, &UriSink::new(), &options).await
}

/// Load the footprint catalog at `path`.
pub async fn load_catalog(path: &str) -> anyhow::Result<PersistentIndex> {
    tracing::info!("Loading footprint catalog from {}", path);
    let catalog = PersistentIndex::load(path)
        .await
        .with_context(|| format!("Failed to load catalog {}", path))?;

    match catalog.index().bounds_wgs84() {
        Some(bounds) => tracing::info!(
            "Loaded {} sources from {} covering {:?}",
            catalog.index().len(),
            catalog.location(),
            bounds
        ),
        None => tracing::warn!("Catalog {} has no usable sources", catalog.location()),
    }
    Ok(catalog)
}

/// Rank the catalog's sources for one region, best first.
pub async fn query_sources(
    catalog_path: &str,
    region: &QueryRegion,
) -> anyhow::Result<Vec<RankedSource>> {
    let catalog = load_catalog(catalog_path).await?;
    let ranked = SourceResolver::new(&catalog, region)
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("Failed to resolve sources for {:?}", region.bounds))?;
    Ok(ranked)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

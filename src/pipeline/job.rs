//! Batch driver: writes the job manifest, then renders, packages and
//! writes one archive per sub-pyramid root.

use crate::error::Error;
use crate::io::{join_uri, ArchiveMetadata, ArchivePackager, Sink};
use crate::pipeline::{MaterializationScheduler, Metrics, MetricsReporter};
use crate::pyramid::MaterializationPlan;
use crate::tile::Tile;
use anyhow::{Context, Result};
use bytes::Bytes;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::mpsc;

/// Length of the hex digest prefix on hashed archive keys.
const HASH_PREFIX_LEN: usize = 5;

/// What the driver does when a branch fails to render.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchFailurePolicy {
    /// Stop the job and return the error
    #[default]
    Halt,
    /// Log, count, and continue with the next root
    Skip,
}

/// Options for one materialization job.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub plan: MaterializationPlan,

    /// Base URI archives are written under
    pub target: String,

    /// Prefix archive keys with a digest of `z/x/y`
    pub hash: bool,

    /// Don't write `meta.json`
    pub skip_meta: bool,

    pub name: String,
    pub description: String,
    pub on_branch_failure: BranchFailurePolicy,

    /// Progress reporting interval; `None` disables the reporter
    pub metrics_interval_secs: Option<u64>,

    pub metrics_output_path: Option<String>,
}

/// Outcome of a job.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStats {
    pub branches: usize,
    pub archives_written: u64,
    pub branch_failures: u64,
    pub sink_failures: u64,
    pub tiles_rendered: u64,
    pub bytes_written: u64,
    pub elapsed_secs: f64,
}

impl JobStats {
    fn collect(branches: usize, metrics: &Metrics) -> Self {
        let snapshot = metrics.snapshot();
        Self {
            branches,
            archives_written: snapshot.archives_written,
            branch_failures: snapshot.branch_failures,
            sink_failures: snapshot.sink_failures,
            tiles_rendered: snapshot.tiles_rendered,
            bytes_written: snapshot.bytes_written,
            elapsed_secs: snapshot.elapsed.as_secs_f64(),
        }
    }
}

impl std::fmt::Display for JobStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} branches: {} archives written, {} skipped, {} sink failures ({} tiles, {} bytes) in {:.1}s",
            self.branches,
            self.archives_written,
            self.branch_failures,
            self.sink_failures,
            self.tiles_rendered,
            self.bytes_written,
            self.elapsed_secs
        )
    }
}

/// Object key (without extension) for the archive rooted at `tile`.
///
/// With `hash`, keys become `{h}/z/x/y` where `h` is the first five hex
/// characters of the MD5 of `z/x/y`, matching the `{h}` placeholder
/// Tapalcatl clients fill in.
pub fn archive_key(tile: &Tile, hash: bool) -> String {
    let path = tile.path();
    if !hash {
        return path;
    }
    let digest = format!("{:x}", Md5::digest(path.as_bytes()));
    format!("{}/{}", &digest[..HASH_PREFIX_LEN], path)
}

/// Top-level job metadata: root archive metadata plus the materialized
/// zooms and the template locating every archive.
pub fn job_manifest(
    packager: &ArchivePackager,
    plan: &MaterializationPlan,
    target: &str,
    hash: bool,
) -> crate::Result<ArchiveMetadata> {
    let mut manifest = packager.metadata_for(plan.root, plan.max_zoom)?;
    let template = if hash {
        "{h}/{z}/{x}/{y}.zip"
    } else {
        "{z}/{x}/{y}.zip"
    };
    manifest.materialized_zooms = Some(plan.materialize_zooms.clone());
    manifest.source = Some(join_uri(target, template));
    Ok(manifest)
}

/// Run a job to completion.
///
/// Sink failures are counted and never abort the job. A failed branch
/// either halts the job or is skipped, per `on_branch_failure`.
pub async fn run_job(
    scheduler: &MaterializationScheduler,
    sink: &dyn Sink,
    options: &JobOptions,
) -> Result<JobStats> {
    let format = scheduler.config().format;
    if !scheduler.renderer().supports(format) {
        anyhow::bail!("The configured renderer cannot produce {} tiles", format);
    }

    let plan = &options.plan;
    let template = ArchiveMetadata::new(
        options.name.as_str(),
        options.description.as_str(),
        format,
        scheduler.config().scale,
        plan.metatile,
    );
    let packager = ArchivePackager::new(template, format);
    let roots = plan.subpyramid_roots()?;
    let metrics = scheduler.metrics().clone();

    tracing::info!(
        "Materializing {} to zoom {} as {} archives (metatile {}, zooms {:?})",
        plan.root,
        plan.max_zoom,
        roots.len(),
        plan.metatile,
        plan.materialize_zooms
    );

    // Start metrics reporter if enabled
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let reporter_handle = match options.metrics_interval_secs {
        Some(secs) => {
            let reporter = MetricsReporter::new(metrics.clone(), secs, roots.len() as u64);
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        }
        None => {
            drop(shutdown_rx);
            None
        }
    };

    let result = materialize(scheduler, sink, options, &packager, &roots, &metrics).await;

    // Shutdown metrics reporter
    let _ = shutdown_tx.send(()).await;
    if let Some(handle) = reporter_handle {
        let _ = handle.await;
    }

    result?;

    if let Some(ref path) = options.metrics_output_path {
        if let Err(e) = metrics.snapshot().save_to_file(path) {
            tracing::warn!("Failed to save metrics to {}: {}", path, e);
        }
    }

    let stats = JobStats::collect(roots.len(), &metrics);
    tracing::info!("Job complete: {}", stats);
    Ok(stats)
}

async fn materialize(
    scheduler: &MaterializationScheduler,
    sink: &dyn Sink,
    options: &JobOptions,
    packager: &ArchivePackager,
    roots: &[Tile],
    metrics: &Metrics,
) -> Result<()> {
    let plan = &options.plan;

    if !options.skip_meta {
        let manifest = job_manifest(packager, plan, &options.target, options.hash)?;
        let body = Bytes::from(serde_json::to_vec_pretty(&manifest)?);
        let target = join_uri(&options.target, "meta.json");
        if let Err(e) = sink.write(body, &target).await {
            metrics.add_sink_failure();
            tracing::warn!("{}", e);
        }
    }

    for root in roots {
        let output = match scheduler.render_branch(plan, *root).await {
            Ok(output) => output,
            Err(e @ Error::RenderFailure { .. })
                if options.on_branch_failure == BranchFailurePolicy::Skip =>
            {
                metrics.add_branch_failure();
                tracing::error!("Skipping archive {}: {}", root, e);
                continue;
            }
            Err(e) => {
                metrics.add_branch_failure();
                return Err(e).with_context(|| format!("Failed to materialize archive {}", root));
            }
        };

        let start = Instant::now();
        let body = packager
            .pack(&output.tiles, output.root, output.max_zoom)
            .with_context(|| format!("Failed to package archive {}", root))?;
        metrics.add_pack_time(start.elapsed());

        let target = join_uri(&options.target, &format!("{}.zip", archive_key(root, options.hash)));
        let size = body.len() as u64;
        match sink.write(body, &target).await {
            Ok(()) => {
                metrics.add_archive_written(size);
                tracing::info!("Wrote {} ({} tiles, {} bytes)", target, output.tiles.len(), size);
            }
            Err(e) => {
                metrics.add_sink_failure();
                tracing::warn!("{}", e);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FootprintIndex, SpatialIndex};
    use crate::pipeline::{FootprintRenderer, RenderExecutor, SchedulerConfig, TileFormat};
    use crate::testing::{square_source, RecordingSink, ScriptedRenderer, UnavailableIndex};
    use std::io::{Cursor, Read};
    use std::sync::Arc;

    fn tile(z: u8, x: u32, y: u32) -> Tile {
        Tile::new(z, x, y).unwrap()
    }

    fn world_index() -> Arc<dyn SpatialIndex> {
        Arc::new(FootprintIndex::new(vec![Arc::new(square_source(
            "s3://lc/world.tif",
            [-180.0, -85.06, 180.0, 85.06],
            100.0,
        ))]))
    }

    fn scheduler_with(
        index: Arc<dyn SpatialIndex>,
        renderer: Arc<dyn RenderExecutor>,
        format: TileFormat,
    ) -> MaterializationScheduler {
        MaterializationScheduler::new(
            index,
            renderer,
            Metrics::new(),
            SchedulerConfig {
                concurrency: 4,
                format,
                transformation: format.transformation(0),
                scale: 2,
            },
        )
    }

    fn scheduler(renderer: Arc<dyn RenderExecutor>) -> MaterializationScheduler {
        scheduler_with(world_index(), renderer, TileFormat::Json)
    }

    /// Root 0/0/0 to zoom 2, materialized at 0 and 1: five archives.
    fn options() -> JobOptions {
        JobOptions {
            plan: MaterializationPlan::new(tile(0, 0, 0), 2, 1, &[1]).unwrap(),
            target: "file:///tmp/out".to_string(),
            hash: false,
            skip_meta: false,
            name: "Land Cover".to_string(),
            description: "test".to_string(),
            on_branch_failure: BranchFailurePolicy::Halt,
            metrics_interval_secs: None,
            metrics_output_path: None,
        }
    }

    fn entry_names(body: &Bytes) -> Vec<String> {
        let mut archive = zip::ZipArchive::new(Cursor::new(body.to_vec())).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn test_archive_key() {
        let t = tile(4, 3, 9);
        assert_eq!(archive_key(&t, false), "4/3/9");

        let hashed = archive_key(&t, true);
        let (prefix, rest) = hashed.split_once('/').unwrap();
        assert_eq!(rest, "4/3/9");
        assert_eq!(prefix, "e4168");
        assert_eq!(archive_key(&tile(0, 0, 0), true), "0bd23/0/0/0");
    }

    #[tokio::test]
    async fn test_writes_manifest_and_one_archive_per_root() {
        let sink = RecordingSink::new();
        let stats = run_job(&scheduler(Arc::new(ScriptedRenderer::new())), &sink, &options())
            .await
            .unwrap();

        assert_eq!(
            sink.targets(),
            vec![
                "file:///tmp/out/meta.json",
                "file:///tmp/out/0/0/0.zip",
                "file:///tmp/out/1/0/0.zip",
                "file:///tmp/out/1/1/0.zip",
                "file:///tmp/out/1/1/1.zip",
                "file:///tmp/out/1/0/1.zip",
            ]
        );
        assert_eq!(stats.branches, 5);
        assert_eq!(stats.archives_written, 5);
        assert_eq!(stats.tiles_rendered, 1 + 4 * 5);

        let writes = sink.writes();
        // Zoom 0 stops before the next materialized zoom
        assert_eq!(entry_names(&writes[1].1), vec!["0/0/0@2x.json"]);
        assert_eq!(
            entry_names(&writes[2].1),
            vec![
                "1/0/0@2x.json",
                "2/0/0@2x.json",
                "2/1/0@2x.json",
                "2/1/1@2x.json",
                "2/0/1@2x.json"
            ]
        );

        let manifest: serde_json::Value = serde_json::from_slice(&writes[0].1).unwrap();
        assert_eq!(manifest["materializedZooms"], serde_json::json!([0, 1]));
        assert_eq!(manifest["source"], "file:///tmp/out/{z}/{x}/{y}.zip");
        assert_eq!(manifest["minzoom"], 0);
        assert_eq!(manifest["maxzoom"], 2);
        assert_eq!(manifest["root"], "0/0/0");
    }

    #[tokio::test]
    async fn test_hashed_keys_and_skip_meta() {
        let sink = RecordingSink::new();
        let mut opts = options();
        opts.hash = true;
        opts.skip_meta = true;

        run_job(&scheduler(Arc::new(ScriptedRenderer::new())), &sink, &opts)
            .await
            .unwrap();

        let targets = sink.targets();
        assert_eq!(targets.len(), 5);
        assert!(targets.iter().all(|t| !t.ends_with("meta.json")));
        assert_eq!(
            targets[1],
            format!("file:///tmp/out/{}.zip", archive_key(&tile(1, 0, 0), true))
        );
    }

    #[tokio::test]
    async fn test_hashed_manifest_template() {
        let sink = RecordingSink::new();
        let mut opts = options();
        opts.hash = true;
        run_job(&scheduler(Arc::new(ScriptedRenderer::new())), &sink, &opts)
            .await
            .unwrap();

        let manifest: serde_json::Value = serde_json::from_slice(&sink.writes()[0].1).unwrap();
        assert_eq!(manifest["source"], "file:///tmp/out/{h}/{z}/{x}/{y}.zip");
    }

    #[tokio::test]
    async fn test_render_failure_halts_without_partial_archive() {
        let sink = RecordingSink::new();
        let renderer = Arc::new(ScriptedRenderer::new().fail_on(tile(2, 1, 1)));

        let err = run_job(&scheduler(renderer), &sink, &options())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("1/0/0"));

        // Nothing for the failed branch or after it
        assert_eq!(
            sink.targets(),
            vec!["file:///tmp/out/meta.json", "file:///tmp/out/0/0/0.zip"]
        );
    }

    #[tokio::test]
    async fn test_render_failure_skipped() {
        let sink = RecordingSink::new();
        let renderer = Arc::new(ScriptedRenderer::new().fail_on(tile(2, 1, 1)));
        let mut opts = options();
        opts.on_branch_failure = BranchFailurePolicy::Skip;

        let stats = run_job(&scheduler(renderer), &sink, &opts).await.unwrap();
        assert_eq!(stats.branch_failures, 1);
        assert_eq!(stats.archives_written, 4);
        assert!(!sink.targets().contains(&"file:///tmp/out/1/0/0.zip".to_string()));
    }

    #[tokio::test]
    async fn test_catalog_failure_halts_even_when_skipping() {
        let sink = RecordingSink::new();
        let scheduler = scheduler_with(
            Arc::new(UnavailableIndex),
            Arc::new(ScriptedRenderer::new()),
            TileFormat::Json,
        );
        let mut opts = options();
        opts.on_branch_failure = BranchFailurePolicy::Skip;

        assert!(run_job(&scheduler, &sink, &opts).await.is_err());
        assert_eq!(sink.targets(), vec!["file:///tmp/out/meta.json"]);
    }

    #[tokio::test]
    async fn test_sink_failure_is_counted_not_fatal() {
        let sink = RecordingSink::failing_on("1/1/0.zip");
        let stats = run_job(&scheduler(Arc::new(ScriptedRenderer::new())), &sink, &options())
            .await
            .unwrap();

        assert_eq!(stats.sink_failures, 1);
        assert_eq!(stats.archives_written, 4);
        assert_eq!(sink.targets().len(), 5);
    }

    #[tokio::test]
    async fn test_unsupported_format_rejected_up_front() {
        let sink = RecordingSink::new();
        let scheduler = scheduler_with(world_index(), Arc::new(FootprintRenderer), TileFormat::Png);

        assert!(run_job(&scheduler, &sink, &options()).await.is_err());
        assert!(sink.targets().is_empty());
    }

    #[tokio::test]
    async fn test_footprint_archives_contain_geojson() {
        let sink = RecordingSink::new();
        let mut opts = options();
        opts.plan = MaterializationPlan::new(tile(1, 1, 0), 2, 1, &[]).unwrap();
        opts.skip_meta = true;

        run_job(&scheduler(Arc::new(FootprintRenderer)), &sink, &opts)
            .await
            .unwrap();

        let writes = sink.writes();
        assert_eq!(writes.len(), 1);
        let mut archive = zip::ZipArchive::new(Cursor::new(writes[0].1.to_vec())).unwrap();
        let mut body = String::new();
        archive
            .by_name("1/1/0@2x.json")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        let doc: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(doc["type"], "FeatureCollection");
    }
}

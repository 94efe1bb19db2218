//! Per-branch render scheduling.
//!
//! For one sub-pyramid root the scheduler enumerates the branch's tiles,
//! resolves each tile's sources on the calling task, then fans rendering out
//! to blocking worker threads with bounded concurrency. Results are written
//! into a slot per submitted tile, so the output order always matches the
//! planner's emission order.

use crate::catalog::{resolve_sources, QueryRegion, SpatialIndex};
use crate::error::Error;
use crate::pipeline::render::{RenderExecutor, RenderRequest, RenderedTile, TileFormat, Transformation};
use crate::pipeline::Metrics;
use crate::pyramid::MaterializationPlan;
use crate::tile::Tile;
use crate::Result;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum renders in flight
    pub concurrency: usize,

    pub format: TileFormat,

    pub transformation: Transformation,

    /// Pixel density; tiles are `256 × scale` pixels per side
    pub scale: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let concurrency = std::thread::available_parallelism()
            .map(|n| n.get() * 2)
            .unwrap_or(2);
        Self {
            concurrency,
            format: TileFormat::Json,
            transformation: TileFormat::Json.transformation(0),
            scale: 2,
        }
    }
}

/// Rendered contents of one sub-pyramid.
#[derive(Debug, Clone)]
pub struct BranchOutput {
    pub root: Tile,
    /// Deepest zoom in the branch
    pub max_zoom: u8,
    /// In planner order
    pub tiles: Vec<RenderedTile>,
}

/// Renders whole branches of a materialization plan.
pub struct MaterializationScheduler {
    index: Arc<dyn SpatialIndex>,
    renderer: Arc<dyn RenderExecutor>,
    metrics: Arc<Metrics>,
    config: SchedulerConfig,
}

impl MaterializationScheduler {
    pub fn new(
        index: Arc<dyn SpatialIndex>,
        renderer: Arc<dyn RenderExecutor>,
        metrics: Arc<Metrics>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            index,
            renderer,
            metrics,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn renderer(&self) -> &Arc<dyn RenderExecutor> {
        &self.renderer
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Render every tile of the branch rooted at `branch_root`.
    ///
    /// Fails on the first render error; no partial output is returned.
    pub async fn render_branch(
        &self,
        plan: &MaterializationPlan,
        branch_root: Tile,
    ) -> Result<BranchOutput> {
        let max_zoom = plan.branch_max_zoom(&branch_root);
        let tiles: Vec<Tile> = plan.branch(branch_root)?.tiles().collect();

        tracing::info!(
            "Rendering {} to zoom {} ({} tiles)",
            branch_root,
            max_zoom,
            tiles.len()
        );

        let requests = self.resolve(&tiles)?;
        let tiles = self.render_all(requests).await?;

        Ok(BranchOutput {
            root: branch_root,
            max_zoom,
            tiles,
        })
    }

    /// Resolve each tile's ordered sources up front.
    fn resolve(&self, tiles: &[Tile]) -> Result<Vec<RenderRequest>> {
        let start = Instant::now();
        let requests = tiles
            .iter()
            .map(|tile| {
                let region = QueryRegion::for_tile(tile, self.config.scale);
                Ok(RenderRequest {
                    tile: *tile,
                    sources: resolve_sources(self.index.as_ref(), &region)?,
                    format: self.config.format,
                    transformation: self.config.transformation,
                    scale: self.config.scale,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.metrics.add_resolve_time(start.elapsed());
        Ok(requests)
    }

    /// Render requests on the blocking pool, returning results in request order.
    pub async fn render_all(&self, requests: Vec<RenderRequest>) -> Result<Vec<RenderedTile>> {
        let tiles: Vec<Tile> = requests.iter().map(|r| r.tile).collect();
        let mut slots: Vec<Option<RenderedTile>> = (0..requests.len()).map(|_| None).collect();

        let mut results = stream::iter(requests.into_iter().enumerate())
            .map(|(slot, request)| {
                let renderer = Arc::clone(&self.renderer);
                let metrics = Arc::clone(&self.metrics);
                async move {
                    let tile = request.tile;
                    let handle = tokio::task::spawn_blocking(move || {
                        let start = Instant::now();
                        let result = renderer.render(&request);
                        (result, start.elapsed())
                    });

                    let (result, elapsed) = handle.await.map_err(|e| Error::RenderFailure {
                        tile,
                        reason: format!("render task failed: {}", e),
                    })?;
                    let rendered = result?;

                    metrics.add_render_time(elapsed);
                    metrics.add_tile_rendered();
                    tracing::debug!(
                        "({}) Took {:.3}s to render tile ({} bytes)",
                        tile,
                        elapsed.as_secs_f64(),
                        rendered.data.len()
                    );
                    Ok::<_, Error>((slot, rendered))
                }
            })
            .buffer_unordered(self.config.concurrency.max(1));

        while let Some(result) = results.next().await {
            let (slot, rendered) = result?;
            slots[slot] = Some(rendered);
        }

        slots
            .into_iter()
            .zip(tiles)
            .map(|(slot, tile)| {
                slot.ok_or_else(|| Error::RenderFailure {
                    tile,
                    reason: "no result collected".to_string(),
                })
            })
            .collect()
    }
}

//! Greedy source selection for a query region.
//!
//! [`SourceResolver`] repeatedly asks the index for footprints intersecting
//! the still-uncovered part of the region, takes the single best-ranked one,
//! and subtracts its footprint. It stops once nothing is left uncovered or no
//! candidate remains.
//!
//! ## Ranking
//!
//! `score = priority × recency × zoom_penalty × overlap`
//!
//! - `priority` defaults to 0.5
//! - `recency = 1 − (now − acquired) / (now − floor)`, where `floor` is the
//!   index's earliest acquisition date (1970-01-01 if none) and `acquired`
//!   defaults to 2000-01-01. Not clamped.
//! - `zoom_penalty = 1` when `target / source.resolution ≥ 1`, otherwise
//!   `1 / source.resolution`.
//! - `overlap` is the fraction of the full query box the footprint covers.
//!
//! NaN scores rank last; equal scores are ordered by url.

use super::source::Source;
use super::spatial_index::SpatialIndex;
use crate::crs::{bounds_to_geometry, clamp_to_world, transform_bounds, Bounds, Crs};
use crate::error::Error;
use crate::tile::{tile_resolution, zoom_for_resolution, Tile};
use crate::Result;
use chrono::{DateTime, NaiveDate, Utc};
use geo::MultiPolygon;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::iter::FusedIterator;
use std::sync::Arc;

/// Unix timestamp of 2000-01-01, assumed for sources without a date.
const DEFAULT_ACQUIRED_SECS: i64 = 946_684_800;

/// Unix timestamp of 1970-01-01, the floor for an undated catalog.
const CATALOG_FLOOR_SECS: i64 = 0;

/// Ground resolution along each axis, in meters per pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolutionPair {
    pub x: f64,
    pub y: f64,
}

impl ResolutionPair {
    pub fn square(resolution: f64) -> Self {
        Self {
            x: resolution,
            y: resolution,
        }
    }

    /// The coarser component; determines the lookup zoom.
    pub fn coarsest(&self) -> f64 {
        self.x.max(self.y)
    }

    /// The finer component; compared against source resolution.
    pub fn finest(&self) -> f64 {
        self.x.min(self.y)
    }
}

/// Area and target resolution for one resolve call.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRegion {
    /// Bounds in `crs`
    pub bounds: Bounds,
    pub crs: Crs,
    pub resolution: ResolutionPair,
}

impl QueryRegion {
    pub fn new(bounds: Bounds, crs: Crs, resolution: ResolutionPair) -> Self {
        Self {
            bounds,
            crs,
            resolution,
        }
    }

    /// Region for rendering `tile` at `scale` (256 × scale pixels per side).
    pub fn for_tile(tile: &Tile, scale: u32) -> Self {
        Self {
            bounds: tile.xy_bounds(),
            crs: Crs::WebMercator,
            resolution: ResolutionPair::square(tile_resolution(tile.z, scale)),
        }
    }

    /// Region given in any EPSG-coded reference system.
    pub fn with_code(bounds: Bounds, crs: &str, resolution: ResolutionPair) -> Result<Self> {
        Ok(Self::new(bounds, Crs::parse(crs)?, resolution))
    }

    /// The query box in WGS84 with non-finite extremes replaced by world bounds.
    pub fn wgs84_bounds(&self) -> Result<Bounds> {
        Ok(clamp_to_world(transform_bounds(
            &self.bounds,
            self.crs,
            Crs::Wgs84,
        )?))
    }

    /// Zoom level used to filter sources by validity range.
    pub fn lookup_zoom(&self) -> u8 {
        zoom_for_resolution(self.resolution.coarsest())
    }
}

/// A selected source and how much of the region it newly covers.
#[derive(Debug, Clone)]
pub struct RankedSource {
    pub source: Arc<Source>,

    /// Fraction of the query box covered by this source and not by any
    /// earlier pick
    pub coverage: f64,

    /// Ranking score at selection time
    pub score: f64,

    residual: MultiPolygon<f64>,
}

impl RankedSource {
    /// What remained uncovered after this pick.
    pub(crate) fn residual(&self) -> &MultiPolygon<f64> {
        &self.residual
    }
}

/// Lazy greedy set-cover over an index.
///
/// Holds private mutable state; create one per query.
pub struct SourceResolver<'a> {
    index: &'a dyn SpatialIndex,
    bbox: MultiPolygon<f64>,
    bbox_area: f64,
    uncovered: MultiPolygon<f64>,
    excluded: HashSet<String>,
    lookup_zoom: u8,
    target_resolution: f64,
    now: DateTime<Utc>,
    floor_secs: Option<i64>,
    /// Reprojection failure reported by the first `next`
    pending: Option<Error>,
    done: bool,
}

impl<'a> SourceResolver<'a> {
    pub fn new(index: &'a dyn SpatialIndex, region: &QueryRegion) -> Self {
        Self::with_clock(index, region, Utc::now())
    }

    /// Resolver that scores recency against a fixed `now`.
    pub fn with_clock(index: &'a dyn SpatialIndex, region: &QueryRegion, now: DateTime<Utc>) -> Self {
        let (bbox, pending) = match region.wgs84_bounds() {
            Ok(bounds) => (bounds_to_geometry(&bounds), None),
            Err(e) => (MultiPolygon::new(Vec::new()), Some(e)),
        };
        let bbox_area = index.area(&bbox);
        let done = pending.is_none() && !(bbox_area.is_finite() && bbox_area > 0.0);
        if done {
            tracing::debug!("Degenerate query box {:?}, nothing to resolve", region.bounds);
        }

        Self {
            index,
            uncovered: bbox.clone(),
            bbox,
            bbox_area,
            excluded: HashSet::new(),
            lookup_zoom: region.lookup_zoom(),
            target_resolution: region.resolution.finest(),
            now,
            floor_secs: None,
            pending,
            done,
        }
    }

    /// Geometry not yet covered by any yielded source.
    pub fn uncovered(&self) -> &MultiPolygon<f64> {
        &self.uncovered
    }

    fn floor_secs(&mut self) -> Result<i64> {
        if let Some(secs) = self.floor_secs {
            return Ok(secs);
        }
        let secs = self
            .index
            .min_acquired_at()?
            .map(date_secs)
            .unwrap_or(CATALOG_FLOOR_SECS);
        self.floor_secs = Some(secs);
        Ok(secs)
    }

    fn score(&self, source: &Source, floor_secs: i64) -> f64 {
        let now = self.now.timestamp() as f64;
        let acquired = source
            .acquired_at
            .map(date_secs)
            .unwrap_or(DEFAULT_ACQUIRED_SECS) as f64;
        let recency = 1.0 - (now - acquired) / (now - floor_secs as f64);

        let zoom_penalty = if self.target_resolution / source.resolution >= 1.0 {
            1.0
        } else {
            1.0 / source.resolution
        };

        let overlap = self
            .index
            .area(&self.index.intersection(&self.bbox, &source.geom))
            / self.bbox_area;

        source.priority() * recency * zoom_penalty * overlap
    }

    fn next_pick(&mut self) -> Result<Option<RankedSource>> {
        let floor_secs = self.floor_secs()?;
        let zoom = self.lookup_zoom;
        let candidates = self
            .index
            .intersecting(&self.uncovered, &self.excluded, zoom..=zoom)?;

        let mut best: Option<(f64, Arc<Source>)> = None;
        for source in candidates {
            if let Err(e) = source.validate() {
                tracing::warn!("Skipping source: {}", e);
                self.excluded.insert(source.url.clone());
                continue;
            }

            let score = self.score(&source, floor_secs);
            let better = match &best {
                None => true,
                Some((best_score, best_source)) => {
                    rank(score, &source.url, *best_score, &best_source.url) == Ordering::Less
                }
            };
            if better {
                best = Some((score, source));
            }
        }

        let Some((score, source)) = best else {
            return Ok(None);
        };

        let covered = self.index.intersection(&self.uncovered, &source.geom);
        let coverage = self.index.area(&covered) / self.bbox_area;
        let residual = self.index.difference(&self.uncovered, &source.geom);

        self.excluded.insert(source.url.clone());
        self.uncovered = residual.clone();
        if residual.0.is_empty() || self.index.area(&residual) <= 0.0 {
            self.done = true;
        }

        tracing::debug!(
            "Selected {} (score {:.4}, coverage {:.4})",
            source.url,
            score,
            coverage
        );

        Ok(Some(RankedSource {
            source,
            coverage,
            score,
            residual,
        }))
    }
}

impl Iterator for SourceResolver<'_> {
    type Item = Result<RankedSource>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending.take() {
            self.done = true;
            return Some(Err(e));
        }
        if self.done {
            return None;
        }
        match self.next_pick() {
            Ok(Some(ranked)) => Some(Ok(ranked)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl FusedIterator for SourceResolver<'_> {}

/// Ordering for candidates: higher score first, NaN last, then url.
fn rank(a_score: f64, a_url: &str, b_score: f64, b_url: &str) -> Ordering {
    let by_score = match (a_score.is_nan(), b_score.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b_score.partial_cmp(&a_score).unwrap_or(Ordering::Equal),
    };
    by_score.then_with(|| a_url.cmp(b_url))
}

fn date_secs(date: NaiveDate) -> i64 {
    date.and_time(chrono::NaiveTime::MIN).and_utc().timestamp()
}

/// Resolve the ordered source list for a region.
pub fn resolve_sources(index: &dyn SpatialIndex, region: &QueryRegion) -> Result<Vec<Arc<Source>>> {
    SourceResolver::new(index, region)
        .map(|ranked| ranked.map(|r| r.source))
        .collect()
}

//! Footprint indexes: the persistent catalog and the per-job ephemeral cache.

use super::source::{parse_catalog, IndexedSource, Source};
use crate::crs::{bounds_to_geometry, union_bounds, Bounds};
use crate::error::Error;
use crate::io::read_uri;
use crate::pyramid::PyramidPlanner;
use crate::tile::Tile;
use crate::Result;
use chrono::NaiveDate;
use geo::{Area, BooleanOps, BoundingRect, Intersects, MultiPolygon};
use rstar::{RTree, AABB};
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Intersection queries and geometry algebra over WGS84 footprints.
///
/// Implementations are shared across the resolver and the job driver, but
/// the resolver only queries from the coordinating task.
pub trait SpatialIndex: Send + Sync {
    /// Sources whose footprint intersects `geometry`, whose url is not in
    /// `exclude`, and whose `[min_zoom, max_zoom]` overlaps `zooms`.
    fn intersecting(
        &self,
        geometry: &MultiPolygon<f64>,
        exclude: &HashSet<String>,
        zooms: RangeInclusive<u8>,
    ) -> Result<Vec<Arc<Source>>>;

    /// Earliest acquisition date across the indexed sources.
    fn min_acquired_at(&self) -> Result<Option<NaiveDate>>;

    fn intersection(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64> {
        a.intersection(b)
    }

    fn difference(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64> {
        a.difference(b)
    }

    fn area(&self, geometry: &MultiPolygon<f64>) -> f64 {
        geometry.unsigned_area()
    }
}

/// R-tree over source footprints.
pub struct FootprintIndex {
    /// All indexed sources, in load order
    sources: Vec<Arc<Source>>,

    /// R-tree of footprint envelopes
    rtree: RTree<IndexedSource>,

    /// Earliest `acquired_at` across sources
    min_acquired_at: Option<NaiveDate>,
}

impl FootprintIndex {
    /// Build an index, skipping sources with malformed geometry.
    pub fn new(sources: Vec<Arc<Source>>) -> Self {
        let mut kept = Vec::with_capacity(sources.len());
        let mut entries = Vec::with_capacity(sources.len());

        for source in sources {
            if let Err(e) = source.validate() {
                tracing::warn!("Not indexing source: {}", e);
                continue;
            }
            if let Some(entry) = IndexedSource::new(Arc::clone(&source)) {
                entries.push(entry);
                kept.push(source);
            }
        }

        let min_acquired_at = kept.iter().filter_map(|s| s.acquired_at).min();

        Self {
            sources: kept,
            rtree: RTree::bulk_load(entries),
            min_acquired_at,
        }
    }

    /// Query sources whose envelope and footprint intersect `geometry`.
    pub fn query(
        &self,
        geometry: &MultiPolygon<f64>,
        exclude: &HashSet<String>,
        zooms: &RangeInclusive<u8>,
    ) -> Vec<Arc<Source>> {
        let Some(bounds) = geometry_bounds(geometry) else {
            return Vec::new();
        };
        let envelope = AABB::from_corners([bounds[0], bounds[1]], [bounds[2], bounds[3]]);

        self.rtree
            .locate_in_envelope_intersecting(&envelope)
            .map(|entry| &entry.source)
            .filter(|s| !exclude.contains(&s.url))
            .filter(|s| s.covers_zooms(zooms))
            .filter(|s| s.geom.intersects(geometry))
            .cloned()
            .collect()
    }

    /// Get all sources.
    pub fn sources(&self) -> &[Arc<Source>] {
        &self.sources
    }

    /// Get the number of sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Check if index is empty.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Get the overall bounding box in WGS84.
    pub fn bounds_wgs84(&self) -> Option<Bounds> {
        self.sources
            .iter()
            .filter_map(|s| s.bounds())
            .reduce(|a, b| union_bounds(&a, &b))
    }
}

fn geometry_bounds(geometry: &MultiPolygon<f64>) -> Option<Bounds> {
    geometry
        .bounding_rect()
        .map(|r| [r.min().x, r.min().y, r.max().x, r.max().y])
}

impl SpatialIndex for FootprintIndex {
    fn intersecting(
        &self,
        geometry: &MultiPolygon<f64>,
        exclude: &HashSet<String>,
        zooms: RangeInclusive<u8>,
    ) -> Result<Vec<Arc<Source>>> {
        Ok(self.query(geometry, exclude, &zooms))
    }

    fn min_acquired_at(&self) -> Result<Option<NaiveDate>> {
        Ok(self.min_acquired_at)
    }
}

/// The long-lived catalog of every registered footprint.
pub struct PersistentIndex {
    /// Where the catalog was loaded from
    location: String,
    index: FootprintIndex,
}

impl PersistentIndex {
    pub fn new(location: impl Into<String>, sources: Vec<Source>) -> Self {
        let location = location.into();
        let index = FootprintIndex::new(sources.into_iter().map(Arc::new).collect());
        tracing::info!("Indexed {} sources from {}", index.len(), location);
        Self { location, index }
    }

    /// Load a GeoJSON footprint catalog from a local path or S3 URI.
    ///
    /// Any failure to fetch or parse the document is reported as
    /// [`Error::CatalogUnavailable`].
    pub async fn load(location: &str) -> Result<Self> {
        let bytes = read_uri(location)
            .await
            .map_err(|e| Error::CatalogUnavailable(format!("{}: {:#}", location, e)))?;
        let sources = parse_catalog(&bytes)?;
        Ok(Self::new(location, sources))
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn index(&self) -> &FootprintIndex {
        &self.index
    }
}

impl SpatialIndex for PersistentIndex {
    fn intersecting(
        &self,
        geometry: &MultiPolygon<f64>,
        exclude: &HashSet<String>,
        zooms: RangeInclusive<u8>,
    ) -> Result<Vec<Arc<Source>>> {
        self.index.intersecting(geometry, exclude, zooms)
    }

    fn min_acquired_at(&self) -> Result<Option<NaiveDate>> {
        self.index.min_acquired_at()
    }
}

/// In-process cache of the footprints relevant to one job.
///
/// Populated once from an upstream index so that per-tile resolution does
/// not go back to the catalog.
pub struct EphemeralIndex {
    index: FootprintIndex,
}

impl EphemeralIndex {
    /// Copy every upstream source intersecting the `metatile` block anchored
    /// at `root` whose zoom range overlaps `root.z..=max_zoom`.
    pub fn populate(
        upstream: &dyn SpatialIndex,
        root: Tile,
        max_zoom: u8,
        metatile: u32,
    ) -> Result<Self> {
        let zooms = root.z..=max_zoom.max(root.z);
        let bounds = PyramidPlanner::new(root, root.z, metatile)?.root_block_bounds();
        let area = bounds_to_geometry(&bounds);
        let sources = upstream.intersecting(&area, &HashSet::new(), zooms.clone())?;

        tracing::info!(
            "Cached {} sources for root tile {} (metatile {}) from zoom {} to {}",
            sources.len(),
            root,
            metatile,
            zooms.start(),
            zooms.end()
        );

        Ok(Self {
            index: FootprintIndex::new(sources),
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl SpatialIndex for EphemeralIndex {
    fn intersecting(
        &self,
        geometry: &MultiPolygon<f64>,
        exclude: &HashSet<String>,
        zooms: RangeInclusive<u8>,
    ) -> Result<Vec<Arc<Source>>> {
        self.index.intersecting(geometry, exclude, zooms)
    }

    fn min_acquired_at(&self) -> Result<Option<NaiveDate>> {
        self.index.min_acquired_at()
    }
}

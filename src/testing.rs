//! Test doubles shared by unit tests across modules.

use crate::catalog::{SpatialIndex, Source};
use crate::crs::{bounds_to_geometry, Bounds};
use crate::error::Error;
use crate::io::Sink;
use crate::pipeline::{RenderExecutor, RenderRequest, RenderedTile, TileFormat};
use crate::tile::Tile;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDate;
use geo::MultiPolygon;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Undated source with a rectangular footprint.
pub fn square_source(url: &str, bounds: Bounds, resolution: f64) -> Source {
    Source::new(url, resolution, bounds_to_geometry(&bounds))
}

/// Source acquired on January 1st of `year`.
pub fn dated_source(url: &str, bounds: Bounds, resolution: f64, year: i32) -> Source {
    let mut source = square_source(url, bounds, resolution);
    source.acquired_at = NaiveDate::from_ymd_opt(year, 1, 1);
    source
}

/// Index whose backing store cannot be reached.
pub struct UnavailableIndex;

impl SpatialIndex for UnavailableIndex {
    fn intersecting(
        &self,
        _geometry: &MultiPolygon<f64>,
        _exclude: &HashSet<String>,
        _zooms: RangeInclusive<u8>,
    ) -> Result<Vec<Arc<Source>>> {
        Err(Error::CatalogUnavailable("connection refused".to_string()))
    }

    fn min_acquired_at(&self) -> Result<Option<NaiveDate>> {
        Err(Error::CatalogUnavailable("connection refused".to_string()))
    }
}

/// Index that returns every non-excluded source without validating it.
pub struct StaticIndex {
    sources: Vec<Arc<Source>>,
}

impl StaticIndex {
    pub fn new(sources: Vec<Source>) -> Self {
        Self {
            sources: sources.into_iter().map(Arc::new).collect(),
        }
    }
}

impl SpatialIndex for StaticIndex {
    fn intersecting(
        &self,
        _geometry: &MultiPolygon<f64>,
        exclude: &HashSet<String>,
        _zooms: RangeInclusive<u8>,
    ) -> Result<Vec<Arc<Source>>> {
        Ok(self
            .sources
            .iter()
            .filter(|s| !exclude.contains(&s.url))
            .cloned()
            .collect())
    }

    fn min_acquired_at(&self) -> Result<Option<NaiveDate>> {
        Ok(None)
    }
}

/// Renderer that encodes `"{tile}:{source count}"`, with scripted delays,
/// failures and panics per tile.
#[derive(Default)]
pub struct ScriptedRenderer {
    delays: HashMap<Tile, Duration>,
    fail_on: HashSet<Tile>,
    panic_on: HashSet<Tile>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    completed: Mutex<Vec<Tile>>,
}

impl ScriptedRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, tile: Tile, delay: Duration) -> Self {
        self.delays.insert(tile, delay);
        self
    }

    pub fn fail_on(mut self, tile: Tile) -> Self {
        self.fail_on.insert(tile);
        self
    }

    pub fn panic_on(mut self, tile: Tile) -> Self {
        self.panic_on.insert(tile);
        self
    }

    /// Tiles in the order their renders finished.
    pub fn completion_order(&self) -> Vec<Tile> {
        self.completed.lock().unwrap().clone()
    }
}

impl RenderExecutor for ScriptedRenderer {
    fn supports(&self, _format: TileFormat) -> bool {
        true
    }

    fn render(&self, request: &RenderRequest) -> Result<RenderedTile> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delays.get(&request.tile) {
            std::thread::sleep(*delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.panic_on.contains(&request.tile) {
            panic!("scripted panic for {}", request.tile);
        }
        self.completed.lock().unwrap().push(request.tile);
        if self.fail_on.contains(&request.tile) {
            return Err(Error::RenderFailure {
                tile: request.tile,
                reason: "scripted failure".to_string(),
            });
        }

        Ok(RenderedTile {
            tile: request.tile,
            headers: BTreeMap::new(),
            data: Bytes::from(format!("{}:{}", request.tile, request.sources.len())),
        })
    }
}

/// Sink that records writes in memory and can fail for chosen targets.
#[derive(Default)]
pub struct RecordingSink {
    writes: Mutex<Vec<(String, Bytes)>>,
    fail_suffix: Option<String>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every write whose target ends with `suffix`.
    pub fn failing_on(suffix: &str) -> Self {
        Self {
            writes: Mutex::new(Vec::new()),
            fail_suffix: Some(suffix.to_string()),
        }
    }

    pub fn writes(&self) -> Vec<(String, Bytes)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn targets(&self) -> Vec<String> {
        self.writes().into_iter().map(|(t, _)| t).collect()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn write(&self, body: Bytes, target: &str) -> Result<()> {
        if let Some(suffix) = &self.fail_suffix {
            if target.ends_with(suffix.as_str()) {
                return Err(Error::SinkWriteFailure {
                    target: target.to_string(),
                    reason: "scripted failure".to_string(),
                });
            }
        }
        self.writes
            .lock()
            .unwrap()
            .push((target.to_string(), body));
        Ok(())
    }
}

//! The render seam: turning a tile and its ordered sources into encoded bytes.
//!
//! Raster decoding and compositing live behind [`RenderExecutor`]. The crate
//! ships [`FootprintRenderer`], which encodes the sources' footprints clipped
//! to the tile as GeoJSON.

use crate::catalog::{geometry_to_geojson, Source};
use crate::crs::bounds_to_geometry;
use crate::error::Error;
use crate::tile::{Tile, TILE_SIZE};
use crate::Result;
use bytes::Bytes;
use geo::{Area, BooleanOps};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Encoded tile output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
    /// Paletted GeoTIFF
    Tif,
    /// Paletted PNG
    Png,
    /// GeoJSON
    Json,
}

impl TileFormat {
    /// File extension used in archive entry names.
    pub fn ext(&self) -> &'static str {
        match self {
            TileFormat::Tif => "tif",
            TileFormat::Png => "png",
            TileFormat::Json => "json",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            TileFormat::Tif => "image/tiff",
            TileFormat::Png => "image/png",
            TileFormat::Json => "application/json",
        }
    }

    /// Extension → content type map for archive metadata.
    pub fn formats(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(self.ext().to_string(), self.content_type().to_string())])
    }

    /// Transformation applied when rendering this format.
    pub fn transformation(&self, buffer: u32) -> Transformation {
        match self {
            TileFormat::Tif => Transformation::Identity,
            TileFormat::Png => Transformation::Colormap,
            TileFormat::Json => Transformation::Collar { pixels: buffer },
        }
    }
}

impl std::fmt::Display for TileFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.ext())
    }
}

/// Post-processing requested of the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transformation {
    Identity,
    /// Map class values through the land-cover palette
    Colormap,
    /// Render a margin of `pixels` around the tile
    Collar { pixels: u32 },
}

/// Everything a renderer needs for one tile.
///
/// Sources are resolved before dispatch so that workers never query the index.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub tile: Tile,
    /// Best-ranked first
    pub sources: Vec<Arc<Source>>,
    pub format: TileFormat,
    pub transformation: Transformation,
    pub scale: u32,
}

/// Output of a successful render.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedTile {
    pub tile: Tile,
    pub headers: BTreeMap<String, String>,
    pub data: Bytes,
}

/// Renders one tile.
///
/// Must be deterministic for identical requests. Called from blocking
/// worker threads, one request per call.
pub trait RenderExecutor: Send + Sync {
    fn supports(&self, format: TileFormat) -> bool;

    fn render(&self, request: &RenderRequest) -> Result<RenderedTile>;
}

/// Renders a tile as a GeoJSON FeatureCollection of its sources' footprints.
#[derive(Debug, Default, Clone, Copy)]
pub struct FootprintRenderer;

impl FootprintRenderer {
    fn features(&self, request: &RenderRequest) -> Vec<serde_json::Value> {
        let [west, south, east, north] = request.tile.bounds();
        let margin = match request.transformation {
            Transformation::Collar { pixels } => {
                let per_pixel = (east - west) / (f64::from(TILE_SIZE) * f64::from(request.scale.max(1)));
                per_pixel * f64::from(pixels)
            }
            _ => 0.0,
        };
        let clip = bounds_to_geometry(&[
            west - margin,
            (south - margin).max(-90.0),
            east + margin,
            (north + margin).min(90.0),
        ]);

        request
            .sources
            .iter()
            .filter_map(|source| {
                let clipped = source.geom.intersection(&clip);
                if clipped.0.is_empty() || clipped.unsigned_area() <= 0.0 {
                    return None;
                }
                Some(serde_json::json!({
                    "type": "Feature",
                    "geometry": geometry_to_geojson(&clipped),
                    "properties": {
                        "name": source.name,
                        "url": source.url,
                        "resolution": source.resolution,
                        "priority": source.priority(),
                        "acquired_at": source.acquired_at.map(|d| d.to_string()),
                    },
                }))
            })
            .collect()
    }
}

impl RenderExecutor for FootprintRenderer {
    fn supports(&self, format: TileFormat) -> bool {
        format == TileFormat::Json
    }

    fn render(&self, request: &RenderRequest) -> Result<RenderedTile> {
        if !self.supports(request.format) {
            return Err(Error::RenderFailure {
                tile: request.tile,
                reason: format!("footprint renderer cannot produce {}", request.format),
            });
        }

        let body = serde_json::json!({
            "type": "FeatureCollection",
            "features": self.features(request),
        });
        let data = serde_json::to_vec(&body)?;

        Ok(RenderedTile {
            tile: request.tile,
            headers: BTreeMap::from([(
                "Content-Type".to_string(),
                TileFormat::Json.content_type().to_string(),
            )]),
            data: Bytes::from(data),
        })
    }
}

//! Tapalcatl 2 archive packaging.
//!
//! One zip per sub-pyramid. Entries are named `{z}/{x}/{y}@{scale}x.{ext}`
//! (no suffix at scale 1), deflate-compressed, mode 0o755, all stamped with
//! the packager's build time. The archive's metadata document is stored as
//! the zip comment.

use crate::crs::Bounds;
use crate::pipeline::{RenderedTile, TileFormat};
use crate::pyramid::PyramidPlanner;
use crate::tile::Tile;
use crate::Result;
use bytes::Bytes;
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Schema version written to every metadata document.
pub const TAPALCATL_VERSION: &str = "2.0.0";

/// Metadata sidecar for an archive or a whole job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub tapalcatl: String,
    pub name: String,
    pub description: String,
    pub minzoom: u8,
    pub maxzoom: u8,
    /// WGS84 [west, south, east, north]
    pub bounds: Bounds,
    /// Extension → content type
    pub formats: BTreeMap<String, String>,
    pub minscale: u32,
    pub maxscale: u32,
    /// Only present when greater than 1
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metatile: Option<u32>,
    /// `z/x/y` of the archive's root tile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    /// Job manifest only
    #[serde(
        rename = "materializedZooms",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub materialized_zooms: Option<Vec<u8>>,
    /// Job manifest only: template locating each archive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl ArchiveMetadata {
    /// Metadata shared by every archive of a job.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        format: TileFormat,
        scale: u32,
        metatile: u32,
    ) -> Self {
        Self {
            tapalcatl: TAPALCATL_VERSION.to_string(),
            name: name.into(),
            description: description.into(),
            minzoom: 0,
            maxzoom: 0,
            bounds: [-180.0, -90.0, 180.0, 90.0],
            formats: format.formats(),
            minscale: scale,
            maxscale: scale,
            metatile: (metatile > 1).then_some(metatile),
            root: None,
            materialized_zooms: None,
            source: None,
        }
    }

    pub fn metatile_size(&self) -> u32 {
        self.metatile.unwrap_or(1)
    }
}

/// Builds one archive per branch from rendered tiles.
#[derive(Debug, Clone)]
pub struct ArchivePackager {
    template: ArchiveMetadata,
    ext: &'static str,
    scale: u32,
    timestamp: zip::DateTime,
}

impl ArchivePackager {
    /// Packager stamping entries with the current time.
    pub fn new(template: ArchiveMetadata, format: TileFormat) -> Self {
        Self::with_timestamp(template, format, Utc::now())
    }

    pub fn with_timestamp(template: ArchiveMetadata, format: TileFormat, at: DateTime<Utc>) -> Self {
        let scale = template.minscale;
        Self {
            template,
            ext: format.ext(),
            scale,
            timestamp: zip_timestamp(at),
        }
    }

    pub fn template(&self) -> &ArchiveMetadata {
        &self.template
    }

    /// Archive entry name for a tile.
    pub fn entry_name(&self, tile: &Tile) -> String {
        if self.scale == 1 {
            format!("{}/{}/{}.{}", tile.z, tile.x, tile.y, self.ext)
        } else {
            format!("{}/{}/{}@{}x.{}", tile.z, tile.x, tile.y, self.scale, self.ext)
        }
    }

    /// Metadata for the archive rooted at `root`.
    ///
    /// Bounds cover the root's whole metatile block.
    pub fn metadata_for(&self, root: Tile, max_zoom: u8) -> Result<ArchiveMetadata> {
        let bounds = PyramidPlanner::new(root, root.z, self.template.metatile_size())?
            .root_block_bounds();

        Ok(ArchiveMetadata {
            minzoom: root.z,
            maxzoom: max_zoom,
            bounds,
            root: Some(root.path()),
            materialized_zooms: None,
            source: None,
            ..self.template.clone()
        })
    }

    /// Package `tiles`, in the given order, into a zip archive.
    pub fn pack(&self, tiles: &[RenderedTile], root: Tile, max_zoom: u8) -> Result<Bytes> {
        let metadata = self.metadata_for(root, max_zoom)?;
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(self.timestamp)
            .unix_permissions(0o755);

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        zip.set_comment(serde_json::to_string(&metadata)?);

        for rendered in tiles {
            tracing::debug!("Packing {}", rendered.tile);
            zip.start_file(self.entry_name(&rendered.tile), options)?;
            zip.write_all(&rendered.data)?;
        }

        let cursor = zip.finish()?;
        Ok(Bytes::from(cursor.into_inner()))
    }
}

/// Zip timestamps cover 1980..=2107; anything else falls back to 1980-01-01.
fn zip_timestamp(at: DateTime<Utc>) -> zip::DateTime {
    let year = u16::try_from(at.year()).unwrap_or(0);
    zip::DateTime::from_date_and_time(
        year,
        at.month() as u8,
        at.day() as u8,
        at.hour() as u8,
        at.minute() as u8,
        at.second() as u8,
    )
    .unwrap_or_default()
}

//! Error types for source resolution and pyramid materialization.

use crate::tile::Tile;
use thiserror::Error;

/// Errors raised by the resolver, scheduler, packager and sinks.
#[derive(Debug, Error)]
pub enum Error {
    /// The spatial index could not be reached or loaded.
    #[error("Catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// A source record carries geometry that cannot be used.
    #[error("Malformed geometry for source {source_id}: {reason}")]
    MalformedGeometry {
        /// Identifier (url) of the offending source.
        source_id: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A render task failed; the current archive batch is abandoned.
    #[error("Failed to render tile {tile}: {reason}")]
    RenderFailure {
        /// Tile being rendered.
        tile: Tile,
        /// Reason for failure.
        reason: String,
    },

    /// Writing an archive or manifest to its target failed.
    #[error("Failed to write {target}: {reason}")]
    SinkWriteFailure {
        /// Target URI.
        target: String,
        /// Reason for failure.
        reason: String,
    },

    /// Tile coordinates outside the quadtree at their zoom.
    #[error("Invalid tile {z}/{x}/{y}")]
    InvalidTile {
        /// Zoom level.
        z: u8,
        /// Column.
        x: u32,
        /// Row.
        y: u32,
    },

    /// Metatile size that is not a power of two.
    #[error("Metatile size {0} must be a power of 2")]
    InvalidMetatile(u32),

    /// CRS that cannot be parsed or has no transformation to the target.
    #[error("Unsupported CRS: {0}")]
    UnsupportedCrs(String),

    /// A coordinate fell outside the domain of a transformation.
    #[error("Failed to reproject from {from} to {to}: {reason}")]
    Reprojection {
        from: String,
        to: String,
        reason: String,
    },

    /// Zip container error.
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

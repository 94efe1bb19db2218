//! Source catalog: footprint records, spatial indexes, and source resolution.

mod resolver;
mod source;
mod spatial_index;

pub use resolver::{resolve_sources, QueryRegion, RankedSource, ResolutionPair, SourceResolver};
pub use source::{
    geometry_from_geojson, geometry_to_geojson, parse_catalog, parse_date, Source, DEFAULT_PRIORITY,
};
pub use spatial_index::{EphemeralIndex, FootprintIndex, PersistentIndex, SpatialIndex};

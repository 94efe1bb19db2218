//! I/O: archive packaging, URI handling and sinks.

mod archive;
mod store;

pub use archive::{ArchiveMetadata, ArchivePackager, TAPALCATL_VERSION};
pub use store::{
    create_local_store, create_s3_store, join_uri, parse_location, parse_s3_uri, read_uri,
    Location, Sink, UriSink,
};

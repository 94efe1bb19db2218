//! Configuration for a land-cover materialization job.

use crate::io::parse_location;
use crate::pipeline::{BranchFailurePolicy, TileFormat};
use crate::tile::{Tile, MAX_ZOOM};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Largest supported pixel density.
pub const MAX_SCALE: u32 = 4;

/// Main configuration for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Footprint catalog configuration
    pub catalog: CatalogConfig,

    /// Which pyramid to materialize
    pub job: JobConfig,

    /// Where and how archives are written
    #[serde(default)]
    pub output: OutputConfig,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// Footprint catalog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Local path or `s3://bucket/key` of a GeoJSON FeatureCollection
    pub path: String,

    /// Query a per-job cache of footprints under the root tile instead of
    /// the whole catalog
    #[serde(default = "default_true")]
    pub cache_sources: bool,
}

/// Root tile and zoom range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
    pub max_zoom: u8,

    /// Zooms at which standalone archives start
    #[serde(default)]
    pub materialize: Vec<u8>,

    /// Side of the tile block sharing one archive (power of two)
    #[serde(default = "default_metatile")]
    pub metatile: u32,

    /// Pixel density
    #[serde(default = "default_scale")]
    pub scale: u32,
}

impl JobConfig {
    /// Job for `zoom/x/y` down to `max_zoom` with default metatile and scale.
    pub fn new(zoom: u8, x: u32, y: u32, max_zoom: u8) -> Self {
        Self {
            zoom,
            x,
            y,
            max_zoom,
            materialize: Vec::new(),
            metatile: default_metatile(),
            scale: default_scale(),
        }
    }

    pub fn root(&self) -> crate::Result<Tile> {
        Tile::new(self.zoom, self.x, self.y)
    }
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Base URI: a local path, `file://` or `s3://bucket/prefix`
    #[serde(default = "default_target")]
    pub target: String,

    #[serde(default = "default_format")]
    pub format: TileFormat,

    /// Prefix archive keys with a short digest
    #[serde(default)]
    pub hash: bool,

    /// Don't write `meta.json`
    #[serde(default)]
    pub skip_meta: bool,

    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_description")]
    pub description: String,

    /// Collar, in pixels, rendered around JSON tiles
    #[serde(default)]
    pub buffer: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            format: default_format(),
            hash: false,
            skip_meta: false,
            name: default_name(),
            description: default_description(),
            buffer: 0,
        }
    }
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Maximum tiles rendering at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Enable metrics reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,

    #[serde(default)]
    pub on_branch_failure: BranchFailurePolicy,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            worker_threads: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
            on_branch_failure: BranchFailurePolicy::Halt,
        }
    }
}

impl Config {
    /// Configuration with default output and processing sections.
    pub fn new(catalog_path: impl Into<String>, job: JobConfig) -> Self {
        Self {
            catalog: CatalogConfig {
                path: catalog_path.into(),
                cache_sources: true,
            },
            job,
            output: OutputConfig::default(),
            processing: ProcessingConfig::default(),
        }
    }

    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.catalog.path.trim().is_empty() {
            anyhow::bail!("Catalog path must not be empty");
        }

        let job = &self.job;
        if job.zoom > MAX_ZOOM || job.max_zoom > MAX_ZOOM {
            anyhow::bail!("Zoom levels must be <= {}", MAX_ZOOM);
        }
        job.root()
            .with_context(|| format!("Root tile {}/{}/{} is outside the grid", job.zoom, job.x, job.y))?;
        if job.max_zoom < job.zoom {
            anyhow::bail!("max_zoom ({}) must be >= zoom ({})", job.max_zoom, job.zoom);
        }
        if !job.metatile.is_power_of_two() {
            anyhow::bail!("Metatile size must be a power of two, got {}", job.metatile);
        }
        if !(1..=MAX_SCALE).contains(&job.scale) {
            anyhow::bail!("Scale must be between 1 and {}, got {}", MAX_SCALE, job.scale);
        }

        if self.processing.concurrency == 0 {
            anyhow::bail!("Concurrency must be > 0");
        }
        if self.processing.worker_threads == Some(0) {
            anyhow::bail!("worker_threads must be > 0");
        }

        parse_location(&self.output.target)
            .with_context(|| format!("Invalid output target '{}'", self.output.target))?;

        Ok(())
    }
}

/// Commented sample configuration.
pub const SAMPLE_CONFIG: &str = r#"# Land cover tile pyramid configuration

# === CATALOG: Source footprints ===
catalog:
  # GeoJSON FeatureCollection of footprints (local path or s3://bucket/key)
  path: "footprints.geojson"

  # Cache footprints under the root tile for the duration of the job
  cache_sources: true

# === JOB: Which pyramid to build ===
job:
  # Root tile
  zoom: 0
  x: 0
  y: 0

  # Deepest zoom to render
  max_zoom: 6

  # Zooms at which standalone archives start (root zoom is always included)
  materialize: [3]

  # Tiles per side sharing one archive (power of two)
  metatile: 1

  # Pixel density (2 = 512px tiles)
  scale: 2

# === OUTPUT: Where to write archives ===
output:
  # Local path, file:// URI or s3://bucket/prefix
  target: "file://./tiles"

  # json | png | tif
  format: json

  # Prefix archive keys with a 5-character digest to spread S3 keys
  hash: false

  # Don't write meta.json
  skip_meta: false

  name: "Land Cover"
  description: "Unified land cover, derived from MODIS-LC, ESACCI-LC, NLCD, and C-CAP."

  # Collar (pixels) around JSON tiles
  buffer: 0

# === PROCESSING: Performance tuning ===
processing:
  # Tiles rendering concurrently (default: 2x available cores)
  # concurrency: 16

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 8

  # Print throughput metrics during processing
  enable_metrics: true

  # Metrics reporting interval in seconds
  metrics_interval_secs: 10

  # Save final metrics as JSON
  # metrics_output_path: "metrics.json"

  # halt | skip
  on_branch_failure: halt
"#;

// Default value functions for serde
fn default_true() -> bool { true }
fn default_metatile() -> u32 { 1 }
fn default_scale() -> u32 { 2 }
fn default_target() -> String { "file://./".to_string() }
fn default_format() -> TileFormat { TileFormat::Json }
fn default_name() -> String { "Land Cover".to_string() }
fn default_description() -> String {
    "Unified land cover, derived from MODIS-LC, ESACCI-LC, NLCD, and C-CAP.".to_string()
}
fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(2)
}
fn default_metrics_interval() -> u64 { 10 }

//! Land Cover Tiles CLI
//!
//! Materializes land-cover tile pyramids as Tapalcatl 2 archives.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use landcover_tiles::catalog::ResolutionPair;
use landcover_tiles::config::{JobConfig, SAMPLE_CONFIG};
use landcover_tiles::pipeline::{BranchFailurePolicy, TileFormat};
use landcover_tiles::{
    build_runtime, plan_from_config, query_sources, run_materialization, Config, QueryRegion,
};

#[derive(Parser)]
#[command(name = "landcover-tiles")]
#[command(about = "Render land cover tile pyramids into archives", long_about = None)]
struct Cli {
    /// Path to configuration file; command-line flags override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a pyramid and write its archives
    Render(RenderArgs),

    /// Print the archives a job would write, without rendering
    Plan(JobArgs),

    /// Print the sources chosen for an area, best first
    Sources(SourcesArgs),

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

/// Root tile and zoom range.
#[derive(Args, Debug, Default)]
struct JobArgs {
    /// Root tile column
    #[arg(short = 'x', long)]
    x: Option<u32>,

    /// Root tile row
    #[arg(short = 'y', long)]
    y: Option<u32>,

    /// Root tile zoom
    #[arg(short = 'z', long)]
    zoom: Option<u8>,

    /// Deepest zoom to render
    #[arg(short = 'Z', long)]
    max_zoom: Option<u8>,

    /// Zoom at which standalone archives start (repeatable)
    #[arg(short = 'm', long = "materialize")]
    materialize: Vec<u8>,

    /// Tiles per side sharing one archive (power of two)
    #[arg(short = 'M', long, value_parser = parse_metatile)]
    metatile: Option<u32>,

    /// Pixel density
    #[arg(long)]
    scale: Option<u32>,

    /// Footprint catalog (local path or s3://bucket/key)
    #[arg(long)]
    catalog: Option<String>,
}

#[derive(Args, Debug)]
struct RenderArgs {
    #[command(flatten)]
    job: JobArgs,

    /// Tiles rendering at once
    #[arg(short = 'c', long)]
    concurrency: Option<usize>,

    /// Output format
    #[arg(short = 'f', long, value_enum)]
    format: Option<TileFormat>,

    /// Prefix archive keys with a short digest
    #[arg(short = 'H', long)]
    hash: bool,

    /// Don't write meta.json
    #[arg(short = 's', long)]
    skip_meta: bool,

    /// Query the full catalog for every tile
    #[arg(long)]
    no_cache_sources: bool,

    /// Continue with the next archive when one fails to render
    #[arg(long)]
    skip_failed: bool,

    /// Collar, in pixels, rendered around JSON tiles
    #[arg(long)]
    buffer: Option<u32>,

    /// Output URI (local path, file:// or s3://bucket/prefix)
    target: Option<String>,
}

#[derive(Args, Debug)]
struct SourcesArgs {
    /// Area as west,south,east,north
    #[arg(long, value_delimiter = ',', num_args = 4, allow_hyphen_values = true)]
    bounds: Vec<f64>,

    /// Reference system of --bounds
    #[arg(long, default_value = "EPSG:4326")]
    crs: String,

    /// Target resolution in meters per pixel
    #[arg(short = 'r', long)]
    resolution: f64,

    /// Footprint catalog (local path or s3://bucket/key)
    #[arg(long)]
    catalog: Option<String>,
}

fn parse_metatile(s: &str) -> std::result::Result<u32, String> {
    let size: u32 = s.parse().map_err(|e| format!("{}", e))?;
    if size.is_power_of_two() {
        Ok(size)
    } else {
        Err(format!("{} is not a power of two", size))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    match cli.command {
        Commands::Render(args) => render_command(cli.config, args)?,
        Commands::Plan(args) => plan_command(cli.config, args)?,
        Commands::Sources(args) => sources_command(cli.config, args)?,
        Commands::Validate => validate_command(cli.config)?,
        Commands::GenerateConfig { output } => generate_config_command(output)?,
    }

    Ok(())
}

/// Load the config file if given, otherwise build one from flags, then
/// apply job overrides.
fn load_config(path: Option<PathBuf>, args: &JobArgs) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(&path)?,
        None => {
            let zoom = args.zoom.context("--zoom is required without --config")?;
            let x = args.x.context("-x is required without --config")?;
            let y = args.y.context("-y is required without --config")?;
            let max_zoom = args.max_zoom.unwrap_or(zoom);
            Config::new(String::new(), JobConfig::new(zoom, x, y, max_zoom))
        }
    };

    let job = &mut config.job;
    if let Some(zoom) = args.zoom {
        job.zoom = zoom;
    }
    if let Some(x) = args.x {
        job.x = x;
    }
    if let Some(y) = args.y {
        job.y = y;
    }
    if let Some(max_zoom) = args.max_zoom {
        job.max_zoom = max_zoom;
    }
    if !args.materialize.is_empty() {
        job.materialize = args.materialize.clone();
    }
    if let Some(metatile) = args.metatile {
        job.metatile = metatile;
    }
    if let Some(scale) = args.scale {
        job.scale = scale;
    }
    if let Some(catalog) = &args.catalog {
        config.catalog.path = catalog.clone();
    }

    Ok(config)
}

fn apply_render_overrides(config: &mut Config, args: &RenderArgs) {
    if let Some(c) = args.concurrency {
        config.processing.concurrency = c;
    }
    if let Some(format) = args.format {
        config.output.format = format;
    }
    if let Some(buffer) = args.buffer {
        config.output.buffer = buffer;
    }
    if let Some(target) = &args.target {
        config.output.target = target.clone();
    }
    if args.hash {
        config.output.hash = true;
    }
    if args.skip_meta {
        config.output.skip_meta = true;
    }
    if args.no_cache_sources {
        config.catalog.cache_sources = false;
    }
    if args.skip_failed {
        config.processing.on_branch_failure = BranchFailurePolicy::Skip;
    }
}

fn render_command(config_path: Option<PathBuf>, args: RenderArgs) -> Result<()> {
    let mut config = load_config(config_path, &args.job)?;
    apply_render_overrides(&mut config, &args);
    config.validate()?;

    let runtime = build_runtime(config.processing.worker_threads)?;
    let stats = runtime.block_on(run_materialization(config))?;

    if stats.sink_failures > 0 {
        anyhow::bail!("{} archive writes failed", stats.sink_failures);
    }
    Ok(())
}

fn plan_command(config_path: Option<PathBuf>, args: JobArgs) -> Result<()> {
    let config = load_config(config_path, &args)?;
    let plan = plan_from_config(&config)?;
    let roots = plan.subpyramid_roots()?;

    println!("\n=== Plan ===");
    println!("Root: {} to zoom {}", plan.root, plan.max_zoom);
    println!("Metatile: {}", plan.metatile);
    println!("Materialized zooms: {:?}", plan.materialize_zooms);
    println!("Archives: {}", roots.len());

    let mut total = 0;
    for root in &roots {
        let tiles = plan.branch(*root)?.tiles().count();
        total += tiles;
        println!("  {} -> z{} ({} tiles)", root, plan.branch_max_zoom(root), tiles);
    }
    println!("Total tiles: {}", total);
    println!("============\n");

    Ok(())
}

fn sources_command(config_path: Option<PathBuf>, args: SourcesArgs) -> Result<()> {
    let catalog = match (args.catalog, config_path) {
        (Some(catalog), _) => catalog,
        (None, Some(path)) => Config::from_file(&path)?.catalog.path,
        (None, None) => anyhow::bail!("--catalog or --config is required"),
    };
    let region = source_region(&args.bounds, &args.crs, args.resolution)?;

    let runtime = build_runtime(None)?;
    let ranked = runtime.block_on(query_sources(&catalog, &region))?;

    println!("\n=== Sources ===");
    println!("Region: {:?} ({})", region.bounds, region.crs);
    println!("Lookup zoom: {}", region.lookup_zoom());
    for (i, pick) in ranked.iter().enumerate() {
        println!(
            "  {:>2}. {} (score {:.4}, coverage {:.4})",
            i + 1,
            pick.source.url,
            pick.score,
            pick.coverage
        );
    }
    println!("===============\n");

    Ok(())
}

fn source_region(bounds: &[f64], crs: &str, resolution: f64) -> Result<QueryRegion> {
    let [west, south, east, north] = bounds else {
        anyhow::bail!("--bounds takes exactly four values");
    };
    if !(resolution.is_finite() && resolution > 0.0) {
        anyhow::bail!("Resolution must be a positive number, got {}", resolution);
    }
    Ok(QueryRegion::with_code(
        [*west, *south, *east, *north],
        crs,
        ResolutionPair::square(resolution),
    )?)
}

fn validate_command(config_path: Option<PathBuf>) -> Result<()> {
    let path = config_path.context("validate requires --config")?;
    let config = Config::from_file(&path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    std::fs::write(&output, SAMPLE_CONFIG)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

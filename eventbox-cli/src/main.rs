//! CLI for the eventbox event storage engine.
//!
//! Provides commands for inspecting and copying container files, printing
//! box controller settings, and filling a file-backed tree with synthetic
//! events.

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use eventbox::controller::{BoxController, BoxControllerSettings};
use eventbox::file_io::FileBoxIo;
use eventbox::io::BoxControllerIo;
use eventbox::tree::{BoxNode, Extent, MdEvent};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// eventbox: out-of-core multidimensional event storage CLI.
#[derive(Parser)]
#[command(name = "eventbox", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Display a container's data type, size and free space.
    Info {
        /// Path to the container file.
        file: PathBuf,

        /// Output format.
        #[arg(long, default_value = "text")]
        format: InfoFormat,
    },

    /// Copy a container to a new path.
    Copy {
        /// Existing container.
        source: PathBuf,

        /// Destination path.
        destination: PathBuf,
    },

    /// Build a box controller from flags and print its settings.
    Controller {
        #[command(flatten)]
        policy: PolicyArgs,

        /// Output format.
        #[arg(long, default_value = "xml")]
        format: SettingsFormat,
    },

    /// Fill a file-backed tree with pseudo-random events.
    Simulate {
        /// Container file to write.
        output: PathBuf,

        #[command(flatten)]
        policy: PolicyArgs,

        /// Read the controller settings from a JSON file instead of flags.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of events to add.
        #[arg(long, default_value = "100000")]
        events: u64,

        /// Blocks held in the write buffer.
        #[arg(long, default_value = "64")]
        buffer: usize,

        /// Store lean events (signal, error and coordinates only).
        #[arg(long)]
        lean: bool,

        /// Store coordinates in double precision.
        #[arg(long)]
        double: bool,

        /// Seed for the event generator.
        #[arg(long, default_value = "1")]
        seed: u64,
    },
}

/// Split policy flags shared by `controller` and `simulate`.
#[derive(clap::Args)]
struct PolicyArgs {
    /// Number of dimensions.
    #[arg(long, default_value = "3")]
    dims: usize,

    /// Fan-out applied to every dimension.
    #[arg(long, default_value = "2")]
    split_into: usize,

    /// Top-level fan-out override, as DIM=N. May be repeated.
    #[arg(long, value_parser = parse_override)]
    split_top: Vec<(usize, usize)>,

    /// Events a leaf may hold before it splits.
    #[arg(long, default_value = "1000")]
    threshold: u64,

    /// Maximum tree depth.
    #[arg(long, default_value = "5")]
    max_depth: usize,
}

/// Output format for `info`.
#[derive(Clone, ValueEnum)]
enum InfoFormat {
    /// Human-readable summary.
    Text,
    /// JSON object.
    Json,
}

/// Output format for controller settings.
#[derive(Clone, ValueEnum)]
enum SettingsFormat {
    /// The XML blob stored with datasets.
    Xml,
    /// JSON settings, usable with `simulate --config`.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Info { file, format } => cmd_info(&file, &format),
        Commands::Copy {
            source,
            destination,
        } => cmd_copy(&source, &destination),
        Commands::Controller { policy, format } => cmd_controller(&policy, &format),
        Commands::Simulate {
            output,
            policy,
            config,
            events,
            buffer,
            lean,
            double,
            seed,
        } => cmd_simulate(&SimulateOptions {
            output,
            policy,
            config,
            events,
            buffer,
            lean,
            double,
            seed,
        }),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `eventbox info <file>`.
fn cmd_info(file: &Path, format: &InfoFormat) -> Result<(), Box<dyn std::error::Error>> {
    let info = FileBoxIo::inspect(file)?;

    match format {
        InfoFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
        InfoFormat::Text => {
            let layout = info.schema.layout(info.n_dims);
            let free: u64 = info.free_space.iter().map(|&(_, length)| length).sum();

            println!("Container: {}", file.display());
            println!();
            println!("  Dimensions: {}", info.n_dims);
            println!("  Event kind: {}", info.schema.kind());
            println!("  Data version: {}", info.schema.version());
            println!("  Precision: {} bytes", info.schema.coord_size().bytes());
            println!(
                "  Columns: {} in memory, {} on disk",
                layout.n_data_columns(),
                layout.data_event_count()
            );
            println!("  Events: {} (capacity {})", info.event_count, info.capacity);
            println!("  File size: {}", format_bytes(info.file_size));
            println!();
            println!(
                "Free space: {} extents, {free} events",
                info.free_space.len()
            );
            for (position, length) in &info.free_space {
                println!("  - {position}..{}", position + length);
            }
        }
    }

    Ok(())
}

/// Implements `eventbox copy <source> <destination>`.
fn cmd_copy(source: &Path, destination: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let info = FileBoxIo::inspect(source)?;
    let mut io = FileBoxIo::new(info.n_dims);
    io.open_file(source, "r")?;
    io.copy_file_to(destination)?;
    io.close_file()?;

    println!(
        "Copied {} ({} events) to {}",
        source.display(),
        info.event_count,
        destination.display()
    );
    Ok(())
}

/// Implements `eventbox controller`.
fn cmd_controller(
    policy: &PolicyArgs,
    format: &SettingsFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let controller = build_controller(policy)?;
    match format {
        SettingsFormat::Xml => println!("{}", controller.to_xml_string()),
        SettingsFormat::Json => println!("{}", controller.to_json()?),
    }
    Ok(())
}

/// Everything `simulate` needs.
struct SimulateOptions {
    output: PathBuf,
    policy: PolicyArgs,
    config: Option<PathBuf>,
    events: u64,
    buffer: usize,
    lean: bool,
    double: bool,
    seed: u64,
}

/// Implements `eventbox simulate <output>`.
#[allow(clippy::cast_precision_loss)] // throughput stats are fine with f64 precision
fn cmd_simulate(options: &SimulateOptions) -> Result<(), Box<dyn std::error::Error>> {
    let mut controller = match &options.config {
        Some(path) => {
            let settings: BoxControllerSettings =
                serde_json::from_str(&std::fs::read_to_string(path)?)?;
            BoxController::from_settings(&settings)?
        }
        None => build_controller(&options.policy)?,
    };
    let n_dims = controller.n_dims();

    let mut io = FileBoxIo::new(n_dims);
    io.set_data_type(
        if options.double { 8 } else { 4 },
        if options.lean { "MDLeanEvent" } else { "MDEvent" },
    )?;
    controller.set_file_backed(Box::new(io), &options.output)?;
    if let Some(buffer) = controller.file_io_mut() {
        buffer.set_write_buffer_size(options.buffer)?;
    }
    info!(
        output = %options.output.display(),
        events = options.events,
        dims = n_dims,
        "starting simulation"
    );

    println!("eventbox tree simulation");
    println!("  Output: {}", options.output.display());
    println!("  Events: {}", options.events);
    println!("  Dimensions: {n_dims}");
    println!(
        "  Split into: {} (top level {})",
        controller.num_split(),
        controller.num_split_for_depth(0)
    );
    println!("  Threshold: {}", controller.split_threshold());
    println!("  Max depth: {}", controller.max_depth());
    println!();

    let start = Instant::now();
    let mut root = BoxNode::new_root(&mut controller, vec![Extent::new(0.0, 1.0); n_dims])?;
    let mut rng = SmallRng::seed_from_u64(options.seed);
    for i in 0..options.events {
        let center = random_center(&mut rng, n_dims);
        #[allow(clippy::cast_possible_truncation)]
        let event = MdEvent::new(
            1.0,
            1.0,
            (i % 16) as u16,
            0,
            (i % u64::from(u32::MAX)) as u32,
            center,
        );
        root.add_event(event, &mut controller)?;
    }
    root.evict(&mut controller)?;
    let elapsed = start.elapsed();

    let stats = controller.file_io().map(|buffer| buffer.stats());
    controller.clear_file_backed()?;

    println!("Results:");
    println!("  Elapsed: {elapsed:.3?}");
    println!(
        "  Throughput: {:.0} events/sec",
        options.events as f64 / elapsed.as_secs_f64()
    );
    println!("  Average depth: {:.3}", controller.average_depth());
    println!("  Box ids used: {}", controller.max_id());
    println!();
    println!("Leaves by depth:");
    for (depth, (leaves, grids)) in controller
        .num_md_boxes()
        .iter()
        .zip(controller.num_md_grid_boxes())
        .enumerate()
    {
        println!("  {depth}: {leaves} leaves, {grids} grid boxes");
    }
    if let Some(stats) = stats {
        println!();
        println!("Disk buffer:");
        println!("  Hits: {}", stats.hits);
        println!("  Misses: {}", stats.misses);
        println!("  Blocks written: {}", stats.flushed_blocks);
    }

    let info = FileBoxIo::inspect(&options.output)?;
    println!();
    println!(
        "Container: {} events, {}",
        info.event_count,
        format_bytes(info.file_size)
    );

    Ok(())
}

/// Builds a controller from command-line policy flags.
fn build_controller(policy: &PolicyArgs) -> eventbox::Result<BoxController> {
    let mut controller = BoxController::new(policy.dims)?;
    controller.set_split_into(policy.split_into)?;
    for &(dim, n) in &policy.split_top {
        controller.set_split_top_into(dim, n)?;
    }
    controller.set_split_threshold(policy.threshold);
    controller.set_max_depth(policy.max_depth)?;
    Ok(controller)
}

/// Parses a `DIM=N` override.
fn parse_override(s: &str) -> Result<(usize, usize), String> {
    let (dim, n) = s
        .split_once('=')
        .ok_or_else(|| format!("expected DIM=N, got '{s}'"))?;
    let dim = dim
        .trim()
        .parse()
        .map_err(|e| format!("bad dimension '{dim}': {e}"))?;
    let n = n
        .trim()
        .parse()
        .map_err(|e| format!("bad fan-out '{n}': {e}"))?;
    Ok((dim, n))
}

/// Uniform point in the unit cube.
fn random_center(rng: &mut SmallRng, n_dims: usize) -> Vec<f64> {
    (0..n_dims).map(|_| rng.r#gen::<f64>()).collect()
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)] // Display only
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

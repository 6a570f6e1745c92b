use anyhow::Context;
use clap::{Parser, Subcommand};
use motionkit::{
    check_firmware_updates, init_logging_with_level, load_firmware_manifest, Axis, DeviceInfo,
    HexRecordParser, HexRecordProcessor, LineTransport, NoOpControlLines, NodeId, RobotConfig,
    SerialLineTransport, SimulatedTransport, SmoothieDriver,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// MotionKit - motion controller and firmware tooling for liquid-handling robots
#[derive(Parser, Debug)]
#[command(name = "motionkit", version, long_about = None)]
struct Args {
    /// Robot config file (.json or .toml); defaults to the platform config dir
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Serial port of the motion controller; overrides the config
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Drive a simulated controller instead of real hardware
    #[arg(long, global = true, default_value_t = false)]
    simulate: bool,

    /// Enable debug logging
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Home axes in dependency order
    Home {
        /// Axis letters to home
        #[arg(default_value = "XYZABC")]
        axes: String,
    },
    /// Move axes to absolute coordinates, e.g. `X=100 Y=50.5`
    Move {
        #[arg(required = true, value_parser = parse_axis_target)]
        targets: Vec<(Axis, f64)>,

        /// Combined speed in mm/s for this move
        #[arg(long)]
        speed: Option<f64>,
    },
    /// Print the controller's position and switch state
    Position,
    /// Parse a hex file and print chunk statistics
    HexInfo {
        file: PathBuf,

        #[arg(long, default_value_t = motionkit::firmware_update::DATA_PAYLOAD_SIZE)]
        chunk_size: usize,
    },
    /// List nodes whose firmware differs from a manifest
    CheckUpdates {
        /// Firmware manifest JSON
        #[arg(long)]
        manifest: PathBuf,

        /// JSON array of device info snapshots
        #[arg(long)]
        devices: PathBuf,

        /// Only consider these nodes (e.g. `head`, `gantry-x`)
        #[arg(long = "target")]
        targets: Vec<String>,

        /// Update even when hashes match
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

fn parse_axis_target(s: &str) -> Result<(Axis, f64), String> {
    let (axis, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected AXIS=VALUE, got '{}'", s))?;
    let axis: Axis = axis.parse().map_err(|e| format!("{}", e))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid coordinate '{}'", value))?;
    Ok((axis, value))
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RobotConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => RobotConfig::default_path()?,
    };
    Ok(RobotConfig::load_or_default(&path)?)
}

async fn connect(args: &Args) -> anyhow::Result<SmoothieDriver> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(port) = &args.port {
        config.connection.port = port.clone();
    }

    let transport: Box<dyn LineTransport> = if args.simulate {
        tracing::info!("Using simulated motion controller");
        Box::new(SimulatedTransport::new())
    } else if config.connection.port.is_empty() {
        Box::new(SerialLineTransport::open_first(config.connection.baud_rate)?)
    } else {
        Box::new(SerialLineTransport::open(
            &config.connection.port,
            config.connection.baud_rate,
        )?)
    };

    let mut driver = SmoothieDriver::new(transport, Arc::new(NoOpControlLines), config);
    driver.setup().await.context("controller setup failed")?;
    Ok(driver)
}

fn hex_info(file: &Path, chunk_size: usize) -> anyhow::Result<()> {
    let parser = HexRecordParser::open(file)?;
    let mut chunks = HexRecordProcessor::process(parser, chunk_size)?;
    let mut count = 0usize;
    let mut bytes = 0usize;
    let mut range: Option<(u32, u32)> = None;
    for chunk in chunks.by_ref() {
        let chunk = chunk?;
        count += 1;
        bytes += chunk.data.len();
        let end = chunk.address.wrapping_add(chunk.data.len() as u32);
        range = Some(match range {
            Some((lo, hi)) => (lo.min(chunk.address), hi.max(end)),
            None => (chunk.address, end),
        });
    }

    println!("file:        {}", file.display());
    println!("chunks:      {} (max {} bytes)", count, chunk_size);
    println!("bytes:       {}", bytes);
    if let Some((lo, hi)) = range {
        println!("range:       {:#010x}..{:#010x}", lo, hi);
    }
    match chunks.start_address() {
        Some(start) => println!("entry point: {:#010x}", start),
        None => println!("entry point: none"),
    }
    Ok(())
}

fn check_updates(
    manifest: &Path,
    devices: &Path,
    targets: &[String],
    force: bool,
) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(devices)
        .with_context(|| format!("cannot read {}", devices.display()))?;
    let snapshots: Vec<DeviceInfo> = serde_json::from_str(&text)?;
    let devices: BTreeMap<NodeId, DeviceInfo> =
        snapshots.into_iter().map(|d| (d.node, d)).collect();

    let targets = if targets.is_empty() {
        None
    } else {
        let nodes = targets
            .iter()
            .map(|t| serde_json::from_value::<NodeId>(serde_json::Value::String(t.clone())))
            .collect::<Result<BTreeSet<_>, _>>()
            .context("unknown target node")?;
        Some(nodes)
    };

    let manifest = load_firmware_manifest(manifest);
    let updates = check_firmware_updates(&devices, &manifest, targets.as_ref(), force);
    if updates.is_empty() {
        println!("All firmware up to date");
    }
    for (node, (version, file)) in updates {
        println!("{:<16} version {:<4} {}", node, version, file.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging_with_level(if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    })?;
    tracing::debug!("motionkit {} built {}", motionkit::VERSION, motionkit::BUILD_DATE);

    match &args.command {
        Command::Home { axes } => {
            let axes = Axis::parse_set(axes)?;
            let mut driver = connect(&args).await?;
            let position = driver.home(&axes, &BTreeSet::new()).await?;
            println!("{}", position);
            driver.disconnect().await?;
        }
        Command::Move { targets, speed } => {
            let target: BTreeMap<Axis, f64> = targets.iter().copied().collect();
            let mut options = motionkit::MoveOptions::default();
            if let Some(speed) = speed {
                options = options.with_speed(*speed);
            }
            let mut driver = connect(&args).await?;
            let position = driver.move_to(&target, options).await?;
            println!("{}", position);
            driver.disconnect().await?;
        }
        Command::Position => {
            let mut driver = connect(&args).await?;
            let position = driver.update_position().await?;
            let switches = driver.switch_state().await?;
            println!("{}", position);
            println!("{}", serde_json::to_string(&switches)?);
            driver.disconnect().await?;
        }
        Command::HexInfo { file, chunk_size } => hex_info(file, *chunk_size)?,
        Command::CheckUpdates {
            manifest,
            devices,
            targets,
            force,
        } => check_updates(manifest, devices, targets, *force)?,
    }

    Ok(())
}

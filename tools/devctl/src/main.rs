//! devctl - Device broker harness
//!
//! Builds a device registry over simulated hardware, attaches the configured
//! drivers and runs node operations against it.
//!
//! Usage:
//!   devctl --manifest board.toml run "write gpio101 1" "read gpio101"
//!   devctl --config broker.toml --manifest board.toml list

mod ops;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dev_broker::sim::{SimGpioChip, SimSpiDevice, SimSpiPeer};
use dev_broker::{
    BrokerConfig, DeviceRegistry, GpioChip, Manifest, PlatformGpioDriver, SpiChannelDriver, StaticLineDriver,
};

use crate::ops::Op;

#[derive(Parser, Debug)]
#[command(name = "devctl")]
#[command(version)]
#[command(about = "Run node operations against simulated GPIO and SPI hardware", long_about = None)]
struct Cli {
    /// Broker configuration (TOML); defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Hardware manifest attached to the platform GPIO driver
    #[arg(short, long)]
    manifest: Option<PathBuf>,

    /// Number of lines on the simulated GPIO chip
    #[arg(long, default_value_t = 54)]
    ngpio: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List registered nodes
    List,

    /// Run operations in order, stopping at the first failure
    Run {
        /// Operations such as "read gpio100" or "drive 16 0"
        #[arg(required = true)]
        ops: Vec<String>,
    },
}

/// Everything attached for one run; fields drop top to bottom, drivers before the registry
struct Harness {
    peer: Arc<SimSpiPeer>,
    sim: Arc<SimGpioChip>,
    _spi: SpiChannelDriver,
    _platform: PlatformGpioDriver,
    _static_lines: Vec<StaticLineDriver>,
    registry: Arc<DeviceRegistry>,
}

impl Harness {
    fn attach(cli: &Cli) -> Result<Self> {
        let config = match &cli.config {
            Some(path) => BrokerConfig::load(path)?,
            None => BrokerConfig::default(),
        };

        let registry = Arc::new(DeviceRegistry::new());
        let sim = Arc::new(SimGpioChip::new("gpiochip0", cli.ngpio));
        let chip: Arc<dyn GpioChip> = sim.clone();

        let static_lines = config
            .static_lines
            .iter()
            .map(|line| {
                StaticLineDriver::init(registry.clone(), chip.clone(), line.clone(), &config)
                    .with_context(|| format!("static line {}", line.name))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut platform = PlatformGpioDriver::init(registry.clone(), chip, config.gpio.clone())?;
        if let Some(path) = &cli.manifest {
            let manifest = Manifest::load(path)?;
            let report = platform
                .on_attach(&manifest)
                .with_context(|| format!("attaching {}", path.display()))?;
            for skipped in &report.skipped {
                log::warn!("skipped: {}", skipped);
            }
        }

        let peer = SimSpiPeer::new();
        let mut spi = SpiChannelDriver::init(registry.clone(), config.spi.clone())?;
        spi.probe(Box::new(SimSpiDevice::new("psoc", 0, peer.clone())))
            .context("probing SPI device")?;

        Ok(Self {
            peer,
            sim,
            _spi: spi,
            _platform: platform,
            _static_lines: static_lines,
            registry,
        })
    }

    fn run(&self, op: &Op) -> Result<()> {
        match op {
            Op::Read { node, count } => {
                let devno = self.resolve(node)?;
                let data = self.registry.read(devno, *count).with_context(|| format!("read {}", node))?;
                println!("{}: {}", node, ops::render(&data));
            }
            Op::Write { node, value } => {
                let devno = self.resolve(node)?;
                let written = self
                    .registry
                    .write(devno, value.as_bytes())
                    .with_context(|| format!("write {}", node))?;
                log::info!("{}: wrote {} bytes", node, written);
            }
            Op::Drive { line, level } => {
                self.sim.drive(*line, *level)?;
                log::info!("line {} driven {}", line, u8::from(*level));
            }
            Op::Peer(byte) => {
                self.peer.place(*byte);
                log::info!("peer placed {}", byte);
            }
            Op::List => {
                for (devno, name) in self.registry.nodes() {
                    println!("{:>8}  {}", devno.to_string(), name);
                }
            }
        }
        Ok(())
    }

    fn resolve(&self, node: &str) -> Result<dev_broker::DevNo> {
        self.registry
            .lookup(node)
            .with_context(|| format!("no node named {:?}", node))
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let harness = Harness::attach(&cli)?;

    match &cli.command {
        Commands::List => harness.run(&Op::List)?,
        Commands::Run { ops } => {
            let ops = ops.iter().map(|text| Op::parse(text)).collect::<Result<Vec<_>>>()?;
            for op in &ops {
                harness.run(op)?;
            }
        }
    }

    Ok(())
}

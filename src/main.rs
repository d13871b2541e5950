//! CLI Entry Point for labwire
//!
//! Talks to one instrument or one I2C register from the command line.
//!
//! # Usage
//!
//! ```bash
//! labwire resolve GPIB:2
//! labwire query IP:192.168.12.238 "MEAS:VOLT?"
//! labwire identify COM7
//! labwire discover --json
//! labwire reg-write --port COM5 --slave 0x98 --fast "0x4C[3:2]" 2
//! labwire reg-read --emulate "0x10[7:6]"
//! ```
//!
//! Settings come from `config/labwire.toml` (or `--config`), overridden by
//! `LABWIRE_*` environment variables. `RUST_LOG` overrides the log level.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use labwire::bus::{BridgeBus, BridgeEmulator, BusTransaction, SlaveAddress};
use labwire::config::{Settings, DEFAULT_CONFIG_PATH};
use labwire::observer::default_observer;
use labwire::register::{AccessPath, RegisterCodec};
use labwire::transport::{discover, resolve, ConnectionParams, Connector, DefaultConnector, Transport};
use labwire::{CommandChannel, InstrumentSession};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "labwire")]
#[command(about = "Laboratory instrument sessions and I2C register access", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show how an identifier resolves, without connecting
    Resolve {
        /// Instrument identifier (IP:<host>, GPIB:<n>, USB:<descriptor>, COM<n>)
        identifier: String,
    },

    /// Send a command that produces no reply
    Send {
        #[command(flatten)]
        target: Target,
        /// Command text, without terminator
        command: String,
    },

    /// Send a command and print the reply
    Query {
        #[command(flatten)]
        target: Target,
        /// Command text, without terminator
        command: String,
        /// Reply timeout in milliseconds (default: timeouts.query_timeout_ms)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Print the instrument's *IDN? reply
    Identify {
        #[command(flatten)]
        target: Target,
    },

    /// List instruments visible to each backend
    Discover {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that the I2C slave acknowledges its address
    Probe {
        #[command(flatten)]
        bridge: BridgeArgs,
    },

    /// Read a register field, e.g. "0x10[7:6]"
    RegRead {
        #[command(flatten)]
        bridge: BridgeArgs,
        /// Register specifier
        spec: String,
    },

    /// Write a register field, keeping all other bits
    RegWrite {
        #[command(flatten)]
        bridge: BridgeArgs,
        /// Register specifier
        spec: String,
        /// Field value (decimal or 0x-prefixed hex)
        #[arg(value_parser = parse_number)]
        value: u64,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Args)]
struct Target {
    /// Instrument identifier (IP:<host>, GPIB:<n>, USB:<descriptor>, COM<n>)
    identifier: String,

    /// Run discovery first and warn if the instrument is not listed
    #[arg(long)]
    check_listing: bool,
}

#[derive(Args)]
struct BridgeArgs {
    /// Bridge serial port (COM<n> or a device path)
    #[arg(long, required_unless_present = "emulate")]
    port: Option<String>,

    /// Slave address in 8-bit notation (default: bridge.slave_address)
    #[arg(long, value_parser = parse_number)]
    slave: Option<u64>,

    /// Use the single-frame bridge commands
    #[arg(long)]
    fast: bool,

    /// Bus frequency in Hz (default: bridge.frequency_hz)
    #[arg(long)]
    frequency: Option<u32>,

    /// Run against the in-process bridge emulator
    #[arg(long)]
    emulate: bool,
}

fn parse_number(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("'{}' is not a number: {}", text, e))
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("labwire={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    init_tracing(&settings.application.log_level);

    match cli.command {
        Commands::Resolve { identifier } => resolve_identifier(&identifier, &settings),
        Commands::Send { target, command } => {
            let mut session = open_session(&target, &settings).await?;
            session.send(&command).await?;
            session.close().await?;
            Ok(())
        }
        Commands::Query {
            target,
            command,
            timeout_ms,
        } => {
            let mut session = open_session(&target, &settings).await?;
            let reply = match timeout_ms {
                Some(ms) => {
                    session
                        .query_with_timeout(&command, std::time::Duration::from_millis(ms))
                        .await?
                }
                None => session.query(&command).await?,
            };
            println!("{}", reply);
            session.close().await?;
            Ok(())
        }
        Commands::Identify { target } => {
            let mut session = open_session(&target, &settings).await?;
            println!("{}", session.identify().await?);
            session.close().await?;
            Ok(())
        }
        Commands::Discover { json } => run_discovery(json).await,
        Commands::Probe { bridge } => {
            let (mut bus, emulator) = open_bus(&bridge, &settings).await?;
            bus.probe().await?;
            println!("slave {} acknowledged", bus.slave());
            finish_bus(bus, emulator).await
        }
        Commands::RegRead { bridge, spec } => {
            let (mut bus, emulator) = open_bus(&bridge, &settings).await?;
            let codec = RegisterCodec::from_settings(&settings.bridge)?;
            let spec = codec.parse_spec(&spec)?;
            let value = codec
                .read_field(&mut bus, &spec, AccessPath::from_flag(bridge.fast))
                .await?;
            println!("{} = {:#x} ({})", spec, value, value);
            finish_bus(bus, emulator).await
        }
        Commands::RegWrite {
            bridge,
            spec,
            value,
        } => {
            let (mut bus, emulator) = open_bus(&bridge, &settings).await?;
            let codec = RegisterCodec::from_settings(&settings.bridge)?;
            let spec = codec.parse_spec(&spec)?;
            codec
                .write_field(&mut bus, &spec, value, AccessPath::from_flag(bridge.fast))
                .await?;
            println!("{} <- {:#x}", spec, value);
            finish_bus(bus, emulator).await
        }
        Commands::Config => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
    }
}

fn resolve_identifier(identifier: &str, settings: &Settings) -> Result<()> {
    let params = resolve(identifier)?;
    println!("kind:     {}", params.kind());
    println!("params:   {}", params);
    println!("resource: {}", params.visa_resource());
    if let ConnectionParams::Serial { port } = &params {
        println!("device:   {}", settings.serial.device_path(port));
    }
    Ok(())
}

async fn open_session(target: &Target, settings: &Settings) -> Result<InstrumentSession> {
    let mut session = InstrumentSession::new(&target.identifier, settings, default_observer())?;

    if target.check_listing {
        let report = discover().await;
        session.check_listing(&report, settings);
    }

    let connector = DefaultConnector::new(settings.clone());
    session
        .connect(&connector)
        .await
        .with_context(|| format!("Failed to connect to {}", target.identifier))?;
    Ok(session)
}

async fn run_discovery(json: bool) -> Result<()> {
    let report = discover().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for scan in &report.scans {
        match &scan.result {
            Ok(resources) if resources.is_empty() => println!("{}: (none)", scan.backend),
            Ok(resources) => {
                println!("{}:", scan.backend);
                for resource in resources {
                    println!("  {}", resource);
                }
            }
            Err(reason) => println!("{}: unavailable ({})", scan.backend, reason),
        }
    }
    Ok(())
}

type CliBus = BridgeBus<Box<dyn Transport>>;

async fn open_bus(args: &BridgeArgs, settings: &Settings) -> Result<(CliBus, Option<BridgeEmulator>)> {
    let mut settings = settings.clone();
    if let Some(address) = args.slave {
        settings.bridge.slave_address = u8::try_from(address)
            .with_context(|| format!("slave address {:#x} does not fit in 8 bits", address))?;
    }
    if let Some(hz) = args.frequency {
        settings.bridge.frequency_hz = hz;
    }
    let slave = SlaveAddress::from_8bit(settings.bridge.slave_address);

    let (transport, emulator): (Box<dyn Transport>, Option<BridgeEmulator>) = if args.emulate {
        let emulator = BridgeEmulator::new(slave).with_address_format(
            settings.bridge.address_width,
            settings.bridge.address_big_endian,
        );
        (Box::new(emulator.clone()), Some(emulator))
    } else {
        let port = args
            .port
            .clone()
            .context("--port is required without --emulate")?;
        let connector = DefaultConnector::new(settings.clone());
        let transport = connector
            .open(&ConnectionParams::Serial { port: port.clone() })
            .await
            .with_context(|| format!("Failed to open bridge on {}", port))?;
        (transport, None)
    };

    let bus = BridgeBus::open(transport, &settings).await?;
    Ok((bus, emulator))
}

async fn finish_bus(mut bus: CliBus, emulator: Option<BridgeEmulator>) -> Result<()> {
    if let Some(emulator) = emulator {
        for cycle in emulator.cycles() {
            println!("  bus: {:?}", cycle);
        }
        println!("  round trips: {}", emulator.round_trips());
    }
    bus.close().await?;
    Ok(())
}

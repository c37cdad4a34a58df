// meshbearer — provisioning bearer toolkit
//
// Inspect how PDUs are framed for a given MTU and run loopback provisioning
// sessions without radio hardware.

mod config;
mod simulate;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use meshbearer_core::bearer::gatt::payload_for_mtu;
use meshbearer_core::{LogicalPdu, PduFramer, PduType};
use simulate::{BearerArg, SimulateOptions};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshbearer")]
#[command(about = "Bluetooth Mesh provisioning bearer toolkit", long_about = None)]
#[command(version)]
struct Cli {
    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Emit file logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Debug level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a hex-encoded PDU into bearer frames
    Segment {
        /// PDU bytes as hex
        #[arg(value_name = "HEX")]
        pdu_hex: String,
        /// Frame size in bytes (defaults to the configured MTU)
        #[arg(short, long)]
        frame_size: Option<usize>,
        /// Bearer PDU type
        #[arg(short = 't', long = "type", value_enum, default_value = "provisioning")]
        pdu_type: PduTypeArg,
    },
    /// Run a provisioner and a device over a loopback link
    Simulate {
        #[arg(short, long, value_enum)]
        bearer: Option<BearerArg>,
        /// ATT MTU of the simulated link
        #[arg(short, long)]
        mtu: Option<u16>,
        /// Length of each random provisioning PDU
        #[arg(short = 'l', long, default_value = "65")]
        pdu_len: usize,
        /// Number of PDUs to exchange
        #[arg(short, long, default_value = "3")]
        count: usize,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Get { key: String },
    Set { key: String, value: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PduTypeArg {
    Network,
    Beacon,
    ProxyConfig,
    Provisioning,
    LinkControl,
}

impl From<PduTypeArg> for PduType {
    fn from(arg: PduTypeArg) -> Self {
        match arg {
            PduTypeArg::Network => PduType::NetworkPdu,
            PduTypeArg::Beacon => PduType::MeshBeacon,
            PduTypeArg::ProxyConfig => PduType::ProxyConfiguration,
            PduTypeArg::Provisioning => PduType::Provisioning,
            PduTypeArg::LinkControl => PduType::LinkControl,
        }
    }
}

fn init_tracing(log_file: Option<&Path>, json: bool, verbose: bool) -> Result<Option<WorkerGuard>> {
    let level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let Some(path) = log_file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    };

    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(directory).context("Failed to create log directory")?;
    let file_name = path.file_name().context("Log file path has no file name")?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(directory, file_name));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(writer)
            .init();
    }
    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;

    let log_file = cli
        .log_file
        .clone()
        .or_else(|| config.log_file.as_ref().map(PathBuf::from));
    let _log_guard = init_tracing(log_file.as_deref(), cli.json_logs, cli.verbose)?;

    match cli.command {
        Commands::Segment {
            pdu_hex,
            frame_size,
            pdu_type,
        } => cmd_segment(&config, &pdu_hex, frame_size, pdu_type.into()),
        Commands::Simulate {
            bearer,
            mtu,
            pdu_len,
            count,
        } => cmd_simulate(&config, bearer, mtu, pdu_len, count).await,
        Commands::Config { action } => cmd_config(config, action),
    }
}

fn cmd_segment(
    config: &config::Config,
    pdu_hex: &str,
    frame_size: Option<usize>,
    pdu_type: PduType,
) -> Result<()> {
    let data = hex::decode(pdu_hex.trim()).context("PDU is not valid hex")?;
    let frame_size = frame_size
        .or(config.bearer.frame_size_override)
        .unwrap_or_else(|| payload_for_mtu(config.default_mtu));

    tracing::debug!(
        "Segmenting {} byte {} PDU at frame size {}",
        data.len(),
        pdu_type,
        frame_size
    );
    let framer = PduFramer::new(config.bearer.max_pdu_len);
    let pdu = LogicalPdu::new(pdu_type, data);
    let frames = framer.segment(&pdu, frame_size).with_context(|| {
        format!(
            "Cannot segment {} byte PDU into {} byte frames",
            pdu.len(),
            frame_size
        )
    })?;

    println!(
        "{} {} byte {} PDU, {} byte frames, {} frame(s)",
        "Segmented".bold(),
        pdu.len(),
        pdu_type,
        frame_size,
        frames.len()
    );
    for (index, frame) in frames.enumerate() {
        let bytes = frame.to_bytes();
        println!(
            "  {:>3} {:<13} {} {}",
            index + 1,
            format!("{:?}", frame.role()).bright_cyan(),
            hex::encode(&bytes[..1]).bright_yellow(),
            hex::encode(&bytes[1..])
        );
    }
    Ok(())
}

async fn cmd_simulate(
    config: &config::Config,
    bearer: Option<BearerArg>,
    mtu: Option<u16>,
    pdu_len: usize,
    count: usize,
) -> Result<()> {
    let bearer = match bearer {
        Some(bearer) => bearer,
        None => BearerArg::from_setting(&config.default_bearer)
            .with_context(|| format!("Unknown default bearer: {}", config.default_bearer))?,
    };

    simulate::run(SimulateOptions {
        bearer,
        mtu: mtu.unwrap_or(config.default_mtu),
        pdu_len,
        count,
        config: config.bearer.clone(),
    })
    .await
}

fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }
            println!();
            println!("  File: {}", config::Config::config_file()?.display());
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }
    }
    Ok(())
}

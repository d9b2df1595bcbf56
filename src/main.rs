//! CLI Entry Point for encoder-daq
//!
//! Provides command-line interface for:
//! - Running an acquisition session (sampler, IRIG decoder and relay)
//! - Recording relayed datagrams into CSV files
//! - Checking a configuration file
//!
//! # Usage
//!
//! Acquire with the configured hardware backend:
//! ```bash
//! encoder-daq run --config config/encoder_daq.toml
//! ```
//!
//! Record 60 seconds of IRIG time on the host:
//! ```bash
//! encoder-daq record --run spin_test --seconds 60
//! ```

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use encoder_daq::config::DaqConfig;
use encoder_daq::logging;
use encoder_daq::receiver::{CsvRecorder, Receiver, StopCondition};
use encoder_daq::session::Session;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tokio::net::UdpSocket;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "encoder-daq")]
#[command(about = "IRIG-B time-stamped quadrature encoder acquisition", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = encoder_daq::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an acquisition session and relay records over UDP
    Run,

    /// Receive relayed datagrams and write them to CSV
    #[command(group(ArgGroup::new("stop").required(true).args(["seconds", "packets"])))]
    Record {
        /// Run name; output files are Encoder_Data_<name>.csv and IRIG_Data_<name>.csv
        #[arg(long = "run")]
        run_name: String,

        /// Stop after this many seconds of IRIG time
        #[arg(long)]
        seconds: Option<u32>,

        /// Stop after this many counter packets
        #[arg(long)]
        packets: Option<u64>,

        /// Override receiver.listen
        #[arg(long)]
        listen: Option<String>,

        /// Override receiver.output_dir
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Load and validate the configuration, then print the effective settings as TOML
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DaqConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Run => run_session(config).await,
        Commands::Record {
            run_name,
            seconds,
            packets,
            listen,
            output_dir,
        } => {
            let stop = match (seconds, packets) {
                (Some(s), _) => StopCondition::Seconds(s),
                (None, Some(p)) => StopCondition::Packets(p),
                (None, None) => anyhow::bail!("either --seconds or --packets is required"),
            };
            let listen = listen.unwrap_or_else(|| config.receiver.listen.clone());
            let output_dir = output_dir.unwrap_or_else(|| config.receiver.output_dir.clone());
            record(&config, &run_name, stop, &listen, output_dir).await
        }
        Commands::CheckConfig => {
            config.validate().map_err(anyhow::Error::msg)?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run_session(config: DaqConfig) -> Result<()> {
    let session = Session::prepare(config)?;

    let stop = session.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing session");
            stop.store(true, Ordering::Release);
        }
    });

    let summary = session.run().await?;
    info!(?summary, "Done");
    Ok(())
}

async fn record(
    config: &DaqConfig,
    run_name: &str,
    stop: StopCondition,
    listen: &str,
    output_dir: PathBuf,
) -> Result<()> {
    let recorder = CsvRecorder::create(&output_dir, run_name)?;

    let socket = UdpSocket::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    let mut receiver = Receiver::new(recorder, stop);

    tokio::select! {
        result = receiver.run(&socket, config.receiver.idle_notice) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupt received, closing files");
        }
    }
    receiver.flush()?;
    info!(stats = ?receiver.stats(), "Receiver stopped");
    Ok(())
}

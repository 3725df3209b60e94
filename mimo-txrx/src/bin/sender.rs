//! Radio-side traffic generator.
//!
//! Plays the remote radios against a running `mimo-txrx`: sends every
//! symbol of every frame for every antenna over UDP, one frame per `delay`.
//! Its sockets mirror the base station's, so both can share one config file.
//!
//! # Usage
//!
//! ```sh
//! mimo-sender 4 22 5000 bs.json --max-frames 1000
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use mimo_txrx::config::{SenderConfig, TxRxConfig};
use mimo_txrx::error::TxRxError;
use mimo_txrx::link::SocketLink;
use mimo_txrx::sender::Sender;

#[derive(Parser, Debug)]
#[command(name = "mimo-sender")]
#[command(about = "Massive-MIMO radio traffic generator over UDP")]
struct Cli {
    /// Sender worker threads
    #[arg(default_value = "4")]
    threads: usize,

    /// Core of the master thread; workers are pinned to the cores after it
    #[arg(default_value = "22")]
    core_offset: usize,

    /// Minimum time between frame starts, in microseconds
    #[arg(default_value = "5000")]
    delay: u64,

    /// JSON config file shared with the base station
    config: Option<PathBuf>,

    /// Stop after this many frames
    #[arg(long)]
    max_frames: Option<u32>,

    /// Raw little-endian f32 I/Q samples to send instead of a test tone
    #[arg(long)]
    iq_file: Option<PathBuf>,

    /// Do not pin threads to cores
    #[arg(long)]
    no_pin: bool,
}

fn main() {
    mimo_txrx::init_tracing();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("mimo-sender: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), TxRxError> {
    let config = match &cli.config {
        Some(path) => TxRxConfig::from_json_file(path)?,
        None => TxRxConfig::default(),
    };
    let settings = SenderConfig {
        threads: cli.threads,
        core_offset: (!cli.no_pin).then_some(cli.core_offset),
        frame_delay_us: cli.delay,
        max_frames: cli.max_frames,
        iq_file: cli.iq_file,
    };

    let mut link_config = config.clone();
    link_config.socket = config.socket.mirrored();
    let link = SocketLink::new(&link_config).map_err(TxRxError::LinkStart)?;

    let sender = Sender::new(config, settings, Arc::new(link))?;
    let running = sender.running();
    if let Err(e) = ctrlc::set_handler(move || {
        running.stop();
    }) {
        eprintln!("mimo-sender: failed to install signal handler: {e}");
    }

    eprintln!("mimo-sender: sending every {} us", cli.delay);
    let report = sender.run()?;
    eprintln!("mimo-sender: sent {} frame(s), {} packet(s)", report.frames, report.packets);
    if let (Some(min), Some(max)) = (report.min_frame_gap, report.max_frame_gap) {
        eprintln!("mimo-sender: frame gap {min:?} to {max:?}");
    }
    Ok(())
}

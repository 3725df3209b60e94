//! Packet TX/RX daemon over UDP.
//!
//! Runs the worker pool against the socket link with a trivial compute
//! side: every received packet is counted and its slot released at once.
//! Useful to soak-test the receive path against `mimo-sender`.
//!
//! # Usage
//!
//! ```sh
//! mimo-txrx --config bs.json --threads 4 --core-offset 2
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use minstant::Instant;
use mimo_txrx::config::{LinkKind, TxRxConfig};
use mimo_txrx::error::TxRxError;
use mimo_txrx::event::EventType;
use mimo_txrx::link::SocketLink;
use mimo_txrx::runtime::PacketTxRx;

/// Messages drained per pass of the consumer loop.
const DRAIN_BATCH: usize = 256;

/// How often the consumer logs its counters.
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "mimo-txrx")]
#[command(about = "Massive-MIMO packet TX/RX workers over UDP")]
struct Cli {
    /// JSON config file; built-in defaults otherwise
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Worker threads (overrides the config)
    #[arg(short = 't', long)]
    threads: Option<usize>,

    /// First core to pin workers to (overrides the config)
    #[arg(long)]
    core_offset: Option<usize>,

    /// Run as the secondary (MAC) link instead of the radio link
    #[arg(long)]
    secondary: bool,
}

#[derive(Debug, Default)]
struct Counts {
    received: u64,
    transmitted: u64,
}

fn main() {
    mimo_txrx::init_tracing();
    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("mimo-txrx: {e}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), TxRxError> {
    let mut config = match &cli.config {
        Some(path) => TxRxConfig::from_json_file(path)?,
        None => TxRxConfig::default(),
    };
    if let Some(threads) = cli.threads {
        config.worker_threads = threads;
    }
    if cli.core_offset.is_some() {
        config.core_offset = cli.core_offset;
    }
    if cli.secondary {
        config.link = LinkKind::Secondary;
    }
    config.validate()?;

    let link = SocketLink::new(&config).map_err(TxRxError::LinkStart)?;
    let (txrx, mut queues) = PacketTxRx::start(&config, Arc::new(link))?;
    eprintln!(
        "mimo-txrx: {} worker(s) on {} radio(s), ports {}..",
        config.worker_threads, config.radio_count, config.socket.local_base_port
    );

    let running = txrx.running();
    let handler_flag = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        handler_flag.stop();
    }) {
        eprintln!("mimo-txrx: failed to install signal handler: {e}");
    }

    let rx_event = config.link.rx_event();
    let tx_done = config.link.tx_done_event();
    let mut counts = Counts::default();
    let mut batch = Vec::with_capacity(DRAIN_BATCH);
    let mut last_report = Instant::now();
    let mut consumer_error = None;

    while running.is_running() {
        batch.clear();
        if queues.messages.dequeue_bulk(&mut batch, DRAIN_BATCH) == 0 {
            std::hint::spin_loop();
        }
        for event in &batch {
            match event.event_type {
                t if t == rx_event => match queues.take_rx(event.tag) {
                    Ok(slot) => {
                        slot.release();
                        counts.received += 1;
                    }
                    Err(e) => {
                        consumer_error = Some(e);
                        running.stop();
                        break;
                    }
                },
                t if t == tx_done => counts.transmitted += 1,
                EventType::PacketReceived
                | EventType::PacketFromSecondaryLink
                | EventType::TransmitRequest
                | EventType::TransmitDone
                | EventType::TransmitToSecondaryLink => {
                    eprintln!("mimo-txrx: ignoring {} event", event.event_type);
                }
            }
        }
        if last_report.elapsed() >= REPORT_INTERVAL {
            eprintln!(
                "mimo-txrx: received {} transmitted {} queued {}",
                counts.received,
                counts.transmitted,
                queues.messages.len_approx()
            );
            last_report = Instant::now();
        }
    }

    eprintln!("\nmimo-txrx: shutting down...");
    let result = txrx.shutdown();
    eprintln!(
        "mimo-txrx: stopped after {} received, {} transmitted",
        counts.received, counts.transmitted
    );
    match consumer_error {
        Some(e) => Err(e),
        None => result,
    }
}

//! Readout host binary
//!
//! Loads run options, builds the boards listed in the inventory (emulated
//! in this build), runs the full pipeline for the requested duration and
//! prints the end-of-run accounting.
//!
//! Usage:
//!   readout_host --config readout.toml --run-seconds 30

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use straxd::common::HostArgs;
use straxd::config::Options;
use straxd::digitizer::{DataFormat, Digitizer};
use straxd::emulator::{EmulatedBoardConfig, EmulatedDigitizer};
use straxd::sink::FileChunkSink;
use straxd::supervisor::Supervisor;

/// Decode descriptor for a board type from the inventory
fn format_for(board_type: &str) -> DataFormat {
    match board_type {
        // 500 MS/s boards run DPP-DAW firmware
        "V1730" => DataFormat::dpp_daw(2, 2),
        // 100 MS/s boards with default firmware
        _ => DataFormat::default_firmware(10, 10),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("straxd=info".parse()?))
        .init();

    let args = HostArgs::parse();
    let mut options = Options::load(&args.common.config_file)?;
    if let Some(dir) = &args.output_dir {
        options.output_dir = dir.clone();
    }
    let hostname = args.hostname.unwrap_or_else(|| options.hostname());
    let options = Arc::new(options);

    let entries = options.get_boards("V17XX", &hostname);
    if entries.is_empty() {
        anyhow::bail!("no boards configured for host '{hostname}'");
    }
    info!(hostname, boards = entries.len(), "building board set");

    let boards: Vec<Box<dyn Digitizer>> = entries
        .iter()
        .map(|entry| {
            Box::new(EmulatedDigitizer::new(EmulatedBoardConfig {
                board: entry.board,
                link: entry.link,
                format: format_for(&entry.board_type),
                seed: entry.board as u64,
                min_block_interval: Duration::from_millis(1),
                ..Default::default()
            })) as Box<dyn Digitizer>
        })
        .collect();

    let sink = Arc::new(FileChunkSink::new(&options.output_dir));
    let supervisor = Supervisor::start(options.clone(), boards, sink.clone())?;
    info!(
        output_dir = %options.output_dir,
        run_seconds = args.run_seconds,
        "run started"
    );

    let deadline = std::time::Instant::now() + Duration::from_secs(args.run_seconds);
    loop {
        let now = std::time::Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(Duration::from_secs(1).min(deadline - now));
        let status = supervisor.status();
        info!(
            bytes_read = status.bytes_read,
            queued_bytes = status.queued_bytes,
            buffered_fragment_bytes = status.buffered_fragment_bytes,
            workers = status.workers_running,
            "status"
        );
        if supervisor.check_errors() {
            info!("worker error detected, stopping run");
            break;
        }
    }

    let summary = supervisor.stop()?;
    println!("run finished:");
    println!("  bytes processed: {}", summary.counters.bytes_processed);
    println!("  events:          {}", summary.counters.events);
    println!("  fragments:       {}", summary.counters.fragments);
    println!("  data packets:    {}", summary.counters.data_packets);
    println!("  lost packets:    {}", summary.lost_packets);
    println!("  chunks written:  {}", sink.chunks_written());
    if !summary.board_fails.is_empty() {
        println!("  board fails:     {:?}", summary.board_fails);
    }
    Ok(())
}

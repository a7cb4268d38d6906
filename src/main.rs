//! # LoRa MAC simulator - entry point
//!
//! Discrete-event simulator for a LoRa star network: many end-devices uplink
//! to one gateway under pure ALOHA, ALOHA with carrier sense and exponential
//! backoff, or a three-phase RTS/listen/NAV collision-avoidance protocol.
//!
//! The simulation runs entirely in virtual time on a deterministic
//! single-thread executor: one async task per node over a discrete-event
//! time driver, so a week of radio traffic simulates in seconds and a fixed
//! RNG seed reproduces a run exactly.
//!
//! Typical invocations:
//!
//! ```text
//! # the collision-avoidance benchmark
//! lorasim-mac 1 20 20000 4 600000000 1 7 10 7 0 7
//! # the pure-ALOHA baseline
//! lorasim-mac 0 20 20000 4 600000000 1 --no-check-busy
//! ```
//!
//! Per-node and aggregate statistics go to stdout; the aggregate block is
//! also appended to `exp<N>.dat`. The step-by-step protocol trace is logged
//! at debug level (`RUST_LOG=lorasim_mac=debug`), which slows large runs
//! considerably and is off by default.

use anyhow::Result;
use env_logger::{Builder, Env};
use std::io::Write;

mod config;
mod executor;
mod simulation;
mod time_driver;

fn main() -> Result<()> {
    Builder::from_env(Env::default().default_filter_or("info")).init();

    let settings = config::Settings::from_args()?;
    log::info!(
        "starting: ca={} nodes={} avgsend={} experiment={} simtime={}",
        settings.ca,
        settings.nodes,
        settings.avg_send,
        settings.experiment,
        settings.simtime
    );

    let sim = simulation::network::run(&settings)?;

    simulation::stats::print_node_reports(&sim);
    let mut stdout = std::io::stdout().lock();
    simulation::stats::write_summary(&mut stdout, &sim)?;
    stdout.flush()?;
    simulation::stats::append_experiment_file(&sim)?;
    Ok(())
}

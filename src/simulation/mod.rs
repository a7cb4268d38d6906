//! Simulation core.
//!
//! Integrates the pieces of the discrete-event LoRa MAC simulator:
//!
//! - `types`: packets, nodes, the MAC state enum and the shared arena
//! - `signal_calculations`: airtime, preamble, sensitivity, path loss
//! - `collisions`: pairwise frequency/SF/timing/power checks
//! - `gateway`: in-flight set, collision evaluation, NAV propagation
//! - `node_task`: the per-node MAC state machine task
//! - `network`: scene construction and the run loop
//! - `stats`: per-node and aggregate reports, experiment data files
//! - `rng`: the single seeded random stream shared by every task
//!
//! The entry point is [`network::run`], which returns the finished `Sim`
//! for the reporting layer in `stats`.

pub mod collisions;
pub mod gateway;
pub mod network;
pub mod node_task;
pub mod rng;
pub mod signal_calculations;
pub mod stats;
pub mod types;

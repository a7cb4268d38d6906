//! Run configuration: command line, optional TOML overrides, defaults.
//!
//! The positional arguments mirror the classic invocation:
//!
//! ```text
//! lorasim-mac <ca> <nodes> <avgsend> <experiment> <simtime> [collision]
//!             [WL] [W2] [W3] [Wnav] [W2afterNAV] [P]
//! ```
//!
//! The window parameters are only meaningful with `ca = 1`. Every knob that
//! is not positional (CCA reliability, retry limits, payload sizes, backoff
//! windows, band selection, RNG seed) has a long option and may also be set
//! from a TOML file given with `--config`. Precedence: defaults, then file,
//! then command line.

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Traffic inter-arrival distribution for scheduled transmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DistributionKind {
    /// Exponential with the configured mean period.
    Expo,
    /// Uniform in `[max(2000, period - 5000), period + 5000]` ms.
    Uniform,
}

#[derive(Parser, Debug)]
#[command(
    name = "lorasim-mac",
    about = "Discrete-event simulator for LoRa MAC protocols (ALOHA, CCA, RTS/NAV collision avoidance)"
)]
struct Cli {
    /// 1 enables the collision-avoidance protocol, 0 is ALOHA (+ optional CCA)
    ca: u8,
    /// Number of end-devices (forced to 9 for experiment 6, 5 for experiment 7)
    nodes: usize,
    /// Average sending interval in ms
    avgsend: f64,
    /// Radio-settings preset, 0..=7
    experiment: u8,
    /// Virtual-time bound in ms
    simtime: f64,
    /// 1 enables the full capture model, 0 marks any overlap as a collision
    collision: Option<u8>,
    /// Listen window length in DIFS units (CA only)
    wl: Option<u32>,
    /// Maximum phase-2 backoff in DIFS units (CA only)
    w2: Option<u32>,
    /// Maximum phase-3 backoff in DIFS units (CA only)
    w3: Option<u32>,
    /// Maximum extra DIFS appended to a NAV period (CA only)
    wnav: Option<u32>,
    /// W2 replacement after a NAV completion (CA only)
    w2afternav: Option<u32>,
    /// Probability (percent) to start directly in phase 2 (CA only)
    p: Option<u32>,

    /// TOML file with any subset of the settings
    #[arg(long)]
    config: Option<PathBuf>,
    /// RNG seed; a fixed seed reproduces a run exactly
    #[arg(long)]
    seed: Option<u64>,
    /// CCA reliability in percent: 0 never detects, 100 always detects
    #[arg(long)]
    cca_prob: Option<u32>,
    /// Data payload length in bytes
    #[arg(long)]
    packet_length: Option<usize>,
    /// Maximum payload size in bytes; sizes the NAV after a data header
    #[arg(long)]
    max_payload_size: Option<usize>,
    /// Processed-packet target per node before the run winds down
    #[arg(long)]
    target_sent: Option<u64>,
    /// Maximum data transmission retries before aborting a packet
    #[arg(long)]
    n_retry: Option<u32>,
    /// Maximum RTS retries; negative means retry forever
    #[arg(long, allow_hyphen_values = true)]
    n_retry_rts: Option<i32>,
    /// Inter-arrival distribution for CA scheduling
    #[arg(long, value_enum)]
    distribution: Option<DistributionKind>,
    /// Disable CCA before data transmissions
    #[arg(long)]
    no_check_busy: bool,
    /// Disable CCA before RTS transmissions
    #[arg(long)]
    no_check_busy_rts: bool,
    /// Minimum busy-backoff draw
    #[arg(long)]
    wbusy_min: Option<u32>,
    /// Initial busy-backoff exponent
    #[arg(long)]
    wbusy_be: Option<u32>,
    /// Maximum busy-backoff exponent
    #[arg(long)]
    wbusy_max_be: Option<u32>,
    /// Keep the backoff exponent fixed instead of growing it per retry
    #[arg(long)]
    no_exp_backoff: bool,
    /// Add the max-payload time-on-air to every busy backoff (ALOHA mode)
    #[arg(long)]
    wbusy_add_max_toa: bool,
    /// Simulate LoRa 2.4 GHz (SX128x band plan) instead of sub-GHz
    #[arg(long)]
    lora24ghz: bool,
    /// CA1 variant: P = 0, doubled listen window, no phase-2 listen
    #[arg(long)]
    ca1: bool,
    /// CA2 variant: P = 100, doubled listen window
    #[arg(long)]
    ca2: bool,
    /// Parallel demodulator capacity of the gateway
    #[arg(long)]
    max_gw_receives: Option<usize>,
}

/// Fully resolved simulation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub ca: bool,
    pub ca1: bool,
    pub ca2: bool,
    pub nodes: usize,
    pub avg_send: f64,
    pub experiment: u8,
    pub simtime: f64,
    pub full_collision: bool,
    pub lora24ghz: bool,

    pub packet_length: usize,
    pub max_payload_size: usize,
    pub target_sent_per_node: u64,
    pub distribution: DistributionKind,
    pub exp4_sf: u8,

    pub check_busy: bool,
    pub check_busy_rts: bool,
    pub cca_prob: u32,
    pub n_retry: u32,
    pub n_retry_rts: i32,
    pub wbusy_min: u32,
    pub wbusy_be: u32,
    pub wbusy_max_be: u32,
    pub wbusy_exp_backoff: bool,
    pub wbusy_add_max_toa: bool,

    pub p: u32,
    pub wl: u32,
    pub w2: u32,
    pub w3: u32,
    pub wnav: u32,
    pub w2_after_nav: u32,

    pub max_gw_receives: usize,
    pub seed: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ca: true,
            ca1: false,
            ca2: false,
            nodes: 20,
            avg_send: 20_000.0,
            experiment: 4,
            simtime: 600_000_000.0,
            full_collision: true,
            lora24ghz: false,
            packet_length: 104,
            max_payload_size: 120,
            target_sent_per_node: 2_000,
            distribution: DistributionKind::Uniform,
            exp4_sf: 12,
            check_busy: true,
            check_busy_rts: true,
            cca_prob: 50,
            n_retry: 40,
            n_retry_rts: 20,
            wbusy_min: 1,
            wbusy_be: 3,
            wbusy_max_be: 6,
            wbusy_exp_backoff: true,
            wbusy_add_max_toa: false,
            p: 0,
            wl: 7,
            w2: 10,
            w3: 7,
            wnav: 0,
            w2_after_nav: 10,
            max_gw_receives: 8,
            seed: 12345,
        }
    }
}

impl Settings {
    /// Parse the process arguments into resolved settings.
    pub fn from_args() -> Result<Self> {
        Self::from_cli(Cli::parse())
    }

    fn from_cli(cli: Cli) -> Result<Self> {
        let mut settings = match &cli.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                toml::from_str::<Settings>(&text)
                    .with_context(|| format!("invalid config file {}", path.display()))?
            }
            None => Settings::default(),
        };

        settings.ca = cli.ca != 0;
        settings.nodes = cli.nodes;
        settings.avg_send = cli.avgsend;
        settings.experiment = cli.experiment;
        settings.simtime = cli.simtime;
        if let Some(collision) = cli.collision {
            settings.full_collision = collision != 0;
        }

        if settings.ca {
            if let Some(wl) = cli.wl {
                settings.wl = wl;
            }
            if let Some(w2) = cli.w2 {
                settings.w2 = w2;
            }
            if let Some(w3) = cli.w3 {
                settings.w3 = w3;
            }
            if let Some(wnav) = cli.wnav {
                settings.wnav = wnav;
            }
            if let Some(w2_after_nav) = cli.w2afternav {
                settings.w2_after_nav = w2_after_nav;
            }
            if let Some(p) = cli.p {
                settings.p = p;
            }
        } else if cli.wl.is_some() {
            log::warn!("window parameters after <collision> are ignored when ca = 0");
        }

        if let Some(seed) = cli.seed {
            settings.seed = seed;
        }
        if let Some(cca_prob) = cli.cca_prob {
            settings.cca_prob = cca_prob;
        }
        if let Some(packet_length) = cli.packet_length {
            settings.packet_length = packet_length;
        }
        if let Some(max_payload_size) = cli.max_payload_size {
            settings.max_payload_size = max_payload_size;
        }
        if let Some(target_sent) = cli.target_sent {
            settings.target_sent_per_node = target_sent;
        }
        if let Some(n_retry) = cli.n_retry {
            settings.n_retry = n_retry;
        }
        if let Some(n_retry_rts) = cli.n_retry_rts {
            settings.n_retry_rts = n_retry_rts;
        }
        if let Some(distribution) = cli.distribution {
            settings.distribution = distribution;
        }
        if cli.no_check_busy {
            settings.check_busy = false;
        }
        if cli.no_check_busy_rts {
            settings.check_busy_rts = false;
        }
        if let Some(wbusy_min) = cli.wbusy_min {
            settings.wbusy_min = wbusy_min;
        }
        if let Some(wbusy_be) = cli.wbusy_be {
            settings.wbusy_be = wbusy_be;
        }
        if let Some(wbusy_max_be) = cli.wbusy_max_be {
            settings.wbusy_max_be = wbusy_max_be;
        }
        if cli.no_exp_backoff {
            settings.wbusy_exp_backoff = false;
        }
        if cli.wbusy_add_max_toa {
            settings.wbusy_add_max_toa = true;
        }
        if cli.lora24ghz {
            settings.lora24ghz = true;
        }
        if cli.ca1 {
            settings.ca1 = true;
        }
        if cli.ca2 {
            settings.ca2 = true;
        }
        if let Some(max_gw_receives) = cli.max_gw_receives {
            settings.max_gw_receives = max_gw_receives;
        }

        settings.finalize()?;
        Ok(settings)
    }

    /// Apply experiment and variant constraints, then validate.
    pub fn finalize(&mut self) -> Result<()> {
        match self.experiment {
            6 => self.nodes = 9,
            7 => self.nodes = 5,
            _ => {}
        }
        // The variants keep the overall listening budget by doubling WL.
        if self.ca1 {
            self.p = 0;
            self.wl *= 2;
        }
        if self.ca2 {
            self.p = 100;
            self.wl *= 2;
        }

        if self.experiment > 7 {
            bail!("experiment must be in 0..=7, got {}", self.experiment);
        }
        if self.nodes == 0 {
            bail!("at least one node is required");
        }
        if self.avg_send <= 0.0 {
            bail!("avgsend must be positive");
        }
        if self.simtime <= 0.0 {
            bail!("simtime must be positive");
        }
        if self.cca_prob > 100 || self.p > 100 {
            bail!("cca_prob and P are percentages, 0..=100");
        }
        if self.packet_length == 0 || self.packet_length > self.max_payload_size {
            bail!(
                "packet_length must be in 1..={} (max_payload_size)",
                self.max_payload_size
            );
        }
        if self.n_retry == 0 {
            bail!("n_retry must be at least 1");
        }
        if self.wbusy_be > self.wbusy_max_be {
            bail!("wbusy_be must not exceed wbusy_max_be");
        }
        if self.wbusy_max_be > 16 {
            bail!("wbusy_max_be above 16 makes backoff windows meaningless");
        }
        if self.wbusy_min > 1 << self.wbusy_be {
            bail!("wbusy_min must not exceed the initial backoff window 2^wbusy_be");
        }
        if self.ca1 && self.ca2 {
            bail!("ca1 and ca2 are mutually exclusive");
        }
        Ok(())
    }

    pub(crate) fn band(&self) -> crate::simulation::signal_calculations::Band {
        if self.lora24ghz {
            crate::simulation::signal_calculations::Band::Lora24Ghz
        } else {
            crate::simulation::signal_calculations::Band::SubGhz
        }
    }

    /// Total processed-packet target for the whole run.
    pub fn target_sent_total(&self) -> u64 {
        self.target_sent_per_node * self.nodes as u64
    }

    /// Whether RTS retries are unlimited (`n_retry_rts < 0`).
    pub fn unlimited_rts_retries(&self) -> bool {
        self.n_retry_rts <= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Settings> {
        let mut argv = vec!["lorasim-mac"];
        argv.extend_from_slice(args);
        Settings::from_cli(Cli::try_parse_from(argv).expect("argv parses"))
    }

    #[test]
    fn canonical_benchmark_invocation() {
        let s = parse(&["1", "20", "20000", "4", "600000000", "1", "7", "10", "7", "0", "7"])
            .unwrap();
        assert!(s.ca && s.full_collision);
        assert_eq!(s.nodes, 20);
        assert_eq!((s.wl, s.w2, s.w3, s.wnav, s.w2_after_nav, s.p), (7, 10, 7, 0, 7, 0));
    }

    #[test]
    fn aloha_invocation_keeps_defaults() {
        let s = parse(&["0", "20", "20000", "4", "600000000", "1"]).unwrap();
        assert!(!s.ca);
        assert_eq!(s.wl, 7);
        assert_eq!(s.cca_prob, 50);
    }

    #[test]
    fn experiment_6_and_7_force_the_node_count() {
        assert_eq!(parse(&["0", "30", "20000", "6", "1000", "1"]).unwrap().nodes, 9);
        assert_eq!(parse(&["0", "30", "20000", "7", "1000", "1"]).unwrap().nodes, 5);
    }

    #[test]
    fn ca1_doubles_the_listen_window() {
        let s = parse(&["1", "5", "20000", "4", "1000", "1", "7", "--ca1"]).unwrap();
        assert_eq!(s.wl, 14);
        assert_eq!(s.p, 0);
    }

    #[test]
    fn negative_rts_retry_limit_means_unlimited() {
        let s = parse(&["1", "5", "20000", "4", "1000", "1", "--n-retry-rts", "-1"]).unwrap();
        assert!(s.unlimited_rts_retries());
    }

    #[test]
    fn rejects_out_of_range_arguments() {
        assert!(parse(&["0", "5", "20000", "9", "1000"]).is_err());
        assert!(parse(&["0", "0", "20000", "4", "1000"]).is_err());
        assert!(parse(&["0", "5", "20000", "4", "1000", "1", "--cca-prob", "150"]).is_err());
    }

    #[test]
    fn toml_overlay_sits_between_defaults_and_cli() {
        let text = "cca_prob = 100\nn_retry = 10\n";
        let mut s: Settings = toml::from_str(text).unwrap();
        s.finalize().unwrap();
        assert_eq!(s.cca_prob, 100);
        assert_eq!(s.n_retry, 10);
        // untouched knobs keep their defaults
        assert_eq!(s.wl, 7);
    }
}

//! Type definitions for the simulation.
//!
//! Contains the data structures shared across the simulation:
//! - `Packet`: one in-flight transmission and its derived radio timings
//! - `Node`: per-device MAC state, retry bookkeeping and counters
//! - `MacState`: the ten states of the collision-avoidance machine
//! - `Gateway`, `ChannelFlags`, `Totals`: the process-wide singletons
//! - `Sim`: the arena tying them together, shared as `Rc<RefCell<Sim>>`
//!
//! Every task owns its node logically; the gateway receiver writes reception
//! hints into other nodes from inside the transmitter's non-suspending
//! section, which is safe because the executor never preempts a poll.

use std::cell::RefCell;
use std::rc::Rc;

use crate::config::{DistributionKind, Settings};

use super::signal_calculations::{Band, airtime, preamble_time, symbol_time};

/// Size of the request-to-send probe in bytes.
pub(crate) const RTS_PAYLOAD_SIZE: usize = 5;

/// Seconds covered by the inter-transmit time histogram.
pub(crate) const INTER_TRANSMIT_BINS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PacketType {
    Data,
    Rts,
}

/// The MAC state machine. `ScheduleTx` is the initial state; there is no
/// terminal state, tasks run until the processed-packet target is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MacState {
    ScheduleTx,
    WantTransmit,
    StartCa,
    Phase1Listen,
    Phase2Backoff,
    Phase2Rts,
    Phase2Listen,
    Phase3Backoff,
    Phase3Transmit,
    StartNav,
}

/// One transmission's radio parameters and outcome flags. Plain scalars,
/// copied freely; the node's stored packet is the source of truth.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Packet {
    pub nodeid: usize,
    pub ptype: PacketType,
    pub band: Band,
    pub sf: u8,
    /// Bandwidth in kHz.
    pub bw: f64,
    /// Coding rate index, 1..=4 for 4/5..4/8.
    pub cr: u8,
    /// Carrier frequency in Hz.
    pub freq: f64,
    /// Transmit power in dBm.
    pub txpow: f64,
    /// Received power at the gateway in dBm, after path loss.
    pub rssi: f64,
    /// Symbol time in ms.
    pub sym_time: f64,
    /// Preamble duration in ms; the MAC's DIFS unit.
    pub tpream: f64,
    /// Current payload length: `data_len` for DATA, 5 for RTS.
    pub pl: usize,
    /// Payload length of the data packet this node sends.
    pub data_len: usize,
    /// Time-on-air in ms for the current `pl`.
    pub rectime: f64,
    /// Virtual time the packet reached the gateway's in-flight set.
    pub add_time: f64,
    pub collided: bool,
    pub processed: bool,
    pub lost: bool,
}

impl Packet {
    pub(crate) fn new(
        nodeid: usize,
        band: Band,
        sf: u8,
        bw: f64,
        cr: u8,
        freq: f64,
        txpow: f64,
        rssi: f64,
        data_len: usize,
    ) -> Self {
        Self {
            nodeid,
            ptype: PacketType::Data,
            band,
            sf,
            bw,
            cr,
            freq,
            txpow,
            rssi,
            sym_time: symbol_time(sf, bw),
            tpream: preamble_time(sf, bw, band),
            pl: data_len,
            data_len,
            rectime: airtime(sf, cr, data_len, bw, band),
            add_time: 0.0,
            collided: false,
            processed: false,
            lost: false,
        }
    }

    /// Retype the packet and re-derive payload length and time-on-air.
    /// DATA -> RTS -> DATA restores `pl` and `rectime` exactly.
    pub(crate) fn set_packet_type(&mut self, ptype: PacketType) {
        self.ptype = ptype;
        self.pl = match ptype {
            PacketType::Rts => RTS_PAYLOAD_SIZE,
            PacketType::Data => self.data_len,
        };
        self.rectime = airtime(self.sf, self.cr, self.pl, self.bw, self.band);
    }

    pub(crate) fn reset_flags(&mut self) {
        self.collided = false;
        self.processed = false;
        self.lost = false;
    }
}

/// Per-device state: identity, traffic pattern, the owned packet, the MAC
/// state machine variables and the statistics counters.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub id: usize,
    pub x: f64,
    pub y: f64,
    /// Distance to the gateway in meters.
    pub dist: f64,
    /// Mean sending period in ms.
    pub period: f64,
    pub distrib: DistributionKind,
    pub packet: Packet,
    /// Precomputed time-on-air of the data packet.
    pub data_rectime: f64,
    /// Precomputed time-on-air of the RTS probe.
    pub rts_rectime: f64,

    // MAC state
    pub state: MacState,
    pub want_transmit_time: f64,
    pub ca_listen_start_time: f64,
    pub ca_listen_end_time: f64,
    /// Threshold for the phase-1/phase-2 split; `my_p > p` listens first.
    pub p: u32,
    pub my_p: u32,
    /// Last drawn backoff, in DIFS units.
    pub backoff: u32,
    /// Set when the previous attempt ended in a CCA-busy backoff.
    pub cca: bool,
    /// Announced bytes of the reserving data packet; zero when no NAV.
    pub nav: usize,
    /// Effective phase-2 window; swapped to `w2_after_nav` after a NAV.
    pub w2: u32,
    pub wbusy_be: u32,
    pub n_retry: u32,
    pub n_retry_rts: u32,

    // Reception hints written by the gateway receiver
    pub receive_rts: bool,
    pub receive_rts_from: Option<usize>,
    pub receive_rts_time: f64,
    pub receive_data: bool,
    pub receive_data_from: Option<usize>,
    pub receive_data_time: f64,

    // Statistics
    pub cycle: u64,
    pub n_data_sent: u64,
    pub n_rts_sent: u64,
    pub n_aborted: u64,
    pub n_cca: u64,
    pub n_busy_rts: u64,
    pub n_busy_rts_p1: u64,
    pub n_busy_data: u64,
    pub total_retry: u64,
    pub retry_bin: Vec<u64>,
    pub total_retry_rts: u64,
    pub retry_rts_bin: Vec<u64>,
    pub latency: f64,
    pub total_listen_time: f64,
    pub n_receive_nav_rts_p1: u64,
    pub n_receive_nav_rts_p2: u64,
    pub n_receive_nav_data_p1: u64,
    pub n_receive_nav_data_p2: u64,
}

impl Node {
    pub(crate) fn new(id: usize, x: f64, y: f64, dist: f64, packet: Packet, settings: &Settings) -> Self {
        let data_rectime = airtime(packet.sf, packet.cr, packet.data_len, packet.bw, packet.band);
        let rts_rectime = airtime(packet.sf, packet.cr, RTS_PAYLOAD_SIZE, packet.bw, packet.band);
        Self {
            id,
            x,
            y,
            dist,
            period: settings.avg_send,
            distrib: settings.distribution,
            packet,
            data_rectime,
            rts_rectime,
            state: MacState::ScheduleTx,
            want_transmit_time: 0.0,
            ca_listen_start_time: 0.0,
            ca_listen_end_time: 0.0,
            p: settings.p,
            my_p: 0,
            backoff: 0,
            cca: false,
            nav: 0,
            w2: settings.w2,
            wbusy_be: settings.wbusy_be,
            n_retry: settings.n_retry,
            n_retry_rts: if settings.unlimited_rts_retries() {
                1
            } else {
                settings.n_retry_rts as u32
            },
            receive_rts: false,
            receive_rts_from: None,
            receive_rts_time: 0.0,
            receive_data: false,
            receive_data_from: None,
            receive_data_time: 0.0,
            cycle: 0,
            n_data_sent: 0,
            n_rts_sent: 0,
            n_aborted: 0,
            n_cca: 0,
            n_busy_rts: 0,
            n_busy_rts_p1: 0,
            n_busy_data: 0,
            total_retry: 0,
            retry_bin: vec![0; settings.n_retry as usize + 1],
            total_retry_rts: 0,
            retry_rts_bin: vec![0; settings.n_retry_rts.max(0) as usize + 1],
            latency: 0.0,
            total_listen_time: 0.0,
            n_receive_nav_rts_p1: 0,
            n_receive_nav_rts_p2: 0,
            n_receive_nav_data_p1: 0,
            n_receive_nav_data_p2: 0,
        }
    }

    /// True while the node sits in a listening window and would accept a
    /// reception hint from the gateway.
    pub(crate) fn is_listening(&self) -> bool {
        matches!(self.state, MacState::Phase1Listen | MacState::Phase2Listen)
            && !self.receive_rts
            && !self.receive_data
    }
}

/// The two process-wide carrier flags consulted by CCA. Kept separate so the
/// busy statistics can tell RTS activity from DATA activity; the busy/free
/// decision treats them equivalently.
#[derive(Debug, Default)]
pub(crate) struct ChannelFlags {
    pub busy_rts: bool,
    pub busy_data: bool,
}

/// The gateway's receiver front end: which nodes' packets are on the air and
/// above sensitivity right now.
#[derive(Debug)]
pub(crate) struct Gateway {
    /// Parallel demodulator capacity.
    pub max_receives: usize,
    /// Node indices with a packet in flight. At most one entry per node.
    pub in_flight: Vec<usize>,
}

/// Aggregate counters and end-of-run bookkeeping.
#[derive(Debug)]
pub(crate) struct Totals {
    pub nr_collisions: u64,
    pub nr_received: u64,
    pub nr_processed: u64,
    pub nr_lost: u64,
    pub nr_rts_collisions: u64,
    pub nr_rts_received: u64,
    pub nr_rts_processed: u64,
    pub nr_rts_lost: u64,

    /// Total processed packets after which the run winds down.
    pub target_sent: u64,
    /// Virtual time at which the target was reached; zero if never.
    pub end_sim: f64,

    pub n_transmit: u64,
    pub inter_transmit_time: f64,
    pub last_transmit_time: f64,
    /// Histogram of inter-transmit times, one bin per second.
    pub inter_transmit_bins: Vec<u64>,
}

impl Totals {
    fn new(target_sent: u64) -> Self {
        Self {
            nr_collisions: 0,
            nr_received: 0,
            nr_processed: 0,
            nr_lost: 0,
            nr_rts_collisions: 0,
            nr_rts_received: 0,
            nr_rts_processed: 0,
            nr_rts_lost: 0,
            target_sent,
            end_sim: 0.0,
            n_transmit: 0,
            inter_transmit_time: 0.0,
            last_transmit_time: 0.0,
            inter_transmit_bins: vec![0; INTER_TRANSMIT_BINS + 1],
        }
    }

    /// Record a fresh transmission attempt for the inter-transmit statistics.
    pub(crate) fn note_transmit(&mut self, now: f64) {
        self.n_transmit += 1;
        if self.n_transmit > 1 {
            let delta = now - self.last_transmit_time;
            self.inter_transmit_time += delta;
            let bin = ((delta / 1000.0) as usize).min(INTER_TRANSMIT_BINS);
            self.inter_transmit_bins[bin] += 1;
        }
        self.last_transmit_time = now;
    }
}

/// The whole simulation state: settings, the node arena and the singletons.
#[derive(Debug)]
pub(crate) struct Sim {
    pub settings: Settings,
    pub nodes: Vec<Node>,
    pub gateway: Gateway,
    pub channel: ChannelFlags,
    pub totals: Totals,
}

pub(crate) type SharedSim = Rc<RefCell<Sim>>;

impl Sim {
    pub(crate) fn new(settings: Settings) -> Self {
        let target_sent = settings.target_sent_total();
        let max_receives = settings.max_gw_receives;
        Self {
            settings,
            nodes: Vec::new(),
            gateway: Gateway {
                max_receives,
                in_flight: Vec::new(),
            },
            channel: ChannelFlags::default(),
            totals: Totals::new(target_sent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_packet() -> Packet {
        Packet::new(0, Band::SubGhz, 12, 125.0, 1, 860e6, 14.0, -120.0, 104)
    }

    #[test]
    fn retyping_restores_payload_and_airtime_exactly() {
        let mut packet = test_packet();
        let (pl, rectime) = (packet.pl, packet.rectime);

        packet.set_packet_type(PacketType::Rts);
        assert_eq!(packet.pl, RTS_PAYLOAD_SIZE);
        assert!(packet.rectime < rectime);

        packet.set_packet_type(PacketType::Data);
        assert_eq!(packet.pl, pl);
        assert_eq!(packet.rectime, rectime);
    }

    #[test]
    fn rectime_always_matches_airtime_of_the_current_payload() {
        let mut packet = test_packet();
        for ptype in [PacketType::Rts, PacketType::Data, PacketType::Rts] {
            packet.set_packet_type(ptype);
            assert_eq!(
                packet.rectime,
                airtime(packet.sf, packet.cr, packet.pl, packet.bw, packet.band)
            );
        }
    }

    #[test]
    fn rts_retry_counter_is_pinned_when_unlimited() {
        let mut settings = Settings::default();
        settings.n_retry_rts = -1;
        let node = Node::new(0, 0.0, 0.0, 50.0, test_packet(), &settings);
        assert_eq!(node.n_retry_rts, 1);
        assert!(node.retry_rts_bin.len() == 1);
    }

    #[test]
    fn listening_requires_a_listen_state_and_no_prior_hint() {
        let settings = Settings::default();
        let mut node = Node::new(0, 0.0, 0.0, 50.0, test_packet(), &settings);
        assert!(!node.is_listening());

        node.state = MacState::Phase1Listen;
        assert!(node.is_listening());

        node.receive_rts = true;
        assert!(!node.is_listening());
    }

    #[test]
    fn inter_transmit_histogram_bins_by_second() {
        let mut totals = Totals::new(10);
        totals.note_transmit(1_000.0);
        totals.note_transmit(3_500.0); // 2.5 s later
        totals.note_transmit(3_600.0); // 0.1 s later
        totals.note_transmit(100_000.0); // clamped into the last bin
        assert_eq!(totals.n_transmit, 4);
        assert_eq!(totals.inter_transmit_bins[2], 1);
        assert_eq!(totals.inter_transmit_bins[0], 1);
        assert_eq!(totals.inter_transmit_bins[INTER_TRANSMIT_BINS], 1);
    }
}

//! Pairwise collision checks for packets concurrent at the gateway.
//!
//! A fresh arrival is tested against every packet already in flight, in this
//! order: carrier frequency, spreading factor, timing (capture model only),
//! power. The first two decide whether the packets interact at all; timing
//! decides whether the new packet's critical preamble section overlaps the
//! old one; power decides who survives.

use super::types::Packet;

/// Minimum RSSI difference (dB) for the capture effect: below it both
/// packets are destroyed, above it the stronger one survives.
const POWER_THRESHOLD: f64 = 6.0;

/// Who is destroyed by a power-domain collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Casualties {
    Both,
    /// Only the fresh arrival `p1`.
    First,
    /// Only the in-flight packet `p2`.
    Second,
}

/// Carrier overlap: the tolerable offset widens with the wider bandwidth of
/// the pair — 120 kHz if either side uses BW500, 60 kHz for BW250, 30 kHz
/// otherwise. Frequencies are in Hz.
pub(crate) fn frequency_collision(p1: &Packet, p2: &Packet) -> bool {
    let df = (p1.freq - p2.freq).abs();
    if p1.bw == 500.0 || p2.bw == 500.0 {
        df <= 120_000.0
    } else if p1.bw == 250.0 || p2.bw == 250.0 {
        df <= 60_000.0
    } else {
        df <= 30_000.0
    }
}

/// Spreading factors are orthogonal; only equal SFs interact.
pub(crate) fn sf_collision(p1: &Packet, p2: &Packet) -> bool {
    if p1.sf == p2.sf {
        log::trace!("SF collision between node {} and node {}", p1.nodeid, p2.nodeid);
        return true;
    }
    false
}

/// Capture-model timing check for the fresh arrival `p1` against in-flight
/// `p2`. The receiver locks onto `p1` if at least the last five preamble
/// symbols are clean, i.e. `p2` ends before `p1`'s critical section begins.
/// Returns true when `p1` is not late enough and the packets collide.
pub(crate) fn timing_collision(now: f64, p1: &Packet, p2: &Packet) -> bool {
    // Up to (Npream - 5) preamble symbols of p1 may be lost.
    let npream = 8.0;
    let critical_offset = 2.0_f64.powi(p1.sf as i32) / p1.bw * (npream - 5.0);
    let p1_cs = now + critical_offset;
    let p2_end = p2.add_time + p2.rectime;
    if p1_cs < p2_end {
        log::trace!("node {} not late enough against node {}", p1.nodeid, p2.nodeid);
        return true;
    }
    log::trace!("node {} saved by the preamble", p1.nodeid);
    false
}

/// Power-domain outcome for two colliding packets.
pub(crate) fn power_collision(p1: &Packet, p2: &Packet) -> Casualties {
    let diff = p1.rssi - p2.rssi;
    if diff.abs() < POWER_THRESHOLD {
        Casualties::Both
    } else if diff < POWER_THRESHOLD {
        // p2 overpowers p1.
        Casualties::First
    } else {
        Casualties::Second
    }
}

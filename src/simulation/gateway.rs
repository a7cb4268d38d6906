//! Gateway receiver: collision evaluation and NAV propagation.
//!
//! `evaluate_arrival` runs at the instant a transmission starts, before the
//! packet joins the in-flight set, inside the transmitter's non-suspending
//! section:
//!
//! 1. Demodulator budget: the packet is `processed` only while the gateway
//!    has a parallel slot free.
//! 2. Pairwise collision checks against every in-flight packet.
//! 3. Correction pass: listening nodes drop a reception hint whose source
//!    packet has just been destroyed by this arrival.
//! 4. If the new packet survived, every node still inside a listening window
//!    receives it vicariously: the gateway sits centrally, so a packet it
//!    decodes is assumed decodable by the (farther apart) listeners too. An
//!    RTS announces its forthcoming data length for NAV sizing; a bare data
//!    header forces the worst-case NAV of the maximum payload size.
//!
//! `complete_transmission` runs when the airtime wait ends: it removes the
//! in-flight entry, settles the lost/collided/received/processed counters and
//! resets the packet flags for the next attempt.

use super::collisions::{Casualties, frequency_collision, power_collision, sf_collision, timing_collision};
use super::types::{PacketType, Sim};
use crate::time_driver;

/// Evaluate a fresh arrival from `tx` against the in-flight set and, on
/// success, propagate reception hints to listening nodes. Returns true if
/// the new packet collided. The caller appends `tx` to the in-flight set.
pub(crate) fn evaluate_arrival(sim: &mut Sim, tx: usize) -> bool {
    let now = time_driver::now_ms();
    let full_collision = sim.settings.full_collision;
    let ca = sim.settings.ca;

    let processing = sim
        .gateway
        .in_flight
        .iter()
        .filter(|&&idx| sim.nodes[idx].packet.processed)
        .count();
    if processing > sim.gateway.max_receives {
        log::warn!(
            "gateway saturated: {} packets in flight, dropping node {} from demodulation",
            sim.gateway.in_flight.len(),
            tx
        );
        sim.nodes[tx].packet.processed = false;
    } else {
        sim.nodes[tx].packet.processed = true;
    }

    log::debug!(
        "gateway: arrival from node {} {:?} (sf:{} bw:{} freq:{:.6e}) others: {}",
        tx,
        sim.nodes[tx].packet.ptype,
        sim.nodes[tx].packet.sf,
        sim.nodes[tx].packet.bw,
        sim.nodes[tx].packet.freq,
        sim.gateway.in_flight.len()
    );

    let mut collided = false;
    let in_flight = sim.gateway.in_flight.clone();
    for &other in &in_flight {
        if other == tx {
            continue;
        }
        let p1 = sim.nodes[tx].packet;
        let p2 = sim.nodes[other].packet;
        if !(frequency_collision(&p1, &p2) && sf_collision(&p1, &p2)) {
            continue;
        }
        if full_collision {
            if timing_collision(now, &p1, &p2) {
                match power_collision(&p1, &p2) {
                    Casualties::Both => {
                        sim.nodes[tx].packet.collided = true;
                        sim.nodes[other].packet.collided = true;
                        collided = true;
                    }
                    Casualties::First => {
                        sim.nodes[tx].packet.collided = true;
                        collided = true;
                    }
                    Casualties::Second => {
                        sim.nodes[other].packet.collided = true;
                    }
                }
            }
            // Not in the critical section: the new packet is safe from this one.
        } else {
            sim.nodes[tx].packet.collided = true;
            sim.nodes[other].packet.collided = true;
            collided = true;
        }
    }

    if ca {
        cancel_stale_hints(sim, &in_flight);
    }

    if collided {
        log::debug!("gateway: packet from node {} collided", tx);
        return true;
    }

    log::debug!("gateway: got packet from node {}", tx);
    if ca {
        propagate_reception(sim, tx, now);
    }
    false
}

/// A later arrival can destroy an in-flight packet some listener had already
/// tentatively received; that listener's hint must be withdrawn.
fn cancel_stale_hints(sim: &mut Sim, in_flight: &[usize]) {
    for &other in in_flight {
        if !sim.nodes[other].packet.collided {
            continue;
        }
        for node in sim.nodes.iter_mut() {
            if node.receive_rts && node.receive_rts_from == Some(other) {
                log::debug!(
                    "node {}: cancel reception of RTS from node {} due to collision",
                    node.id,
                    other
                );
                node.receive_rts = false;
            }
            if node.receive_data && node.receive_data_from == Some(other) {
                log::debug!(
                    "node {}: cancel reception of data header from node {} due to collision",
                    node.id,
                    other
                );
                node.receive_data = false;
            }
        }
    }
}

/// Mark every listening node as having received the packet the gateway just
/// decoded, and size its NAV.
fn propagate_reception(sim: &mut Sim, tx: usize, now: f64) {
    let ptype = sim.nodes[tx].packet.ptype;
    let data_len = sim.nodes[tx].packet.data_len;
    let max_payload_size = sim.settings.max_payload_size;

    for node in sim.nodes.iter_mut() {
        if node.id == tx || !node.is_listening() {
            continue;
        }
        match ptype {
            PacketType::Rts => {
                node.receive_rts = true;
                node.receive_rts_from = Some(tx);
                node.receive_rts_time = now;
                // An RTS carries the forthcoming data length.
                node.nav = data_len;
                log::trace!("node {}: marked to have received RTS from node {}", node.id, tx);
            }
            PacketType::Data => {
                node.receive_data = true;
                node.receive_data_from = Some(tx);
                node.receive_data_time = now;
                // A data header does not announce a length; assume the worst.
                node.nav = max_payload_size;
                log::trace!(
                    "node {}: marked to have received data header from node {}",
                    node.id,
                    tx
                );
            }
        }
    }
}

/// Settle counters when `tx`'s transmission ends and clear its flags.
/// The lost/collided/received buckets are mutually exclusive: a packet below
/// sensitivity never entered the collision check.
pub(crate) fn complete_transmission(sim: &mut Sim, tx: usize) {
    sim.gateway.in_flight.retain(|&idx| idx != tx);

    let now = time_driver::now_ms();
    let packet = sim.nodes[tx].packet;
    let totals = &mut sim.totals;
    match packet.ptype {
        PacketType::Data => {
            if packet.lost {
                totals.nr_lost += 1;
                log::debug!("node {} {:.3}: data packet was lost", tx, now);
            }
            if packet.collided {
                totals.nr_collisions += 1;
                log::debug!("node {} {:.3}: data packet collided", tx, now);
            }
            if !packet.lost && !packet.collided {
                totals.nr_received += 1;
                log::debug!("node {} {:.3}: data packet correctly transmitted", tx, now);
            }
            if packet.processed {
                totals.nr_processed += 1;
            }
        }
        PacketType::Rts => {
            if packet.lost {
                totals.nr_rts_lost += 1;
            }
            if packet.collided {
                totals.nr_rts_collisions += 1;
            }
            if !packet.lost && !packet.collided {
                totals.nr_rts_received += 1;
                log::debug!("node {} {:.3}: RTS correctly transmitted", tx, now);
            }
            if packet.processed {
                totals.nr_rts_processed += 1;
            }
        }
    }
    if totals.nr_processed > totals.target_sent && totals.end_sim == 0.0 {
        totals.end_sim = now;
    }

    sim.nodes[tx].packet.reset_flags();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::simulation::types::{MacState, Node, Packet};

    fn test_sim(n: usize, full_collision: bool) -> Sim {
        let mut settings = Settings::default();
        settings.nodes = n;
        settings.full_collision = full_collision;
        let mut sim = Sim::new(settings.clone());
        for id in 0..n {
            let band = settings.band();
            let packet = Packet::new(id, band, 12, 125.0, 1, 860e6, 14.0, -100.0, 104);
            sim.nodes.push(Node::new(id, 0.0, 0.0, 50.0, packet, &settings));
        }
        sim
    }

    fn transmit(sim: &mut Sim, tx: usize) -> bool {
        let collided = evaluate_arrival(sim, tx);
        sim.gateway.in_flight.push(tx);
        collided
    }

    #[test]
    fn simplified_model_marks_any_overlap_on_both_sides() {
        let mut sim = test_sim(2, false);
        assert!(!transmit(&mut sim, 0));
        assert!(transmit(&mut sim, 1));
        assert!(sim.nodes[0].packet.collided);
        assert!(sim.nodes[1].packet.collided);
    }

    #[test]
    fn capture_lets_the_stronger_packet_survive() {
        // The timing check reads the virtual clock; keep it parked at zero.
        let _guard = crate::time_driver::sim_lock();
        crate::time_driver::reset();
        let mut sim = test_sim(2, true);
        sim.nodes[0].packet.rssi = -110.0;
        sim.nodes[1].packet.rssi = -100.0;
        assert!(!transmit(&mut sim, 0));
        // Node 1 arrives within node 0's airtime and is 10 dB stronger.
        assert!(!transmit(&mut sim, 1));
        assert!(sim.nodes[0].packet.collided);
        assert!(!sim.nodes[1].packet.collided);
    }

    #[test]
    fn close_power_destroys_both() {
        let _guard = crate::time_driver::sim_lock();
        crate::time_driver::reset();
        let mut sim = test_sim(2, true);
        assert!(!transmit(&mut sim, 0));
        assert!(transmit(&mut sim, 1));
        assert!(sim.nodes[0].packet.collided && sim.nodes[1].packet.collided);
    }

    #[test]
    fn different_sf_never_collides() {
        let mut sim = test_sim(2, false);
        sim.nodes[1].packet.sf = 7;
        assert!(!transmit(&mut sim, 0));
        assert!(!transmit(&mut sim, 1));
    }

    #[test]
    fn successful_rts_sets_hints_on_listening_nodes_only() {
        let mut sim = test_sim(3, true);
        sim.nodes[0].packet.set_packet_type(PacketType::Rts);
        sim.nodes[1].state = MacState::Phase1Listen;
        // node 2 is not listening

        assert!(!transmit(&mut sim, 0));
        assert!(sim.nodes[1].receive_rts);
        assert_eq!(sim.nodes[1].receive_rts_from, Some(0));
        assert_eq!(sim.nodes[1].nav, 104);
        assert!(!sim.nodes[2].receive_rts);
    }

    #[test]
    fn data_header_reserves_the_maximum_payload() {
        let mut sim = test_sim(2, true);
        sim.nodes[1].state = MacState::Phase2Listen;
        assert!(!transmit(&mut sim, 0));
        assert!(sim.nodes[1].receive_data);
        assert_eq!(sim.nodes[1].nav, sim.settings.max_payload_size);
    }

    #[test]
    fn a_destroying_arrival_withdraws_earlier_hints() {
        let mut sim = test_sim(3, false);
        sim.nodes[0].packet.set_packet_type(PacketType::Rts);
        sim.nodes[1].state = MacState::Phase1Listen;

        assert!(!transmit(&mut sim, 0));
        assert!(sim.nodes[1].receive_rts);

        // Node 2's overlapping transmission destroys node 0's RTS.
        assert!(transmit(&mut sim, 2));
        assert!(!sim.nodes[1].receive_rts);
    }

    #[test]
    fn counters_are_mutually_exclusive_on_completion() {
        let mut sim = test_sim(2, false);
        assert!(!transmit(&mut sim, 0));
        assert!(transmit(&mut sim, 1));
        complete_transmission(&mut sim, 0);
        complete_transmission(&mut sim, 1);
        assert_eq!(sim.totals.nr_collisions, 2);
        assert_eq!(sim.totals.nr_received, 0);
        assert!(sim.gateway.in_flight.is_empty());
        assert!(!sim.nodes[0].packet.collided && !sim.nodes[1].packet.collided);
    }

    #[test]
    fn lost_packets_bypass_the_receiver() {
        let mut sim = test_sim(2, false);
        // A lost packet is never evaluated nor added; only completion counts it.
        sim.nodes[0].packet.lost = true;
        complete_transmission(&mut sim, 0);
        assert_eq!(sim.totals.nr_lost, 1);
        assert_eq!(sim.totals.nr_collisions, 0);
    }
}

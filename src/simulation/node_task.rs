//! Per-node asynchronous task: the MAC state machine.
//!
//! Each node runs one task that loops over the ten MAC states. All waits are
//! virtual-time `Timer` suspensions; everything between two suspensions is a
//! single non-suspending section, so a CCA check and the transmission it
//! clears are atomic with respect to every other node.
//!
//! Collision-avoidance flow (`ca = true`):
//!
//! ```text
//! ScheduleTx -> WantTransmit -> StartCa -+-> Phase1Listen -+-> StartNav -> WantTransmit
//!                                        |                 +-> Phase2Backoff
//!                                        +-> Phase2Backoff -> Phase2Rts
//!                     Phase2Rts -> Phase2Listen -+-> StartNav -> WantTransmit
//!                                                +-> Phase3Backoff -> Phase3Transmit
//!                     Phase3Transmit -> ScheduleTx        (or back to WantTransmit)
//! ```
//!
//! CCA can run at WantTransmit (data), before each RTS, and before the
//! phase-3 data transmission; each busy verdict costs one retry and backs
//! off by a random number of DIFS (one DIFS = one preamble duration).
//! Without collision avoidance the task collapses to schedule / CCA loop /
//! transmit, which with `check_busy = false` is pure ALOHA.

use embassy_time::Timer;

use crate::time_driver::{self, ms_duration};

use super::gateway;
use super::rng;
use super::signal_calculations::{airtime, sensitivity};
use super::types::{MacState, PacketType, SharedSim, Sim};

/// Which MAC step is performing clear channel assessment. Decides which
/// busy counters are charged and which carrier flags are visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CcaStage {
    WantTransmit,
    Phase2Rts,
    Phase3Data,
    Aloha,
}

/// Listen window being evaluated; only affects the NAV statistics split.
#[derive(Debug, Clone, Copy)]
enum ListenPhase {
    One,
    Two,
}

/// Entry point: one task per node, spawned in node-id order.
pub(crate) async fn node_task(sim: SharedSim, idx: usize) {
    let ctx = NodeCtx { sim, idx };
    let ca = ctx.with(|sim| sim.settings.ca);
    if ca {
        ctx.run_ca().await
    } else {
        ctx.run_aloha().await
    }
}

struct NodeCtx {
    sim: SharedSim,
    idx: usize,
}

impl NodeCtx {
    /// Run `f` inside a non-suspending section. Never hold the borrow across
    /// an await; every sync burst goes through here.
    fn with<R>(&self, f: impl FnOnce(&mut Sim) -> R) -> R {
        f(&mut self.sim.borrow_mut())
    }

    /// True once the run-wide processed-packet target has been reached; the
    /// task then winds down at its next scheduling point.
    fn finished(&self) -> bool {
        self.with(|sim| sim.totals.nr_processed > sim.totals.target_sent)
    }

    async fn run_ca(&self) {
        loop {
            let state = self.with(|sim| sim.nodes[self.idx].state);
            match state {
                MacState::ScheduleTx => {
                    if self.finished() {
                        return;
                    }
                    self.schedule_tx().await;
                }
                MacState::WantTransmit => self.want_transmit().await,
                MacState::StartCa => self.start_ca().await,
                MacState::Phase1Listen => self.listen_exit(ListenPhase::One).await,
                MacState::Phase2Backoff => self.phase2_send_rts().await,
                MacState::Phase2Rts => self.phase2_after_rts().await,
                MacState::Phase2Listen => self.listen_exit(ListenPhase::Two).await,
                MacState::Phase3Backoff => self.phase3_prepare(),
                MacState::Phase3Transmit => self.phase3_transmit().await,
                MacState::StartNav => self.leave_nav(),
            }
        }
    }

    /// Draw the next transmission opportunity and wait for it.
    async fn schedule_tx(&self) {
        let wait = self.with(|sim| {
            let wait = draw_transmit_wait(sim, self.idx, true);
            let node = &mut sim.nodes[self.idx];
            node.state = MacState::WantTransmit;
            log::debug!(
                "node {} cycle {}: schedule transmit in {:.3} at {:.3}",
                node.id,
                node.cycle,
                wait,
                time_driver::now_ms() + wait
            );
            wait
        });
        Timer::after(ms_duration(wait)).await;
    }

    /// Data transmission gatekeeper: abort on retry exhaustion, handle the
    /// CCA-retry and NAV re-entry sub-cases, run CCA, then either back off
    /// or commit to the CA procedure by retyping the packet to RTS.
    async fn want_transmit(&self) {
        enum Outcome {
            Abort,
            Backoff(f64),
            Proceed,
        }

        let outcome = self.with(|sim| {
            let now = time_driver::now_ms();
            let n_retry_cfg = sim.settings.n_retry;
            let wbusy_be_cfg = sim.settings.wbusy_be;
            let w2_cfg = sim.settings.w2;
            let w2_after_nav = sim.settings.w2_after_nav;
            let check_busy = sim.settings.check_busy;

            let mut initial_attempt = false;
            {
                let node = &mut sim.nodes[self.idx];
                if node.n_retry == 0 {
                    log::debug!("node {} {:.3}: current transmission aborted", node.id, now);
                    node.n_aborted += 1;
                    node.n_retry = n_retry_cfg;
                    node.wbusy_be = wbusy_be_cfg;
                    node.cca = false;
                    node.nav = 0;
                    node.state = MacState::ScheduleTx;
                    return Outcome::Abort;
                }
                if node.cca {
                    node.cca = false;
                    log::debug!(
                        "node {} {:.3}: retry {} after CCA",
                        node.id,
                        now,
                        n_retry_cfg - node.n_retry
                    );
                } else if node.nav != 0 {
                    node.nav = 0;
                    node.w2 = if w2_after_nav != w2_cfg { w2_after_nav } else { w2_cfg };
                    log::debug!(
                        "node {} {:.3}: retry {} after NAV -> W2={}",
                        node.id,
                        now,
                        n_retry_cfg - node.n_retry,
                        node.w2
                    );
                } else {
                    node.want_transmit_time = now;
                    node.w2 = w2_cfg;
                    initial_attempt = true;
                }
            }
            if initial_attempt {
                sim.totals.note_transmit(now);
            }

            let find_busy = check_busy && assess_channel(sim, self.idx, CcaStage::WantTransmit);
            if find_busy {
                let backoff = draw_busy_backoff(sim, self.idx);
                let node = &mut sim.nodes[self.idx];
                node.backoff = backoff;
                node.cca = true;
                node.n_retry -= 1;
                Outcome::Backoff(node.backoff as f64 * node.packet.tpream)
            } else {
                let my_p = rng::range_inclusive(0, 100);
                let node = &mut sim.nodes[self.idx];
                node.my_p = my_p;
                node.state = MacState::StartCa;
                node.packet.set_packet_type(PacketType::Rts);
                log::debug!(
                    "node {} {:.3}: start CA with P={} my_P={}",
                    node.id,
                    now,
                    node.p,
                    my_p
                );
                Outcome::Proceed
            }
        });

        if let Outcome::Backoff(wait) = outcome {
            Timer::after(ms_duration(wait)).await;
        }
    }

    /// Split into phase 1 (listen first) or phase 2 (backoff, then RTS).
    async fn start_ca(&self) {
        let wait = self.with(|sim| {
            let now = time_driver::now_ms();
            let wl = sim.settings.wl;
            let node = &mut sim.nodes[self.idx];
            if node.my_p > node.p {
                node.state = MacState::Phase1Listen;
                node.ca_listen_start_time = now;
                let window = wl as f64 * node.packet.tpream + node.packet.rectime;
                node.ca_listen_end_time = now + window;
                log::debug!(
                    "node {} {:.3}: phase1 listen for WL={} DIFS + TOA(RTS) until {:.3}",
                    node.id,
                    now,
                    wl,
                    node.ca_listen_end_time
                );
                window
            } else {
                node.state = MacState::Phase2Backoff;
                let backoff = rng::range_inclusive(0, node.w2);
                node.backoff = backoff;
                log::debug!(
                    "node {} {:.3}: phase2 backoff with W2={} backoff={}",
                    node.id,
                    now,
                    node.w2,
                    backoff
                );
                node.backoff as f64 * node.packet.tpream
            }
        });
        Timer::after(ms_duration(wait)).await;
    }

    /// A listen window has elapsed. An overheard RTS or data header sends
    /// the node into NAV for the remainder of the reservation; silence lets
    /// it progress to the next phase's backoff.
    async fn listen_exit(&self, phase: ListenPhase) {
        enum Next {
            Wait(f64),
            NavContained,
        }

        let next = self.with(|sim| {
            let now = time_driver::now_ms();
            let wl = sim.settings.wl;
            let w3 = sim.settings.w3;
            let wnav = sim.settings.wnav;
            let node = &mut sim.nodes[self.idx];

            if node.receive_rts {
                node.receive_rts = false;
                node.total_listen_time += node.receive_rts_time - node.ca_listen_start_time;
                match phase {
                    ListenPhase::One => node.n_receive_nav_rts_p1 += 1,
                    ListenPhase::Two => node.n_receive_nav_rts_p2 += 1,
                }
                // The reservation spans the transmitter's listen window,
                // its phase-3 backoff budget and the announced data airtime.
                let nav_toa =
                    airtime(node.packet.sf, node.packet.cr, node.nav, node.packet.bw, node.packet.band);
                let mut nav_period = wl as f64 * node.packet.tpream
                    + node.packet.rectime
                    + w3 as f64 * node.packet.tpream
                    + nav_toa;
                let extra = if wnav != 0 { rng::range_inclusive(0, wnav) } else { 0 };
                nav_period += extra as f64 * node.packet.tpream;
                // The RTS arrived earlier in the window; that part of the
                // reservation has already elapsed.
                nav_period -= now - node.receive_rts_time;
                node.state = MacState::StartNav;
                log::debug!(
                    "node {} {:.3}: received RTS at {:.3}, NAV until {:.3}",
                    node.id,
                    now,
                    node.receive_rts_time,
                    now + nav_period
                );
                Next::Wait(nav_period)
            } else if node.receive_data {
                node.receive_data = false;
                node.total_listen_time += node.receive_data_time - node.ca_listen_start_time;
                match phase {
                    ListenPhase::One => node.n_receive_nav_data_p1 += 1,
                    ListenPhase::Two => node.n_receive_nav_data_p2 += 1,
                }
                let nav_toa =
                    airtime(node.packet.sf, node.packet.cr, node.nav, node.packet.bw, node.packet.band);
                let extra = if wnav != 0 { rng::range_inclusive(0, wnav) } else { 0 };
                node.state = MacState::StartNav;
                let nav_end =
                    node.receive_data_time + nav_toa + extra as f64 * node.packet.tpream;
                if nav_end <= now {
                    // The whole reservation fell inside the listen window.
                    log::debug!(
                        "node {} {:.3}: data header NAV contained in listening window",
                        node.id,
                        now
                    );
                    Next::NavContained
                } else {
                    log::debug!(
                        "node {} {:.3}: received data header at {:.3}, NAV until {:.3}",
                        node.id,
                        now,
                        node.receive_data_time,
                        nav_end
                    );
                    Next::Wait(nav_end - now)
                }
            } else {
                match phase {
                    ListenPhase::One => {
                        node.state = MacState::Phase2Backoff;
                        let backoff = rng::range_inclusive(0, node.w2);
                        node.backoff = backoff;
                        log::debug!(
                            "node {} {:.3}: nothing heard, phase2 backoff={}",
                            node.id,
                            now,
                            backoff
                        );
                        Next::Wait(node.backoff as f64 * node.packet.tpream)
                    }
                    ListenPhase::Two => {
                        node.state = MacState::Phase3Backoff;
                        let backoff = rng::range_inclusive(0, w3);
                        node.backoff = backoff;
                        log::debug!(
                            "node {} {:.3}: nothing heard, phase3 backoff={}",
                            node.id,
                            now,
                            backoff
                        );
                        Next::Wait(node.backoff as f64 * node.packet.tpream)
                    }
                }
            }
        });

        if let Next::Wait(wait) = next {
            Timer::after(ms_duration(wait)).await;
        }
    }

    /// CCA-retry loop for the RTS, then its transmission. Unlike data, an
    /// RTS whose retry budget runs out is transmitted anyway: it is the
    /// cheapest probe available and the reservation depends on it.
    async fn phase2_send_rts(&self) {
        self.with(|sim| {
            let wbusy_be_cfg = sim.settings.wbusy_be;
            let limit = sim.settings.n_retry_rts;
            let node = &mut sim.nodes[self.idx];
            node.state = MacState::Phase2Rts;
            node.wbusy_be = wbusy_be_cfg;
            if limit > 0 {
                node.n_retry_rts = limit as u32;
            }
            node.cca = false;
        });

        loop {
            if self.with(|sim| sim.nodes[self.idx].n_retry_rts == 0) {
                log::debug!(
                    "node {}: RTS retry budget exhausted, transmitting anyway",
                    self.idx
                );
                break;
            }
            let wait = self.with(|sim| {
                if !sim.settings.check_busy_rts
                    || !assess_channel(sim, self.idx, CcaStage::Phase2Rts)
                {
                    return None;
                }
                let limited = !sim.settings.unlimited_rts_retries();
                let backoff = draw_busy_backoff(sim, self.idx);
                let node = &mut sim.nodes[self.idx];
                node.backoff = backoff;
                if limited {
                    node.n_retry_rts -= 1;
                }
                Some(node.backoff as f64 * node.packet.tpream)
            });
            match wait {
                None => break,
                Some(wait) => Timer::after(ms_duration(wait)).await,
            }
        }

        self.with(|sim| {
            let now = time_driver::now_ms();
            let limit = sim.settings.n_retry_rts;
            let node = &mut sim.nodes[self.idx];
            node.n_rts_sent += 1;
            if limit > 0 {
                let used = (limit as u32 - node.n_retry_rts) as u64;
                node.total_retry_rts += used;
                node.retry_rts_bin[used as usize] += 1;
            }
            log::debug!(
                "node {} {:.3}: transmit RTS toa {:.3} ends at {:.3}",
                node.id,
                now,
                node.packet.rectime,
                now + node.packet.rectime
            );
        });
        self.transmit_current_packet().await;
    }

    /// After the RTS: a second listen window, or straight to phase 3 under
    /// the CA1 variant.
    async fn phase2_after_rts(&self) {
        let wait = self.with(|sim| {
            let now = time_driver::now_ms();
            let ca1 = sim.settings.ca1;
            let wl = sim.settings.wl;
            let w3 = sim.settings.w3;
            let node = &mut sim.nodes[self.idx];
            if ca1 {
                node.state = MacState::Phase3Backoff;
                let backoff = rng::range_inclusive(0, w3);
                node.backoff = backoff;
                log::debug!(
                    "node {} {:.3}: CA1, skipping phase2 listen, backoff={}",
                    node.id,
                    now,
                    backoff
                );
                node.backoff as f64 * node.packet.tpream
            } else {
                node.state = MacState::Phase2Listen;
                node.ca_listen_start_time = now;
                let window = wl as f64 * node.packet.tpream + node.packet.rectime;
                node.ca_listen_end_time = now + window;
                log::debug!(
                    "node {} {:.3}: phase2 listen until {:.3}",
                    node.id,
                    now,
                    node.ca_listen_end_time
                );
                window
            }
        });
        Timer::after(ms_duration(wait)).await;
    }

    fn phase3_prepare(&self) {
        self.with(|sim| {
            let node = &mut sim.nodes[self.idx];
            node.state = MacState::Phase3Transmit;
            node.packet.set_packet_type(PacketType::Data);
        });
    }

    /// Final CCA and the data transmission itself. A busy channel here means
    /// the node lost its priority; it starts the whole procedure over rather
    /// than spinning on backoffs.
    async fn phase3_transmit(&self) {
        let busy = self.with(|sim| {
            sim.settings.check_busy && assess_channel(sim, self.idx, CcaStage::Phase3Data)
        });
        if busy {
            self.with(|sim| {
                let node = &mut sim.nodes[self.idx];
                node.cca = true;
                node.n_retry -= 1;
                node.state = MacState::WantTransmit;
                log::debug!(
                    "node {}: channel busy in phase3, retries left {}",
                    node.id,
                    node.n_retry
                );
            });
            return;
        }

        self.with(|sim| {
            let now = time_driver::now_ms();
            let n_retry_cfg = sim.settings.n_retry;
            let node = &mut sim.nodes[self.idx];
            node.n_data_sent += 1;
            let used = (n_retry_cfg - node.n_retry) as u64;
            node.total_retry += used;
            node.retry_bin[used as usize] += 1;
            log::debug!(
                "node {} {:.3}: transmit DATA toa {:.3} ends at {:.3}",
                node.id,
                now,
                node.packet.rectime,
                now + node.packet.rectime
            );
        });
        self.transmit_current_packet().await;
        self.with(|sim| {
            let now = time_driver::now_ms();
            let n_retry_cfg = sim.settings.n_retry;
            let node = &mut sim.nodes[self.idx];
            // Latency spans the first transmission wish to the delivery.
            node.latency += now - node.want_transmit_time;
            node.n_retry = n_retry_cfg;
            node.cca = false;
            node.nav = 0;
            node.state = MacState::ScheduleTx;
        });
    }

    /// NAV elapsed: restore the data packet and re-enter the gatekeeper,
    /// paying one retry for the deferred attempt.
    fn leave_nav(&self) {
        self.with(|sim| {
            let node = &mut sim.nodes[self.idx];
            node.state = MacState::WantTransmit;
            node.packet.set_packet_type(PacketType::Data);
            node.n_retry -= 1;
            log::debug!(
                "node {} {:.3}: NAV over, retries left {}",
                node.id,
                time_driver::now_ms(),
                node.n_retry
            );
        });
    }

    /// Put the node's packet on the air: sensitivity check, gateway
    /// evaluation, carrier flag, airtime wait, completion accounting.
    async fn transmit_current_packet(&self) {
        let (rectime, is_rts) = self.with(|sim| {
            let now = time_driver::now_ms();
            let packet = sim.nodes[self.idx].packet;
            if sim.gateway.in_flight.contains(&self.idx) {
                log::error!("node {}: packet already at the gateway", self.idx);
            } else {
                let sens = sensitivity(packet.sf, packet.bw, packet.band);
                if packet.rssi < sens {
                    log::debug!(
                        "node {} {:.3}: packet below sensitivity ({:.2} < {:.2} dBm), will be lost",
                        self.idx,
                        now,
                        packet.rssi,
                        sens
                    );
                    sim.nodes[self.idx].packet.lost = true;
                } else {
                    sim.nodes[self.idx].packet.lost = false;
                    gateway::evaluate_arrival(sim, self.idx);
                    sim.gateway.in_flight.push(self.idx);
                    sim.nodes[self.idx].packet.add_time = now;
                }
            }
            let is_rts = packet.ptype == PacketType::Rts;
            if is_rts {
                sim.channel.busy_rts = true;
            } else {
                sim.channel.busy_data = true;
            }
            (packet.rectime, is_rts)
        });

        Timer::after(ms_duration(rectime)).await;

        self.with(|sim| {
            if is_rts {
                sim.channel.busy_rts = false;
            } else {
                sim.channel.busy_data = false;
            }
            gateway::complete_transmission(sim, self.idx);
        });
    }

    /// ALOHA (optionally with CCA): schedule, CCA loop, transmit or abort.
    async fn run_aloha(&self) {
        loop {
            if self.finished() {
                return;
            }
            let wait = self.with(|sim| {
                let wait = draw_transmit_wait(sim, self.idx, false);
                let node = &mut sim.nodes[self.idx];
                log::debug!(
                    "node {} cycle {}: will try transmit in {:.3}",
                    node.id,
                    node.cycle,
                    wait
                );
                wait
            });
            Timer::after(ms_duration(wait)).await;

            self.with(|sim| {
                let now = time_driver::now_ms();
                sim.nodes[self.idx].want_transmit_time = now;
                sim.totals.note_transmit(now);
            });

            loop {
                if self.with(|sim| sim.nodes[self.idx].n_retry == 0) {
                    break;
                }
                let wait = self.with(|sim| {
                    if !sim.settings.check_busy
                        || !assess_channel(sim, self.idx, CcaStage::Aloha)
                    {
                        return None;
                    }
                    let extra_toa = if sim.settings.wbusy_add_max_toa {
                        let packet = sim.nodes[self.idx].packet;
                        airtime(
                            packet.sf,
                            packet.cr,
                            sim.settings.max_payload_size,
                            packet.bw,
                            packet.band,
                        )
                    } else {
                        0.0
                    };
                    let backoff = draw_busy_backoff(sim, self.idx);
                    let node = &mut sim.nodes[self.idx];
                    node.backoff = backoff;
                    node.n_retry -= 1;
                    Some(node.backoff as f64 * node.packet.tpream + extra_toa)
                });
                match wait {
                    None => break,
                    Some(wait) => Timer::after(ms_duration(wait)).await,
                }
            }

            let aborted = self.with(|sim| {
                let now = time_driver::now_ms();
                let n_retry_cfg = sim.settings.n_retry;
                let wbusy_be_cfg = sim.settings.wbusy_be;
                let node = &mut sim.nodes[self.idx];
                if node.n_retry == 0 {
                    log::debug!("node {} {:.3}: current transmission aborted", node.id, now);
                    node.n_aborted += 1;
                    node.n_retry = n_retry_cfg;
                    node.wbusy_be = wbusy_be_cfg;
                    return true;
                }
                node.n_data_sent += 1;
                let used = (n_retry_cfg - node.n_retry) as u64;
                node.total_retry += used;
                node.retry_bin[used as usize] += 1;
                log::debug!(
                    "node {} {:.3}: transmit DATA toa {:.3} ends at {:.3}",
                    node.id,
                    now,
                    node.packet.rectime,
                    now + node.packet.rectime
                );
                false
            });
            if aborted {
                continue;
            }

            self.transmit_current_packet().await;
            self.with(|sim| {
                let now = time_driver::now_ms();
                let n_retry_cfg = sim.settings.n_retry;
                let wbusy_be_cfg = sim.settings.wbusy_be;
                let node = &mut sim.nodes[self.idx];
                node.latency += now - node.want_transmit_time;
                node.n_retry = n_retry_cfg;
                node.wbusy_be = wbusy_be_cfg;
            });
        }
    }
}

/// Draw the wait until the next transmission opportunity. Experiments 6/7
/// use a deterministic slotted pattern; otherwise the CA scheduler honors
/// the configured distribution while plain ALOHA draws exponentially.
fn draw_transmit_wait(sim: &mut Sim, idx: usize, ca: bool) -> f64 {
    use crate::config::DistributionKind;

    let now = time_driver::now_ms();
    let experiment = sim.settings.experiment;
    let node = &mut sim.nodes[idx];
    let wait = match experiment {
        // 9 nodes, 100 ms apart in each period slot.
        6 => node.cycle as f64 * node.period - now + node.id as f64 * 100.0,
        // 5 nodes, 500 ms apart.
        7 => node.cycle as f64 * node.period - now + node.id as f64 * 500.0,
        _ if ca && node.distrib == DistributionKind::Uniform => {
            rng::uniform((node.period - 5000.0).max(2000.0), node.period + 5000.0)
        }
        _ => rng::expovariate(node.period),
    };
    node.cycle += 1;
    wait.max(0.0)
}

/// Clear channel assessment. Returns true when the node decides the channel
/// is busy: the carrier must actually be on *and* the detection draw within
/// `cca_prob` percent must succeed (channel activity detection is not fully
/// reliable in LoRa).
fn assess_channel(sim: &mut Sim, idx: usize, stage: CcaStage) -> bool {
    let cca_prob = sim.settings.cca_prob;
    // ALOHA nodes never send RTS, so only the data carrier exists for them.
    let busy_rts = stage != CcaStage::Aloha && sim.channel.busy_rts;
    let busy_data = sim.channel.busy_data;

    let node = &mut sim.nodes[idx];
    node.n_cca += 1;
    if !busy_rts && !busy_data {
        log::trace!("node {}: channel is free", node.id);
        return false;
    }
    if busy_rts {
        node.n_busy_rts += 1;
        if stage == CcaStage::WantTransmit {
            node.n_busy_rts_p1 += 1;
        }
    } else {
        node.n_busy_data += 1;
    }
    log::trace!(
        "node {}: channel busy by {}",
        node.id,
        if busy_rts { "RTS" } else { "DATA" }
    );

    let detected = rng::range_inclusive(1, 100) <= cca_prob && cca_prob != 0;
    if detected {
        log::trace!("node {}: busy channel detected by CCA ({}%)", node.id, cca_prob);
    } else {
        log::trace!("node {}: CCA reports a free channel", node.id);
    }
    detected
}

/// Draw a busy backoff in `[Wbusy_min, 2^BE]` DIFS and grow the exponent
/// for the next round when exponential backoff is enabled.
fn draw_busy_backoff(sim: &mut Sim, idx: usize) -> u32 {
    let wbusy_min = sim.settings.wbusy_min;
    let exp_backoff = sim.settings.wbusy_exp_backoff;
    let max_be = sim.settings.wbusy_max_be;
    let node = &mut sim.nodes[idx];
    let window = 2u32.pow(node.wbusy_be);
    let backoff = rng::range_inclusive(wbusy_min, window);
    log::debug!(
        "node {}: backoff in [{}, {}] -> {} DIFS",
        node.id,
        wbusy_min,
        window,
        backoff
    );
    if exp_backoff && node.wbusy_be < max_be {
        node.wbusy_be += 1;
    }
    backoff
}

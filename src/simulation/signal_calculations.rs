//! Radio signal and timing calculations.
//!
//! Contains helpers for:
//! - LoRa time-on-air per the LoRa Design Guide, for sub-GHz and 2.4 GHz
//! - Preamble duration (the protocol's DIFS unit)
//! - Receiver sensitivity lookup per (SF, BW)
//! - Log-distance path loss and the cell radius derived from a link budget
//!
//! Units:
//! - Power: dBm
//! - Time: milliseconds (f64); callers convert to `embassy_time::Duration`
//! - Distance: meters
//! - Bandwidth: kHz (fractional for the 2.4 GHz plans, e.g. 203.125)

/// Radio band. Selects sensitivity tables, preamble length and the
/// header/LDRO rules in the airtime formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Band {
    SubGhz,
    Lora24Ghz,
}

/// Path loss exponent of the log-distance model.
pub(crate) const GAMMA: f64 = 2.08;
/// Reference distance d0 (m) of the log-distance model.
pub(crate) const D0: f64 = 40.0;
/// Path loss (dB) measured at the reference distance.
pub(crate) const LPLD0: f64 = 127.41;
/// Combined antenna gains (dB); zero for the reference deployment.
pub(crate) const GL: f64 = 0.0;

/// Sub-GHz bandwidth plan (kHz).
pub(crate) const BW_SUB_GHZ: [f64; 3] = [125.0, 250.0, 500.0];
/// 2.4 GHz bandwidth plan (kHz), SX128x.
pub(crate) const BW_24_GHZ: [f64; 4] = [203.125, 406.25, 812.5, 1625.0];

/// Measured sub-GHz sensitivity (dBm), SF6..SF12 by [125, 250, 500] kHz.
/// SF6 from the SX127x datasheet, SF7..SF12 measured.
const SENSI_SUB_GHZ: [[f64; 3]; 7] = [
    [-118.0, -115.0, -111.0],
    [-126.5, -124.25, -120.75],
    [-127.25, -126.75, -124.0],
    [-131.25, -128.25, -127.5],
    [-132.75, -130.25, -128.75],
    [-134.5, -132.75, -128.75],
    [-133.25, -132.25, -132.25],
];

/// SX128x sensitivity (dBm), SF5..SF12 by [203.125, 406.25, 812.5, 1625] kHz.
const SENSI_24_GHZ: [[f64; 4]; 8] = [
    [-109.0, -107.0, -105.0, -99.0],
    [-111.0, -110.0, -118.0, -103.0],
    [-115.0, -113.0, -112.0, -106.0],
    [-118.0, -116.0, -115.0, -109.0],
    [-121.0, -119.0, -117.0, -111.0],
    [-124.0, -122.0, -120.0, -114.0],
    [-127.0, -125.0, -123.0, -117.0],
    [-130.0, -128.0, -126.0, -120.0],
];

impl Band {
    /// Default transmit power (dBm) for the band's reference radio.
    pub(crate) fn default_tx_power(self) -> f64 {
        match self {
            Band::SubGhz => 14.0,
            Band::Lora24Ghz => 10.0,
        }
    }

    /// Spreading factors the band supports.
    pub(crate) fn sf_range(self) -> (u8, u8) {
        match self {
            Band::SubGhz => (6, 12),
            Band::Lora24Ghz => (5, 12),
        }
    }

    /// Bandwidth plan for random radio settings.
    pub(crate) fn bandwidths(self) -> &'static [f64] {
        match self {
            Band::SubGhz => &BW_SUB_GHZ,
            Band::Lora24Ghz => &BW_24_GHZ,
        }
    }
}

fn bw_index(bw: f64, plan: &[f64]) -> usize {
    plan.iter()
        .position(|&b| (b - bw).abs() < 1e-6)
        .unwrap_or_else(|| panic!("bandwidth {bw} kHz is not in the band plan"))
}

/// LoRa symbol time in milliseconds: `2^SF / BW`.
pub(crate) fn symbol_time(sf: u8, bw: f64) -> f64 {
    2.0_f64.powi(sf as i32) / bw
}

/// Preamble duration in milliseconds. This is the DIFS unit of the MAC:
/// every listen window and backoff slot is a multiple of it.
pub(crate) fn preamble_time(sf: u8, bw: f64, band: Band) -> f64 {
    let tsym = symbol_time(sf, bw);
    match band {
        Band::SubGhz => (8.0 + 4.25) * tsym,
        Band::Lora24Ghz if sf < 7 => (12.0 + 6.25) * tsym,
        Band::Lora24Ghz => (12.0 + 4.25) * tsym,
    }
}

/// Time-on-air in milliseconds for a `pl`-byte payload, per the LoRa Design
/// Guide symbol count formula.
///
/// Sub-GHz: 8 preamble symbols, implicit header only with SF6, low-data-rate
/// optimization for BW125 with SF11/SF12. 2.4 GHz: 12 preamble symbols,
/// explicit header, LDRO above SF10, and the SX128x payload-symbol variants
/// below/above SF7.
pub(crate) fn airtime(sf: u8, cr: u8, pl: usize, bw: f64, band: Band) -> f64 {
    let sf_f = sf as f64;
    let pl_f = pl as f64;
    let cr_f = cr as f64;
    let tsym = symbol_time(sf, bw);

    match band {
        Band::SubGhz => {
            let de = if bw == 125.0 && (sf == 11 || sf == 12) { 1.0 } else { 0.0 };
            let h = if sf == 6 { 1.0 } else { 0.0 };
            let tpream = (8.0 + 4.25) * tsym;
            let numerator = 8.0 * pl_f - 4.0 * sf_f + 28.0 + 16.0 - 20.0 * h;
            let payload_symb_nb =
                8.0 + ((numerator / (4.0 * (sf_f - 2.0 * de))).ceil() * (cr_f + 4.0)).max(0.0);
            tpream + payload_symb_nb * tsym
        }
        Band::Lora24Ghz => {
            let de = if sf > 10 { 1.0 } else { 0.0 };
            let h = 1.0;
            let tpream = if sf < 7 {
                (12.0 + 6.25) * tsym
            } else {
                (12.0 + 4.25) * tsym
            };
            let numerator = if sf >= 7 {
                8.0 * pl_f + 16.0 - 4.0 * sf_f + 8.0 + 20.0 * h
            } else {
                8.0 * pl_f + 16.0 - 4.0 * sf_f + 20.0 * h
            };
            let payload_symb_nb =
                8.0 + (numerator.max(0.0) / (4.0 * (sf_f - 2.0 * de))).ceil() * (cr_f + 4.0);
            tpream + payload_symb_nb * tsym
        }
    }
}

/// Receiver sensitivity in dBm for the given (SF, BW).
pub(crate) fn sensitivity(sf: u8, bw: f64, band: Band) -> f64 {
    match band {
        Band::SubGhz => SENSI_SUB_GHZ[(sf - 6) as usize][bw_index(bw, &BW_SUB_GHZ)],
        Band::Lora24Ghz => SENSI_24_GHZ[(sf - 5) as usize][bw_index(bw, &BW_24_GHZ)],
    }
}

/// The sensitivity used to size the cell for an experiment: the slowest
/// fixed setting for the fixed-rate experiments, the best entry of the whole
/// table when per-node optimization may pick any setting.
pub(crate) fn reference_sensitivity(experiment: u8, band: Band) -> f64 {
    match (experiment, band) {
        (0 | 1 | 4 | 6 | 7, Band::SubGhz) => sensitivity(12, 250.0, band),
        (0 | 1 | 4 | 6 | 7, Band::Lora24Ghz) => sensitivity(12, 406.25, band),
        (2, Band::SubGhz) => sensitivity(6, 500.0, band),
        (2, Band::Lora24Ghz) => sensitivity(5, 1625.0, band),
        (_, Band::SubGhz) => min_of(SENSI_SUB_GHZ.as_flattened()),
        (_, Band::Lora24Ghz) => min_of(SENSI_24_GHZ.as_flattened()),
    }
}

fn min_of(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

/// Log-distance path loss in dB at `distance` meters:
/// `PL(d) = PL(d0) + 10 * gamma * log10(d / d0)`.
pub(crate) fn path_loss(distance: f64) -> f64 {
    LPLD0 + 10.0 * GAMMA * (distance / D0).log10()
}

/// Cell radius for a link budget of `tx_power - min_sensitivity` dB.
pub(crate) fn max_distance(tx_power: f64, min_sensitivity: f64) -> f64 {
    let lpl = tx_power - min_sensitivity;
    D0 * ((lpl - LPLD0) / (10.0 * GAMMA)).exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn airtime_matches_hand_computed_sub_ghz_values() {
        // SF12 / BW125 / CR4:5, the experiment-4 data packet.
        assert!(close(airtime(12, 1, 104, 125.0, Band::SubGhz), 4104.192));
        // The 5-byte RTS at the same settings.
        assert!(close(airtime(12, 1, 5, 125.0, Band::SubGhz), 827.392));
        // SF7 / BW125 / CR4:5, no low-data-rate optimization.
        assert!(close(airtime(7, 1, 10, 125.0, Band::SubGhz), 41.216));
    }

    #[test]
    fn airtime_matches_hand_computed_24_ghz_value() {
        let toa = airtime(12, 1, 104, 203.125, Band::Lora24Ghz);
        assert!((toa - 2606.31631).abs() < 1e-3, "got {toa}");
    }

    #[test]
    fn airtime_is_pure() {
        let a = airtime(9, 3, 57, 250.0, Band::SubGhz);
        let b = airtime(9, 3, 57, 250.0, Band::SubGhz);
        assert_eq!(a, b);
    }

    #[test]
    fn airtime_grows_with_payload_and_sf() {
        assert!(airtime(7, 1, 100, 125.0, Band::SubGhz) > airtime(7, 1, 10, 125.0, Band::SubGhz));
        assert!(airtime(9, 1, 10, 125.0, Band::SubGhz) > airtime(7, 1, 10, 125.0, Band::SubGhz));
        assert!(
            airtime(6, 1, 10, 406.25, Band::Lora24Ghz) > airtime(5, 1, 10, 406.25, Band::Lora24Ghz)
        );
    }

    #[test]
    fn preamble_time_is_the_difs_unit() {
        // SF12/BW125: Tsym = 32.768 ms, Tpream = 12.25 * Tsym.
        assert!(close(preamble_time(12, 125.0, Band::SubGhz), 401.408));
        // 2.4 GHz below SF7 uses the longer 18.25-symbol preamble.
        let tsym = symbol_time(5, 203.125);
        assert!(close(preamble_time(5, 203.125, Band::Lora24Ghz), 18.25 * tsym));
    }

    #[test]
    fn sensitivity_lookup() {
        assert_eq!(sensitivity(12, 125.0, Band::SubGhz), -133.25);
        assert_eq!(sensitivity(6, 500.0, Band::SubGhz), -111.0);
        assert_eq!(sensitivity(5, 1625.0, Band::Lora24Ghz), -99.0);
        assert_eq!(sensitivity(12, 203.125, Band::Lora24Ghz), -130.0);
    }

    #[test]
    fn reference_sensitivity_per_experiment() {
        assert_eq!(reference_sensitivity(4, Band::SubGhz), -132.25);
        assert_eq!(reference_sensitivity(3, Band::SubGhz), -134.5);
        assert_eq!(reference_sensitivity(2, Band::SubGhz), -111.0);
        assert_eq!(reference_sensitivity(4, Band::Lora24Ghz), -128.0);
    }

    #[test]
    fn cell_radius_for_the_lorawan_settings() {
        let d = max_distance(14.0, reference_sensitivity(4, Band::SubGhz));
        assert!((d - 98.95).abs() < 0.1, "got {d}");
        // Every node inside the cell stays above the SF12 sensitivity.
        let prx = 14.0 - GL - path_loss(d);
        assert!(prx > sensitivity(12, 125.0, Band::SubGhz));
    }
}

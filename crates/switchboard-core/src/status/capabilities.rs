// ── Model-code capability detection ──
//
// Table-driven, first match wins. Row order is significant: "3EM" must
// be tried before the switch rows or a "1PM" substring test would claim
// energy meters, and "SHSW-25" must precede the generic "SHSW" row.

/// What a model is equipped with, derived from its model code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Per-channel power metering.
    pub has_pm: bool,
    /// Dedicated three-phase energy meter.
    pub has_em: bool,
    pub switches: u8,
    pub lights: u8,
    pub covers: u8,
}

/// Derive capabilities from a model code (e.g. `"SNSW-001P16EU"`).
///
/// Unrecognised codes yield an empty capability set; the fetch engine
/// then relies entirely on what the device itself reports.
pub fn detect_capabilities(model_code: &str) -> DeviceCapabilities {
    let code = model_code.to_ascii_uppercase();
    let matches_any = |patterns: &[&str]| patterns.iter().any(|p| code.contains(p));
    let pm = code.contains("PM");

    if matches_any(&["3EM", "SPEM"]) {
        DeviceCapabilities {
            has_em: true,
            ..DeviceCapabilities::default()
        }
    } else if matches_any(&["SHPLG", "SNPL"]) {
        DeviceCapabilities {
            has_pm: true,
            switches: 1,
            ..DeviceCapabilities::default()
        }
    } else if matches_any(&["SHBDUO", "SHBLB", "SHVIN"]) || matches_any(&["RGBW", "SHDM", "SNDM"]) {
        DeviceCapabilities {
            lights: 1,
            ..DeviceCapabilities::default()
        }
    } else if matches_any(&["SHSW-25", "2.5"]) {
        DeviceCapabilities {
            covers: 1,
            switches: 2,
            ..DeviceCapabilities::default()
        }
    } else if matches_any(&["COVER", "SHSPM"]) {
        DeviceCapabilities {
            covers: 1,
            ..DeviceCapabilities::default()
        }
    } else if matches_any(&["PRO4"]) {
        DeviceCapabilities {
            has_pm: pm,
            switches: 4,
            ..DeviceCapabilities::default()
        }
    } else if matches_any(&["PLUS2", "PRO2", "102"]) {
        DeviceCapabilities {
            has_pm: pm,
            switches: 2,
            ..DeviceCapabilities::default()
        }
    } else if matches_any(&["PLUS1", "PRO1", "SHSW", "SNSW"]) {
        DeviceCapabilities {
            has_pm: pm,
            switches: 1,
            ..DeviceCapabilities::default()
        }
    } else {
        DeviceCapabilities::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_meters_win_over_pm_substring() {
        // "SPEM-003CEBEU120" contains "PM" but is an energy meter,
        // not a metered switch.
        let caps = detect_capabilities("SPEM-003CEBEU120");
        assert!(caps.has_em);
        assert!(!caps.has_pm);
        assert_eq!(caps.switches, 0);

        let caps = detect_capabilities("S3EM-002CXCEU");
        assert!(caps.has_em);
    }

    #[test]
    fn plugs_are_single_metered_switches() {
        let caps = detect_capabilities("SNPL-00112EU");
        assert!(caps.has_pm);
        assert_eq!(caps.switches, 1);

        let caps = detect_capabilities("SHPLG-S");
        assert!(caps.has_pm);
        assert_eq!(caps.switches, 1);
    }

    #[test]
    fn bulbs_and_dimmers_are_single_lights() {
        for code in ["SHBDUO-1", "SHBLB-1", "SHVIN-1", "SHRGBW2", "SHDM-2", "SNDM-0013US"] {
            let caps = detect_capabilities(code);
            assert_eq!(caps.lights, 1, "{code}");
            assert_eq!(caps.switches, 0, "{code}");
        }
    }

    #[test]
    fn the_two_five_is_cover_plus_dual_switch() {
        let caps = detect_capabilities("SHSW-25");
        assert_eq!(caps.covers, 1);
        assert_eq!(caps.switches, 2);
    }

    #[test]
    fn dedicated_covers() {
        let caps = detect_capabilities("SNSW-102P16EU-COVER");
        assert_eq!(caps.covers, 1);

        let caps = detect_capabilities("SHSPM-44");
        assert_eq!(caps.covers, 1);
    }

    #[test]
    fn pro_and_plus_switch_counts_with_pm_suffix() {
        let caps = detect_capabilities("SPSW-004PE16EU-PRO4PM");
        assert_eq!(caps.switches, 4);
        assert!(caps.has_pm);

        let caps = detect_capabilities("SNSW-102P16EU");
        assert_eq!(caps.switches, 2);

        let caps = detect_capabilities("SNSW-001P16EU-PLUS1PM");
        assert_eq!(caps.switches, 1);
        assert!(caps.has_pm);

        // Plain gen-1 relay: one switch, no metering.
        let caps = detect_capabilities("SHSW-1");
        assert_eq!(caps.switches, 1);
        assert!(!caps.has_pm);
    }

    #[test]
    fn one_pm_does_not_match_energy_meter_rows() {
        // The classic substring collision: a "1PM" switch must never be
        // detected as an EM device.
        let caps = detect_capabilities("PLUS1PM");
        assert!(!caps.has_em);
        assert!(caps.has_pm);
        assert_eq!(caps.switches, 1);
    }

    #[test]
    fn unknown_codes_detect_nothing() {
        assert_eq!(detect_capabilities("FROBNICATOR"), DeviceCapabilities::default());
        assert_eq!(detect_capabilities(""), DeviceCapabilities::default());
    }
}

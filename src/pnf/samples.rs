//! Pass 3: decode each `0x01` sample block into a `Sample`, tracking the
//! running gas-change state across the dive.

use crate::pnf::reader::FieldReader;
use crate::types::{DiveEvent, DiveMode, GasMix, Sample};

pub struct SampleContext {
    pub is_imperial: bool,
    pub ai_enabled: bool,
    pub log_version: u8,
    pub sensor_calibration: [f64; 3],
}

/// Running state threaded across samples so gas-change events only fire on
/// an actual change, not on every repeated reading.
#[derive(Default)]
pub struct GasEventState {
    last_o2: Option<u8>,
    last_he: Option<u8>,
    last_is_oc: Option<bool>,
}

pub fn decode_sample(
    block: &[u8],
    t_offset_ms: u32,
    ctx: &SampleContext,
    state: &mut GasEventState,
) -> Sample {
    let r = FieldReader::new(block);

    let status = r.u8(12).unwrap_or(0);
    let is_oc = (status & 0x10) != 0;
    let is_external_ppo2 = (status & 0x02) == 0;

    let depth_m = r
        .u16(1)
        .map(|raw| {
            let raw = raw as f64 * 0.1;
            if ctx.is_imperial {
                raw * 0.3048
            } else {
                raw
            }
        })
        .unwrap_or(0.0);

    let temperature_c = r.i8(14).map(|raw| {
        let mut value = raw as f64;
        if value < 0.0 {
            value += 102.0;
            if value > 0.0 {
                value = 0.0;
            }
        }
        if ctx.is_imperial {
            (value - 32.0) * 5.0 / 9.0
        } else {
            value
        }
    });

    let tank_pressure_bar = if ctx.ai_enabled {
        let p_off = if ctx.log_version > 14 { 28 } else { 27 };
        r.u16(p_off).and_then(|raw| {
            if raw < 0xFFF0 {
                let psi = (raw & 0x0FFF) as f64 * 2.0;
                Some(psi * 0.0689476)
            } else {
                None
            }
        })
    } else {
        None
    };

    let ppo2 = r.u8(7).map(|v| v as f64 / 100.0);

    let sensors = if !is_oc && is_external_ppo2 {
        match (r.u8(13), r.u8(15), r.u8(16)) {
            (Some(a), Some(b), Some(c)) => Some([
                a as f64 * ctx.sensor_calibration[0],
                b as f64 * ctx.sensor_calibration[1],
                c as f64 * ctx.sensor_calibration[2],
            ]),
            _ => None,
        }
    } else {
        None
    };

    let setpoint = r.u8(19).map(|v| v as f64 / 100.0);
    let cns = r.u8(23).map(|v| v as f64 / 100.0);

    let deco_min = r.u8(10).unwrap_or(0);
    let stop_raw = r.u16(3).unwrap_or(0);
    let (deco_ceiling_m, deco_stop_depth_m, deco_stop_time_s, ndl_s) = if stop_raw > 0 {
        let depth = stop_raw as f64;
        let depth = if ctx.is_imperial { depth * 0.3048 } else { depth };
        (Some(depth), Some(depth), Some(deco_min as u32 * 60), None)
    } else {
        (None, None, None, Some(deco_min.min(99) as u32 * 60))
    };

    let tts_raw = r.u16(5).unwrap_or(0);
    let tts_s = if tts_raw > 0 {
        Some(tts_raw as u32 * 60)
    } else {
        None
    };

    let mut events = Vec::new();
    let gas_o2 = r.u8(8).unwrap_or(0);
    let gas_he = r.u8(9).unwrap_or(0);
    if gas_o2 != 0 || gas_he != 0 {
        let changed = (Some(gas_o2), Some(gas_he)) != (state.last_o2, state.last_he)
            || (state.last_is_oc.is_some() && state.last_is_oc != Some(is_oc));
        if changed {
            let mix = GasMix {
                o2: gas_o2 as f64 / 100.0,
                he: gas_he as f64 / 100.0,
                is_diluent: !is_oc,
            };
            events.push(if is_oc {
                DiveEvent::GasChange(mix)
            } else {
                DiveEvent::DiluentChange(mix)
            });
            state.last_o2 = Some(gas_o2);
            state.last_he = Some(gas_he);
        }
    }
    state.last_is_oc = Some(is_oc);

    Sample {
        t_offset_s: t_offset_ms / 1000,
        depth_m,
        temperature_c,
        tank_pressure_bar,
        ppo2,
        setpoint,
        cns,
        ndl_s,
        deco_ceiling_m,
        deco_stop_depth_m,
        deco_stop_time_s,
        tts_s,
        gas_mix: None,
        sensors,
        is_external_ppo2: Some(is_external_ppo2),
        events,
        dive_mode: if is_oc { DiveMode::OcTec } else { DiveMode::Ccr },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_with(setters: &[(usize, u8)]) -> [u8; 32] {
        let mut b = [0u8; 32];
        b[0] = 0x01;
        for &(i, v) in setters {
            b[i] = v;
        }
        b
    }

    #[test]
    fn deco_time_min_99_yields_5940_second_ndl() {
        let block = block_with(&[(10, 99)]); // deco_min=99, stop_raw defaults 0
        let ctx = SampleContext {
            is_imperial: false,
            ai_enabled: false,
            log_version: 1,
            sensor_calibration: [1.0, 1.0, 1.0],
        };
        let mut state = GasEventState::default();
        let sample = decode_sample(&block, 10_000, &ctx, &mut state);
        assert_eq!(sample.ndl_s, Some(5940));
        assert!(sample.deco_stop_depth_m.is_none());
    }

    #[test]
    fn no_gas_event_when_both_fields_zero() {
        let block = block_with(&[]);
        let ctx = SampleContext {
            is_imperial: false,
            ai_enabled: false,
            log_version: 1,
            sensor_calibration: [1.0, 1.0, 1.0],
        };
        let mut state = GasEventState::default();
        let sample = decode_sample(&block, 10_000, &ctx, &mut state);
        assert!(sample.events.is_empty());
    }

    #[test]
    fn gas_change_fires_once_then_stays_quiet_on_repeat() {
        let block = block_with(&[(8, 21), (9, 0)]); // 21% O2, OC (status bit 0x10 unset -> CCR)
        let ctx = SampleContext {
            is_imperial: false,
            ai_enabled: false,
            log_version: 1,
            sensor_calibration: [1.0, 1.0, 1.0],
        };
        let mut state = GasEventState::default();
        let s1 = decode_sample(&block, 10_000, &ctx, &mut state);
        assert_eq!(s1.events.len(), 1);
        let s2 = decode_sample(&block, 20_000, &ctx, &mut state);
        assert!(s2.events.is_empty());
    }

    #[test]
    fn imperial_depth_conversion_matches_spec_boundary() {
        let mut block = [0u8; 32];
        block[0] = 0x01;
        block[1..3].copy_from_slice(&328u16.to_be_bytes());
        let ctx = SampleContext {
            is_imperial: true,
            ai_enabled: false,
            log_version: 1,
            sensor_calibration: [1.0, 1.0, 1.0],
        };
        let mut state = GasEventState::default();
        let sample = decode_sample(&block, 0, &ctx, &mut state);
        // 328 raw * 0.1 * 0.3048 == 9.99744
        assert!((sample.depth_m - 9.99744).abs() < 1e-9);
    }
}

//! PNF parser: the two/three-pass decoder that turns a raw (already
//! decompressed) dive blob into a structured `ParsedDive`.

mod reader;
mod records;
mod samples;

use reader::FieldReader;
use records::{extract, BLOCK_LEN};
use samples::{decode_sample, GasEventState, SampleContext};

use crate::types::{assemble_gas_mixes, deco_model_name, DiveMode, GasMix, Model, ParsedDive, Tank, TankUsage};
use chrono::NaiveDateTime;

fn u8_field(block: Option<&[u8]>, i: usize) -> Option<u8> {
    block.and_then(|b| FieldReader::new(b).u8(i))
}

fn u16_field(block: Option<&[u8]>, i: usize) -> Option<u16> {
    block.and_then(|b| FieldReader::new(b).u16(i))
}

fn u24_field(block: Option<&[u8]>, i: usize) -> Option<u32> {
    block.and_then(|b| FieldReader::new(b).u24(i))
}

fn u32_field(block: Option<&[u8]>, i: usize) -> Option<u32> {
    block.and_then(|b| FieldReader::new(b).u32(i))
}

fn i32_field(block: Option<&[u8]>, i: usize) -> Option<i32> {
    block.and_then(|b| FieldReader::new(b).i32(i))
}

fn bytes_field(block: Option<&[u8]>, start: usize, len: usize) -> Option<&[u8]> {
    block.and_then(|b| FieldReader::new(b).bytes(start, len))
}

/// Parse a raw (already decompressed) dive blob. Returns `None` when the
/// blob is too short to contain a block, or when no usable start time or
/// samples could be extracted — callers fall back to a stub log.
pub fn parse(blob: &[u8]) -> Option<ParsedDive> {
    if blob.is_empty() || blob.len() % BLOCK_LEN != 0 {
        return None;
    }

    let extracted = extract(blob);
    let opening0 = extracted.openings[0];
    let opening1 = extracted.openings[1];
    let opening2 = extracted.openings[2];
    let opening3 = extracted.openings[3];
    let opening4 = extracted.openings[4];
    let opening5 = extracted.openings[5];
    let closing0 = extracted.closings[0];
    let final_record = extracted.final_record;

    let fingerprint_bytes = bytes_field(opening0, 12, 4);
    let fingerprint = match fingerprint_bytes {
        Some(b) => [b[0], b[1], b[2], b[3]],
        None => [0, 0, 0, 0],
    };

    let start_time_raw = u32_field(opening0, 12).filter(|&v| v != 0).or_else(|| {
        // fallback source happens to be the same big-endian u32 read
        u32_field(opening2, 20)
    });
    let start_time_secs = start_time_raw?;
    if start_time_secs == 0 {
        return None;
    }

    let is_imperial = u8_field(opening0, 8) == Some(1);
    let gf_low = u8_field(opening0, 4);
    let gf_high = u8_field(opening0, 5);

    let dive_mode = u8_field(opening4, 1).map(DiveMode::from_opening4_byte);
    let log_version = u8_field(opening4, 16).unwrap_or(0);
    let gases_enabled = u16_field(opening4, 17).unwrap_or(0x1F);
    let ai_enabled = u8_field(opening4, 28).map(|v| v != 0).unwrap_or(false);

    let deco_model = u8_field(opening2, 18).map(deco_model_name);

    let water_density = u16_field(opening3, 3).filter(|&v| v > 0);

    let mut sensor_calibration = [1.0f64; 3];
    if let Some(mask) = u8_field(opening3, 6) {
        for i in 0..3 {
            if mask & (1 << i) != 0 {
                if let Some(raw) = u16_field(opening3, 7 + 2 * i) {
                    sensor_calibration[i] = raw as f64 / 100_000.0;
                }
            }
        }
    }

    let surface_pressure_bar = u16_field(opening1, 16).filter(|&v| v > 0).map(|v| v as f64 / 1000.0);

    let mut o2_percent = [0u8; 10];
    if let Some(b) = bytes_field(opening0, 20, 5) {
        o2_percent[0..5].copy_from_slice(b);
    }
    if let Some(b) = bytes_field(opening0, 25, 5) {
        o2_percent[5..10].copy_from_slice(b);
    }
    let mut he_percent = [0u8; 10];
    if let (Some(a), Some(b)) = (u8_field(opening0, 30), u8_field(opening0, 31)) {
        he_percent[0] = a;
        he_percent[1] = b;
    }
    if let Some(b) = bytes_field(opening1, 1, 8) {
        he_percent[2..10].copy_from_slice(b);
    }

    let model_byte = u8_field(final_record, 13);
    let model = model_byte.map(Model::from_final_byte);
    let is_teric = model == Some(Model::Teric);

    let timezone_offset_seconds = if is_teric && log_version >= 9 {
        match (i32_field(opening5, 26), u8_field(opening5, 30)) {
            (Some(utc_min), Some(dst_h)) => Some(utc_min * 60 + dst_h as i32 * 3600),
            _ => None,
        }
    } else {
        None
    };

    let resolved_dive_mode = dive_mode.unwrap_or(DiveMode::Unknown);
    let gas_mixes = assemble_gas_mixes(&o2_percent, &he_percent, gases_enabled, resolved_dive_mode);

    let tanks = extract_tanks(&extracted, is_teric);

    let ctx = SampleContext {
        is_imperial,
        ai_enabled,
        log_version,
        sensor_calibration,
    };
    let mut gas_state = GasEventState::default();
    let mut current_mix = gas_mixes.first().copied();
    let mut samples = Vec::with_capacity(extracted.samples.len());
    for (t_offset_ms, block) in &extracted.samples {
        let mut sample = decode_sample(block, *t_offset_ms, &ctx, &mut gas_state);
        if let Some(mix) = latest_gas_change(&sample.events) {
            current_mix = Some(mix);
        }
        sample.gas_mix = current_mix;
        samples.push(sample);
    }
    if samples.is_empty() {
        return None;
    }

    let max_depth_m = u16_field(closing0, 4)
        .map(|raw| {
            let v = raw as f64 / 10.0;
            if is_imperial {
                v * 0.3048
            } else {
                v
            }
        })
        .unwrap_or_else(|| samples.iter().map(|s| s.depth_m).fold(0.0, f64::max));

    let duration_s = u24_field(closing0, 6).unwrap_or_else(|| samples.last().map(|s| s.t_offset_s).unwrap_or(0));

    let avg_depth_m = if samples.is_empty() {
        0.0
    } else {
        samples.iter().map(|s| s.depth_m).sum::<f64>() / samples.len() as f64
    };

    let start_time = NaiveDateTime::from_timestamp_opt(start_time_secs as i64, 0)
        .unwrap_or_else(|| NaiveDateTime::from_timestamp_opt(0, 0).unwrap());

    Some(ParsedDive {
        start_time,
        duration_s,
        max_depth_m,
        avg_depth_m,
        surface_pressure_bar,
        samples,
        gas_mixes,
        tanks,
        deco_model,
        gf_low,
        gf_high,
        dive_mode,
        water_density,
        timezone_offset_seconds,
        fingerprint,
    })
}

/// Render a parsed dive's sample profile as CSV, the offline export format
/// alongside JSON.
pub fn dive_to_csv(dive: &ParsedDive) -> String {
    let mut csv = String::from("time_s,depth_m,temp_c,pressure_bar\n");
    for s in &dive.samples {
        csv.push_str(&format!(
            "{},{:.1},{},{}",
            s.t_offset_s,
            s.depth_m,
            s.temperature_c
                .map(|t| format!("{t:.1}"))
                .unwrap_or_default(),
            s.tank_pressure_bar
                .map(|p| format!("{p:.1}"))
                .unwrap_or_default(),
        ));
        csv.push('\n');
    }
    csv
}

/// A gas-change event carried by this sample, if any, so the caller can
/// carry the mix it selects forward onto later samples.
fn latest_gas_change(events: &[crate::types::DiveEvent]) -> Option<GasMix> {
    use crate::types::DiveEvent;
    events.iter().find_map(|e| match e {
        DiveEvent::GasChange(m) | DiveEvent::DiluentChange(m) => Some(*m),
        _ => None,
    })
}

fn extract_tanks(extracted: &records::ExtractedBlocks<'_>, is_teric: bool) -> Vec<Tank> {
    let sources: [(Option<&[u8]>, usize); 4] = [
        (extracted.openings[5], 1),
        (extracted.openings[5], 10),
        (extracted.openings[6], 25),
        (extracted.openings[7], 4),
    ];

    let mut tanks = Vec::new();
    for (i, (block, offset)) in sources.iter().enumerate() {
        let Some(bytes) = bytes_field(*block, *offset, 3) else {
            continue;
        };
        let ordered: [u8; 3] = if is_teric {
            [bytes[2], bytes[1], bytes[0]]
        } else {
            [bytes[0], bytes[1], bytes[2]]
        };
        let serial: String = ordered.iter().map(|b| format!("{b:02X}")).collect();
        if serial == "000000" {
            continue;
        }
        tanks.push(Tank {
            name: format!("Tank {}", i + 1),
            serial,
            usage: TankUsage::Unknown,
        });
    }
    tanks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(first: u8) -> [u8; BLOCK_LEN] {
        let mut b = [0u8; BLOCK_LEN];
        b[0] = first;
        b
    }

    fn build_minimal_blob(model_byte: u8, log_version: u8, gf: (u8, u8)) -> Vec<u8> {
        let mut opening0 = block(0x10);
        opening0[4] = gf.0;
        opening0[5] = gf.1;
        opening0[12..16].copy_from_slice(&1_700_000_000u32.to_be_bytes());

        let mut opening4 = block(0x14);
        opening4[1] = 6; // OC-Rec
        opening4[16] = log_version;
        opening4[17..19].copy_from_slice(&0x1Fu16.to_be_bytes());

        let mut opening5 = block(0x15);
        opening5[26..30].copy_from_slice(&480i32.to_be_bytes());
        opening5[30] = 1;

        let mut final_record = block(0xFF);
        final_record[13] = model_byte;

        let mut sample = block(0x01);
        sample[1..3].copy_from_slice(&100u16.to_be_bytes()); // 10.0 m

        let mut blob = Vec::new();
        blob.extend_from_slice(&opening0);
        blob.extend_from_slice(&opening4);
        blob.extend_from_slice(&opening5);
        blob.extend_from_slice(&sample);
        blob.extend_from_slice(&final_record);
        blob
    }

    #[test]
    fn teric_timezone_offset_is_decoded() {
        let blob = build_minimal_blob(8, 9, (30, 85));
        let dive = parse(&blob).expect("dive should parse");
        assert_eq!(dive.timezone_offset_seconds, Some(480 * 60 + 3600));
        assert_eq!(dive.gf_low, Some(30));
        assert_eq!(dive.gf_high, Some(85));
    }

    #[test]
    fn non_teric_timezone_offset_is_absent() {
        let blob = build_minimal_blob(0, 9, (30, 85));
        let dive = parse(&blob).expect("dive should parse");
        assert_eq!(dive.timezone_offset_seconds, None);
    }

    #[test]
    fn blob_shorter_than_one_block_yields_no_dive() {
        let blob = vec![0u8; BLOCK_LEN - 1];
        assert!(parse(&blob).is_none());
    }

    #[test]
    fn blob_with_no_samples_yields_no_dive() {
        let mut opening0 = block(0x10);
        opening0[12..16].copy_from_slice(&1_700_000_000u32.to_be_bytes());
        assert!(parse(&opening0).is_none());
    }
}

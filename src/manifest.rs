//! Manifest reader: downloads the ring-buffer manifest region and walks it
//! into an ordered list of dive candidates.

use std::sync::atomic::AtomicBool;

use crate::engine;
use crate::error::ProtocolResult;
use crate::transport::Transport;
use crate::types::DiveLogCandidate;

const MANIFEST_SIZE: u32 = 0x600;
const RECORD_LEN: usize = 0x20;
const HEADER_DELETED: u16 = 0x5A23;
const HEADER_ACTIVE: u16 = 0xA5C4;

/// Download the manifest region at `base_address` and parse it into dense,
/// 1-based, newest-first candidates.
pub async fn read_manifest(
    transport: &Transport,
    base_address: u32,
) -> ProtocolResult<Vec<DiveLogCandidate>> {
    let cancel = AtomicBool::new(false);
    let buf = engine::download(
        transport,
        base_address,
        MANIFEST_SIZE,
        false,
        &cancel,
        |_| {},
    )
    .await?;
    Ok(parse_manifest(&buf))
}

/// Walk a manifest buffer in fixed `0x20`-byte records, stopping at the
/// first record whose header is neither `0x5A23` nor `0xA5C4`.
fn parse_manifest(buf: &[u8]) -> Vec<DiveLogCandidate> {
    let mut candidates = Vec::new();
    let mut ordinal = 1u32;

    for record in buf.chunks(RECORD_LEN) {
        if record.len() < RECORD_LEN {
            break;
        }
        let header = u16::from_be_bytes([record[0], record[1]]);
        match header {
            HEADER_DELETED => continue,
            HEADER_ACTIVE => {
                let fingerprint = [record[4], record[5], record[6], record[7]];
                let absolute_address = u32::from_be_bytes([
                    record[20], record[21], record[22], record[23],
                ]);
                candidates.push(DiveLogCandidate {
                    ordinal,
                    fingerprint,
                    absolute_address,
                });
                ordinal += 1;
            }
            _ => break,
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_record(fingerprint: [u8; 4], address: u32) -> [u8; RECORD_LEN] {
        let mut record = [0u8; RECORD_LEN];
        record[0..2].copy_from_slice(&HEADER_ACTIVE.to_be_bytes());
        record[4..8].copy_from_slice(&fingerprint);
        record[20..24].copy_from_slice(&address.to_be_bytes());
        record
    }

    fn deleted_record() -> [u8; RECORD_LEN] {
        let mut record = [0u8; RECORD_LEN];
        record[0..2].copy_from_slice(&HEADER_DELETED.to_be_bytes());
        record
    }

    #[test]
    fn manifest_scan_matches_fixture_scenario() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&active_record([0xAA, 0x11, 0xBB, 0x22], 0x00001000));
        buf.extend_from_slice(&deleted_record());
        buf.extend_from_slice(&active_record([0xCC, 0x33, 0xDD, 0x44], 0x00002000));
        buf.extend_from_slice(&[0u8; RECORD_LEN]); // terminator

        let candidates = parse_manifest(&buf);

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].ordinal, 1);
        assert_eq!(candidates[0].fingerprint, [0xAA, 0x11, 0xBB, 0x22]);
        assert_eq!(candidates[0].absolute_address, 0x1000);
        assert_eq!(candidates[1].ordinal, 2);
        assert_eq!(candidates[1].fingerprint, [0xCC, 0x33, 0xDD, 0x44]);
        assert_eq!(candidates[1].absolute_address, 0x2000);
    }

    #[test]
    fn manifest_scan_ordinals_are_dense() {
        let mut buf = Vec::new();
        for i in 0..5u8 {
            buf.extend_from_slice(&active_record([i, i, i, i], i as u32 * 0x1000));
        }
        buf.extend_from_slice(&[0u8; RECORD_LEN]);

        let candidates = parse_manifest(&buf);
        let ordinals: Vec<u32> = candidates.iter().map(|c| c.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn manifest_scan_stops_on_unknown_header() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&active_record([1, 2, 3, 4], 0x1000));
        let mut garbage = [0u8; RECORD_LEN];
        garbage[0..2].copy_from_slice(&[0x12, 0x34]);
        buf.extend_from_slice(&garbage);
        buf.extend_from_slice(&active_record([5, 6, 7, 8], 0x2000));

        let candidates = parse_manifest(&buf);
        assert_eq!(candidates.len(), 1);
    }
}

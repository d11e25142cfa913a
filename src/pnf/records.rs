//! Pass 1: classify the 32-byte record blocks of a dive blob into openings,
//! closings, the final record, and timestamped sample blocks.

pub const BLOCK_LEN: usize = 32;
const DEFAULT_SAMPLE_INTERVAL_MS: u32 = 10_000;

const RECORD_OPENING_START: u8 = 0x10;
const RECORD_OPENING_END: u8 = 0x17;
const RECORD_CLOSING_START: u8 = 0x20;
const RECORD_CLOSING_END: u8 = 0x27;
const RECORD_SAMPLE: u8 = 0x01;
const RECORD_FINAL: u8 = 0xFF;

/// Opening record index 5 (`0x15`) carries the sample interval override.
const OPENING_INTERVAL_INDEX: usize = 5;

pub struct ExtractedBlocks<'a> {
    pub openings: [Option<&'a [u8]>; 8],
    pub closings: [Option<&'a [u8]>; 8],
    pub final_record: Option<&'a [u8]>,
    /// `(cumulative_time_offset_ms, block)` for each `0x01` sample block, in
    /// blob order.
    pub samples: Vec<(u32, &'a [u8])>,
}

/// Split `blob` into 32-byte blocks and classify each by its first byte.
/// `blob.len()` must already be a multiple of `BLOCK_LEN`; the caller
/// rejects shorter input before calling this.
pub fn extract(blob: &[u8]) -> ExtractedBlocks<'_> {
    let mut openings: [Option<&[u8]>; 8] = [None; 8];
    let mut closings: [Option<&[u8]>; 8] = [None; 8];
    let mut final_record = None;
    let mut samples = Vec::new();

    let mut sample_interval_ms = DEFAULT_SAMPLE_INTERVAL_MS;
    let mut current_time_ms: u32 = 0;

    for block in blob.chunks_exact(BLOCK_LEN) {
        match block[0] {
            RECORD_SAMPLE => {
                current_time_ms = current_time_ms.saturating_add(sample_interval_ms);
                samples.push((current_time_ms, block));
            }
            t @ RECORD_OPENING_START..=RECORD_OPENING_END => {
                let idx = (t - RECORD_OPENING_START) as usize;
                openings[idx] = Some(block);
                if t == 0x15 {
                    if let Some(ms) = block.get(23..25).map(|s| u16::from_be_bytes([s[0], s[1]])) {
                        if ms > 0 {
                            sample_interval_ms = ms as u32;
                        }
                    }
                }
            }
            t @ RECORD_CLOSING_START..=RECORD_CLOSING_END => {
                let idx = (t - RECORD_CLOSING_START) as usize;
                closings[idx] = Some(block);
            }
            RECORD_FINAL => final_record = Some(block),
            _ => {}
        }
    }

    ExtractedBlocks {
        openings,
        closings,
        final_record,
        samples,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(first: u8) -> [u8; BLOCK_LEN] {
        let mut b = [0u8; BLOCK_LEN];
        b[0] = first;
        b
    }

    #[test]
    fn classifies_opening_closing_sample_and_final() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&block(0x10));
        blob.extend_from_slice(&block(0x01));
        blob.extend_from_slice(&block(0x01));
        blob.extend_from_slice(&block(0x20));
        blob.extend_from_slice(&block(0xFF));

        let extracted = extract(&blob);
        assert!(extracted.openings[0].is_some());
        assert!(extracted.closings[0].is_some());
        assert!(extracted.final_record.is_some());
        assert_eq!(extracted.samples.len(), 2);
        assert_eq!(extracted.samples[0].0, DEFAULT_SAMPLE_INTERVAL_MS);
        assert_eq!(extracted.samples[1].0, DEFAULT_SAMPLE_INTERVAL_MS * 2);
    }

    #[test]
    fn opening5_overrides_sample_interval() {
        let mut opening5 = block(0x15);
        opening5[23..25].copy_from_slice(&5_000u16.to_be_bytes());

        let mut blob = Vec::new();
        blob.extend_from_slice(&opening5);
        blob.extend_from_slice(&block(0x01));
        blob.extend_from_slice(&block(0x01));

        let extracted = extract(&blob);
        assert_eq!(extracted.samples[0].0, 5_000);
        assert_eq!(extracted.samples[1].0, 10_000);
    }

    #[test]
    fn unknown_record_type_is_ignored() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&block(0x30)); // info record
        blob.extend_from_slice(&block(0xE1)); // sample extension
        let extracted = extract(&blob);
        assert!(extracted.samples.is_empty());
        assert!(extracted.final_record.is_none());
    }
}

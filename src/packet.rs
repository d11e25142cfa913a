//! Packet layer: wraps an application payload in the 4-byte protocol header
//! and validates it on the way back in.

use crate::error::{ProtocolError, ProtocolResult};

/// Prepend `[0xFF, 0x01, payload_len+1, 0x00]` to `payload`.
pub fn build(payload: &[u8]) -> Vec<u8> {
    let l = (payload.len() + 1) as u8;
    let mut pkt = Vec::with_capacity(payload.len() + 4);
    pkt.push(0xFF);
    pkt.push(0x01);
    pkt.push(l);
    pkt.push(0x00);
    pkt.extend_from_slice(payload);
    pkt
}

/// Validate a decoded packet and return its payload slice.
///
/// Requires `pkt[0]==0x01, pkt[1]==0xFF, pkt[3]==0x00`, and `L := pkt[2] >= 1`.
pub fn parse(pkt: &[u8]) -> ProtocolResult<&[u8]> {
    if pkt.len() < 4 || pkt[0] != 0x01 || pkt[1] != 0xFF || pkt[3] != 0x00 {
        return Err(ProtocolError::InvalidPacketHeader(pkt.to_vec()));
    }
    let l = pkt[2] as usize;
    if l < 1 {
        return Err(ProtocolError::InvalidPacketLength {
            declared: l,
            available: pkt.len(),
        });
    }
    let end = 4 + (l - 1);
    if end > pkt.len() {
        return Err(ProtocolError::InvalidPacketLength {
            declared: end,
            available: pkt.len(),
        });
    }
    Ok(&pkt[4..end])
}

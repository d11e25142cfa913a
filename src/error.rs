use thiserror::Error;

/// Errors surfaced by the protocol-layer modules (SLIP, packet, transport,
/// engine, manifest, PNF parser). The orchestrator and CLI wrap these in
/// `anyhow::Result` with added context the way the rest of the crate does.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid packet header: {0:02x?}")]
    InvalidPacketHeader(Vec<u8>),

    #[error("invalid packet length: declared {declared}, available {available}")]
    InvalidPacketLength { declared: usize, available: usize },

    #[error("unexpected RDBI response: expected id 0x{expected_id:04x}, got opcode 0x{got_opcode:02x} id 0x{got_id:04x}")]
    UnexpectedRdbiResponse {
        expected_id: u16,
        got_opcode: u8,
        got_id: u16,
    },

    #[error("invalid RDBI payload length: expected {expected}, got {got}")]
    InvalidRdbiPayloadLength { expected: usize, got: usize },

    #[error("unexpected download init response: {0:02x?}")]
    UnexpectedInitResponse(Vec<u8>),

    #[error("unexpected block response at index {expected_index}: {got:02x?}")]
    UnexpectedBlockResponse { expected_index: u8, got: Vec<u8> },

    #[error("timed out waiting for response")]
    Timeout,

    #[error("BLE link disconnected")]
    Disconnected,

    #[error("operation cancelled")]
    Cancelled,

    #[error("malformed SLIP/LRE stream: {0}")]
    Decode(String),

    #[error("BLE link error: {0}")]
    Link(String),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

//! Protocol engine: RDBI reads, the block-wise download sub-protocol, and
//! end-session. Sits directly on top of `Transport`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::sleep;

use crate::decompress::{lre_decode, xor32};
use crate::error::{ProtocolError, ProtocolResult};
use crate::transport::Transport;

pub const RDBI_SERIAL: u16 = 0x8010;
pub const RDBI_FIRMWARE: u16 = 0x8011;
pub const RDBI_HARDWARE_CODE: u16 = 0x8050;
pub const RDBI_LOG_BASE_ADDRESS: u16 = 0x8021;

const OPCODE_RDBI_REQUEST: u8 = 0x22;
const OPCODE_RDBI_RESPONSE: u8 = 0x62;
const OPCODE_DOWNLOAD_INIT: u8 = 0x35;
const OPCODE_DOWNLOAD_INIT_OK: u8 = 0x75;
const OPCODE_DOWNLOAD_INIT_NAK: u8 = 0x7F;
const OPCODE_DOWNLOAD_BLOCK_REQUEST: u8 = 0x36;
const OPCODE_DOWNLOAD_BLOCK_RESPONSE: u8 = 0x76;
const OPCODE_DOWNLOAD_QUIT: u8 = 0x37;
const DOWNLOAD_INIT_ADDRESS_MARKER: u8 = 0x34;

/// Read a Read-by-Data-Identifier object. `expected` is the payload length
/// the caller wants; set `allow_shorter` for IDs whose payload may be
/// padded shorter than its nominal size (e.g. firmware strings).
pub async fn rdbi_read(
    transport: &Transport,
    id: u16,
    expected: usize,
    allow_shorter: bool,
) -> ProtocolResult<Vec<u8>> {
    let request = [OPCODE_RDBI_REQUEST, (id >> 8) as u8, (id & 0xFF) as u8];
    let response = transport.transfer(&request, expected + 3).await?;

    if response.len() < 3 {
        return Err(ProtocolError::InvalidRdbiPayloadLength {
            expected,
            got: response.len().saturating_sub(3),
        });
    }
    let got_opcode = response[0];
    let got_id = u16::from_be_bytes([response[1], response[2]]);
    if got_opcode != OPCODE_RDBI_RESPONSE || got_id != id {
        return Err(ProtocolError::UnexpectedRdbiResponse {
            expected_id: id,
            got_opcode,
            got_id,
        });
    }

    let payload = &response[3..];
    if payload.len() != expected && !(allow_shorter && payload.len() < expected) {
        return Err(ProtocolError::InvalidRdbiPayloadLength {
            expected,
            got: payload.len(),
        });
    }
    Ok(payload.to_vec())
}

/// Decode an RDBI payload as trimmed ASCII, falling back to an uppercase hex
/// dump if any byte isn't printable ASCII.
pub fn ascii_or_hex(bytes: &[u8]) -> String {
    let trimmed: &[u8] = {
        let end = bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(bytes.len());
        &bytes[..end]
    };
    if trimmed.iter().all(|&b| (0x20..=0x7E).contains(&b)) {
        String::from_utf8_lossy(trimmed).into_owned()
    } else {
        bytes.iter().map(|b| format!("{b:02X}")).collect()
    }
}

pub async fn read_serial(transport: &Transport) -> ProtocolResult<String> {
    let raw = rdbi_read(transport, RDBI_SERIAL, 8, false).await?;
    Ok(ascii_or_hex(&raw))
}

pub async fn read_firmware(transport: &Transport) -> ProtocolResult<String> {
    let raw = rdbi_read(transport, RDBI_FIRMWARE, 12, true).await?;
    Ok(ascii_or_hex(&raw))
}

pub async fn read_hardware_code(transport: &Transport) -> ProtocolResult<u16> {
    let raw = rdbi_read(transport, RDBI_HARDWARE_CODE, 2, false).await?;
    Ok(u16::from_be_bytes([raw[0], raw[1]]))
}

/// Read the log base address and normalize it per the known firmware
/// aliases; `0xDD000000`/`0xC0000000`/`0x90000000` all mean the same region.
pub async fn read_log_base_address(transport: &Transport) -> ProtocolResult<u32> {
    let raw = rdbi_read(transport, RDBI_LOG_BASE_ADDRESS, 9, false).await?;
    let addr = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]);
    Ok(normalize_base_address(addr))
}

pub fn normalize_base_address(addr: u32) -> u32 {
    match addr {
        0xDD000000 | 0xC0000000 | 0x90000000 => 0xC0000000,
        other => other,
    }
}

fn build_init_request(flags: u8, address: u32, size: u32) -> Vec<u8> {
    let addr_be = address.to_be_bytes();
    let size_be = size.to_be_bytes();
    let mut req = Vec::with_capacity(8);
    req.push(OPCODE_DOWNLOAD_INIT);
    req.push(flags);
    req.push(DOWNLOAD_INIT_ADDRESS_MARKER);
    req.extend_from_slice(&addr_be);
    req.extend_from_slice(&size_be[1..4]); // 24-bit big-endian size
    req
}

/// Run the block-wise download sub-protocol: `Idle -> InitSent ->
/// Streaming(block_index) -> Quitted`. On success returns the raw bytes
/// (already XOR-32-reversed when `compressed`).
///
/// `on_progress` is invoked with the cumulative output length after every
/// block. `cancel` is polled once per loop iteration for cooperative
/// cancellation.
pub async fn download(
    transport: &Transport,
    address: u32,
    size: u32,
    compressed: bool,
    cancel: &AtomicBool,
    mut on_progress: impl FnMut(usize),
) -> ProtocolResult<Vec<u8>> {
    let flags = if compressed { 0x10 } else { 0x00 };
    let init_request = build_init_request(flags, address, size);

    let mut init_response = transport.transfer(&init_request, 3).await?;
    if init_response.is_empty() || init_response[0] == OPCODE_DOWNLOAD_INIT_NAK {
        // one NAK-retry: quit (response ignored), pause, retry init once
        let _ = transport.transfer(&[OPCODE_DOWNLOAD_QUIT], 0).await;
        sleep(Duration::from_millis(100)).await;
        init_response = transport.transfer(&init_request, 3).await?;
    }
    if init_response.len() < 3 || init_response[0] != OPCODE_DOWNLOAD_INIT_OK {
        return Err(ProtocolError::UnexpectedInitResponse(init_response));
    }
    let max_block = init_response[2] as usize;

    sleep(Duration::from_millis(100)).await;

    let mut output = Vec::new();
    let mut block_index: u8 = 1;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return Err(ProtocolError::Cancelled);
        }

        let block_request = [OPCODE_DOWNLOAD_BLOCK_REQUEST, block_index];
        let response = transport
            .transfer(&block_request, max_block + 2)
            .await?;
        if response.len() < 2
            || response[0] != OPCODE_DOWNLOAD_BLOCK_RESPONSE
            || response[1] != block_index
        {
            return Err(ProtocolError::UnexpectedBlockResponse {
                expected_index: block_index,
                got: response,
            });
        }
        let payload = &response[2..];

        if compressed {
            let (expanded, is_final) = lre_decode(payload);
            output.extend_from_slice(&expanded);
            on_progress(output.len());
            if is_final {
                break;
            }
        } else {
            output.extend_from_slice(payload);
            on_progress(output.len());
            if output.len() as u32 >= size {
                break;
            }
        }

        block_index = block_index.wrapping_add(1);
    }

    if compressed {
        xor32(&mut output);
    }

    match transport.transfer(&[OPCODE_DOWNLOAD_QUIT], 2).await {
        Ok(resp) if resp == [0x77, 0x00] => {}
        Ok(resp) => log::warn!("unexpected quit response: {resp:02x?}"),
        Err(e) => log::warn!("quit request failed (data already received): {e}"),
    }

    Ok(output)
}

/// End the session. Errors are logged, not propagated: the bytes already
/// received by the host are unaffected.
pub async fn close_session(transport: &Transport) {
    if let Err(e) = transport.transfer(&[0x2E, 0x90, 0x20, 0x00], 0).await {
        log::debug!("close_session: ignoring error: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::MockLink;
    use crate::slip;
    use std::time::Duration as StdDuration;

    async fn wait_for_write_count(link: &std::sync::Arc<MockLink>, n: usize) {
        loop {
            if link.writes.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(1)).await;
        }
    }

    /// Build a packet the way a device reply actually arrives on the wire
    /// (`[0x01, 0xFF, L, 0x00, payload...]`) and feed it through SLIP
    /// framing into the mock link's notification channel.
    fn send_packet(feed: &tokio::sync::mpsc::UnboundedSender<Vec<u8>>, payload: &[u8]) {
        let mut pkt = vec![0x01, 0xFF, (payload.len() + 1) as u8, 0x00];
        pkt.extend_from_slice(payload);
        for frame in slip::encode_frames(&pkt) {
            feed.send(frame).unwrap();
        }
    }

    #[tokio::test]
    async fn rdbi_read_happy_path() {
        let (link, feed) = MockLink::new();
        let transport = Transport::new(link.clone()).await.unwrap();

        let responder = tokio::spawn({
            let link = link.clone();
            async move {
                wait_for_write_count(&link, 1).await;
                send_packet(&feed, &[0x62, 0x80, 0x10, b'1', b'2', b'3', b'4', b'5', b'6', 0, 0]);
            }
        });

        let serial = read_serial(&transport).await.unwrap();
        responder.await.unwrap();
        assert_eq!(serial, "123456");
    }

    #[tokio::test]
    async fn rdbi_read_rejects_mismatched_id() {
        let (link, feed) = MockLink::new();
        let transport = Transport::new(link.clone()).await.unwrap();

        let responder = tokio::spawn({
            let link = link.clone();
            async move {
                wait_for_write_count(&link, 1).await;
                send_packet(&feed, &[0x62, 0x80, 0x11, 0, 0]);
            }
        });

        let result = rdbi_read(&transport, RDBI_SERIAL, 2, false).await;
        responder.await.unwrap();
        assert!(matches!(
            result,
            Err(ProtocolError::UnexpectedRdbiResponse { .. })
        ));
    }

    #[test]
    fn normalize_base_address_collapses_known_aliases() {
        assert_eq!(normalize_base_address(0xDD000000), 0xC0000000);
        assert_eq!(normalize_base_address(0x90000000), 0xC0000000);
        assert_eq!(normalize_base_address(0xC0000000), 0xC0000000);
        assert_eq!(normalize_base_address(0x80000000), 0x80000000);
    }

    #[tokio::test]
    async fn download_nak_retry_then_succeeds() {
        // scenario 5: first init returns 0x7F, quit is sent, retry succeeds,
        // then a single uncompressed block completes the transfer.
        let (link, feed) = MockLink::new();
        let transport = Transport::new(link.clone()).await.unwrap();

        let responder = tokio::spawn({
            let link = link.clone();
            async move {
                wait_for_write_count(&link, 1).await; // init #1
                send_packet(&feed, &[0x7F]);

                wait_for_write_count(&link, 2).await; // quit after NAK
                                                       // no response to quit during NAK recovery

                wait_for_write_count(&link, 3).await; // init #2 (retry)
                send_packet(&feed, &[0x75, 0x00, 0x05]);

                wait_for_write_count(&link, 4).await; // block 1
                send_packet(&feed, &[0x76, 0x01, 1, 2, 3, 4, 5]);

                wait_for_write_count(&link, 5).await; // final quit
                send_packet(&feed, &[0x77, 0x00]);
            }
        });

        let cancel = AtomicBool::new(false);
        let data = download(&transport, 0xC0001000, 5, false, &cancel, |_| {})
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(data, vec![1, 2, 3, 4, 5]);
        assert_eq!(link.writes.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn download_compressed_stops_on_lre_end_marker() {
        let (link, feed) = MockLink::new();
        let transport = Transport::new(link.clone()).await.unwrap();

        // one literal byte 0x2A then the end marker, packed into 9-bit
        // codewords big-endian: 0b1_0010_1010 (literal 0x2A), 0b0_0000_0000
        // (end) -> 18 bits padded to 3 bytes: 0x95, 0x00, 0x00.
        let lre_block = [0x95u8, 0x00, 0x00];

        let responder = tokio::spawn({
            let link = link.clone();
            async move {
                wait_for_write_count(&link, 1).await;
                send_packet(&feed, &[0x75, 0x00, 0x20]);

                wait_for_write_count(&link, 2).await;
                let mut block_payload = vec![0x76, 0x01];
                block_payload.extend_from_slice(&lre_block);
                send_packet(&feed, &block_payload);

                wait_for_write_count(&link, 3).await;
                send_packet(&feed, &[0x77, 0x00]);
            }
        });

        let cancel = AtomicBool::new(false);
        let data = download(&transport, 0xC0001000, 0xFFFFFF, true, &cancel, |_| {})
            .await
            .unwrap();
        responder.await.unwrap();

        // one byte through lre then xor32 (no-op on <= 32 bytes)
        assert_eq!(data, vec![0x2A]);
    }
}

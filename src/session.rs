//! Session orchestrator: the public surface callers use —
//! `read_device_info`, `download_manifest`, `download_dives`, `close`.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::ble::BleLink;
use crate::engine;
use crate::error::ProtocolResult;
use crate::manifest;
use crate::pnf;
use crate::transport::Transport;
use crate::types::{DeviceInfo, DiveLogCandidate, DownloadProgress, DownloadedLog, Model, StubDive};

const LOG_SIZE_UPPER_BOUND: u32 = 0xFFFFFF;
const DOWNLOAD_PACING: Duration = Duration::from_millis(200);

pub struct Session {
    transport: Transport,
    base_address: Option<u32>,
}

impl Session {
    pub async fn new(link: Arc<dyn BleLink>) -> ProtocolResult<Self> {
        Ok(Self {
            transport: Transport::new(link).await?,
            base_address: None,
        })
    }

    pub async fn read_device_info(&mut self) -> ProtocolResult<DeviceInfo> {
        let serial = engine::read_serial(&self.transport).await?;
        let firmware = engine::read_firmware(&self.transport).await?;
        let hardware_code = engine::read_hardware_code(&self.transport).await?;
        let model = Model::from_hardware_code(hardware_code);
        Ok(DeviceInfo {
            serial,
            firmware,
            model_name: model.name(),
            model,
        })
    }

    async fn ensure_base_address(&mut self) -> ProtocolResult<u32> {
        if let Some(addr) = self.base_address {
            return Ok(addr);
        }
        let addr = engine::read_log_base_address(&self.transport).await?;
        self.base_address = Some(addr);
        Ok(addr)
    }

    pub async fn download_manifest(&mut self) -> ProtocolResult<Vec<DiveLogCandidate>> {
        let base = self.ensure_base_address().await?;
        manifest::read_manifest(&self.transport, base).await
    }

    /// Download each candidate in order, reporting progress at least once
    /// per block and once per completed log. Candidates whose fingerprint
    /// appears in `known_fingerprints` are skipped, so incremental sync
    /// callers only pay for logs they don't already have.
    pub async fn download_dives(
        &mut self,
        candidates: &[DiveLogCandidate],
        known_fingerprints: Option<&HashSet<[u8; 4]>>,
        mut on_progress: impl FnMut(DownloadProgress),
    ) -> ProtocolResult<Vec<DownloadedLog>> {
        let base = self.ensure_base_address().await?;
        let candidates: Vec<&DiveLogCandidate> = candidates
            .iter()
            .filter(|c| !known_fingerprints.is_some_and(|known| known.contains(&c.fingerprint)))
            .collect();
        let total = candidates.len() as u32;
        let cancel = AtomicBool::new(false);
        let mut logs = Vec::with_capacity(candidates.len());

        for (i, candidate) in candidates.iter().enumerate() {
            sleep(DOWNLOAD_PACING).await;

            let index = i as u32 + 1;
            let raw = engine::download(
                &self.transport,
                base.wrapping_add(candidate.absolute_address),
                LOG_SIZE_UPPER_BOUND,
                true,
                &cancel,
                |bytes| {
                    on_progress(DownloadProgress {
                        current_log_index: index,
                        total_logs: total,
                        current_log_bytes: bytes,
                    });
                },
            )
            .await?;

            let raw_len = raw.len();
            match pnf::parse(&raw) {
                Some(mut dive) => {
                    if let Some(offset) = dive.timezone_offset_seconds {
                        dive.start_time -= chrono::Duration::seconds(offset as i64);
                    }
                    logs.push(DownloadedLog::Parsed(dive));
                }
                None => {
                    logs.push(DownloadedLog::Stub(StubDive {
                        fingerprint: candidate.fingerprint,
                        raw_data: raw,
                        error: "PNF parser produced no dive".to_string(),
                    }));
                }
            }

            on_progress(DownloadProgress {
                current_log_index: index,
                total_logs: total,
                current_log_bytes: raw_len,
            });
        }

        Ok(logs)
    }

    pub async fn close(&self) -> ProtocolResult<()> {
        engine::close_session(&self.transport).await;
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_address_uses_candidate_offset_from_base() {
        let base = 0xC0000000u32;
        let candidate_addr = 0x1000u32;
        assert_eq!(base.wrapping_add(candidate_addr), 0xC0001000);
    }
}

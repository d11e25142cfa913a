//! BLE collaborator: discovery/connect plumbing around `btleplug`, adapted
//! behind the `BleLink` trait so the transport layer can be driven by
//! a mock in tests.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream, StreamExt};
use tokio::time;
use uuid::Uuid;

use crate::error::{ProtocolError, ProtocolResult};

/// Shearwater's BLE serial service, as identified on Perdix/Teric/Peregrine/
/// Tern devices.
pub const SHEARWATER_SERVICE_UUID: Uuid = Uuid::from_u128(0xfe25c237_0ece_443c_b0aa_e02033e7029d);

/// BLE name prefixes used to recognize Shearwater dive computers during a
/// scan, for hosts that don't filter purely on service UUID.
const SHEARWATER_NAME_PREFIXES: &[&str] = &[
    "Perdix", "Petrel", "Teric", "Peregrine", "Tern", "NERD", "Shearwater",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

impl From<WriteKind> for WriteType {
    fn from(kind: WriteKind) -> Self {
        match kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::WithoutResponse => WriteType::WithoutResponse,
        }
    }
}

pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// The host-provided BLE link. The transport layer never touches
/// `btleplug` directly — it only depends on this trait, so the NAK-retry
/// and timeout paths can be exercised against an in-memory mock.
#[async_trait]
pub trait BleLink: Send + Sync {
    async fn write(&self, data: &[u8], write_type: WriteKind) -> ProtocolResult<()>;

    /// Subscribe to inbound notification chunks. Called exactly once, by
    /// the transport's background reader task.
    async fn notifications(&self) -> ProtocolResult<NotificationStream>;

    async fn is_connected(&self) -> bool;

    async fn close(&self) -> ProtocolResult<()>;

    /// The write type negotiated for this link's write characteristic. The
    /// transport uses this for every frame write instead of assuming
    /// without-response support.
    fn write_kind(&self) -> WriteKind {
        WriteKind::WithoutResponse
    }
}

/// Discovered BLE device info, returned by a scan.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
    pub peripheral: Peripheral,
}

/// GATT service with its characteristics, as returned by `enumerate_gatt`.
#[derive(Debug)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// GATT characteristic info.
#[derive(Debug)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: String,
}

/// Discover and list every GATT service/characteristic a peripheral exposes,
/// for `scan --enumerate` diagnostics (not used by the protocol itself).
pub async fn enumerate_gatt(peripheral: &Peripheral) -> ProtocolResult<Vec<GattService>> {
    peripheral
        .discover_services()
        .await
        .map_err(|e| ProtocolError::Link(format!("failed to discover services: {e}")))?;

    let mut services = Vec::new();
    for svc in peripheral.services() {
        let characteristics = svc
            .characteristics
            .iter()
            .map(|c| GattCharacteristic {
                uuid: c.uuid,
                properties: format!("{:?}", c.properties),
            })
            .collect();
        services.push(GattService {
            uuid: svc.uuid,
            characteristics,
        });
    }
    Ok(services)
}

pub async fn get_adapter() -> ProtocolResult<Adapter> {
    let manager = Manager::new()
        .await
        .map_err(|e| ProtocolError::Link(format!("failed to create BLE manager: {e}")))?;
    let adapters = manager
        .adapters()
        .await
        .map_err(|e| ProtocolError::Link(format!("failed to get BLE adapters: {e}")))?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| ProtocolError::Link("no BLE adapters found".into()))
}

/// Scan for Shearwater BLE devices.
pub async fn scan_for_devices(
    adapter: &Adapter,
    timeout: Duration,
) -> ProtocolResult<Vec<DiscoveredDevice>> {
    adapter
        .start_scan(ScanFilter {
            services: vec![SHEARWATER_SERVICE_UUID],
        })
        .await
        .map_err(|e| ProtocolError::Link(format!("failed to start scan: {e}")))?;

    let mut events = adapter
        .events()
        .await
        .map_err(|e| ProtocolError::Link(format!("failed to get adapter events: {e}")))?;

    let deadline = time::Instant::now() + timeout;
    let mut found_addresses = std::collections::HashSet::new();
    loop {
        let remaining = deadline.saturating_duration_since(time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match time::timeout(remaining, events.next()).await {
            Ok(Some(CentralEvent::DeviceDiscovered(id))) => {
                if found_addresses.contains(&id) {
                    continue;
                }
                if let Ok(peripheral) = adapter.peripheral(&id).await {
                    if let Ok(Some(props)) = peripheral.properties().await {
                        let is_shearwater = props.services.contains(&SHEARWATER_SERVICE_UUID)
                            || props
                                .local_name
                                .as_deref()
                                .map(is_shearwater_name)
                                .unwrap_or(false);
                        if is_shearwater {
                            found_addresses.insert(id);
                            eprintln!(
                                "  found: {} [{}] RSSI: {}",
                                props.local_name.as_deref().unwrap_or("?"),
                                props.address,
                                props
                                    .rssi
                                    .map(|r| r.to_string())
                                    .unwrap_or_else(|| "?".into())
                            );
                        }
                    }
                }
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }

    adapter.stop_scan().await.ok();

    let mut devices = Vec::new();
    let peripherals = adapter
        .peripherals()
        .await
        .map_err(|e| ProtocolError::Link(format!("failed to list peripherals: {e}")))?;
    for p in peripherals {
        if let Ok(Some(props)) = p.properties().await {
            let is_shearwater = props.services.contains(&SHEARWATER_SERVICE_UUID)
                || props
                    .local_name
                    .as_deref()
                    .map(is_shearwater_name)
                    .unwrap_or(false);
            if is_shearwater {
                devices.push(DiscoveredDevice {
                    name: props.local_name.clone().unwrap_or_default(),
                    address: props.address.to_string(),
                    rssi: props.rssi,
                    peripheral: p,
                });
            }
        }
    }
    Ok(devices)
}

fn is_shearwater_name(name: &str) -> bool {
    SHEARWATER_NAME_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// A `BleLink` backed by a live `btleplug` peripheral. Connects, discovers
/// the write/notify characteristics under the Shearwater service, and
/// subscribes on construction.
pub struct ShearwaterBleLink {
    peripheral: Peripheral,
    write_char: Characteristic,
    notify_char: Characteristic,
    write_kind: WriteKind,
}

impl ShearwaterBleLink {
    pub async fn connect(peripheral: &Peripheral) -> ProtocolResult<Self> {
        if !peripheral
            .is_connected()
            .await
            .map_err(|e| ProtocolError::Link(e.to_string()))?
        {
            peripheral
                .connect()
                .await
                .map_err(|e| ProtocolError::Link(format!("failed to connect: {e}")))?;
        }

        peripheral
            .discover_services()
            .await
            .map_err(|e| ProtocolError::Link(format!("failed to discover services: {e}")))?;

        let chars = peripheral.characteristics();
        let service_chars: Vec<_> = chars
            .iter()
            .filter(|c| c.service_uuid == SHEARWATER_SERVICE_UUID)
            .collect();

        let write_char = service_chars
            .iter()
            .find(|c| {
                c.properties.contains(btleplug::api::CharPropFlags::WRITE)
                    || c.properties
                        .contains(btleplug::api::CharPropFlags::WRITE_WITHOUT_RESPONSE)
            })
            .map(|c| (*c).clone())
            .ok_or_else(|| ProtocolError::Link("write characteristic not found".into()))?;

        // Prefer without-response (the device's steady-state pacing assumes
        // it), but fall back to with-response when that's all the
        // characteristic advertises.
        let write_kind = if write_char
            .properties
            .contains(btleplug::api::CharPropFlags::WRITE_WITHOUT_RESPONSE)
        {
            WriteKind::WithoutResponse
        } else {
            WriteKind::WithResponse
        };

        let notify_char = service_chars
            .iter()
            .find(|c| c.properties.contains(btleplug::api::CharPropFlags::NOTIFY))
            .map(|c| (*c).clone())
            .ok_or_else(|| ProtocolError::Link("notify characteristic not found".into()))?;

        peripheral
            .subscribe(&notify_char)
            .await
            .map_err(|e| ProtocolError::Link(format!("failed to subscribe: {e}")))?;

        Ok(Self {
            peripheral: peripheral.clone(),
            write_char,
            notify_char,
            write_kind,
        })
    }
}

#[async_trait]
impl BleLink for ShearwaterBleLink {
    async fn write(&self, data: &[u8], write_type: WriteKind) -> ProtocolResult<()> {
        self.peripheral
            .write(&self.write_char, data, write_type.into())
            .await
            .map_err(|e| ProtocolError::Link(format!("BLE write failed: {e}")))
    }

    async fn notifications(&self) -> ProtocolResult<NotificationStream> {
        let notify_uuid = self.notify_char.uuid;
        let stream = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| ProtocolError::Link(format!("failed to get notification stream: {e}")))?;
        let filtered = stream
            .filter(move |n| futures::future::ready(n.uuid == notify_uuid))
            .map(|n| n.value);
        Ok(Box::pin(filtered))
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn close(&self) -> ProtocolResult<()> {
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| ProtocolError::Link(format!("failed to disconnect: {e}")))
    }

    fn write_kind(&self) -> WriteKind {
        self.write_kind
    }
}

/// An in-process mock used by unit tests of the transport/engine layers: it
/// records every write it observes and lets the test push inbound
/// notification chunks on demand, without touching real hardware.
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc::{self, UnboundedSender};

    pub struct MockLink {
        rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
        pub writes: Mutex<Vec<Vec<u8>>>,
        connected: AtomicBool,
    }

    impl MockLink {
        pub fn new() -> (Arc<Self>, UnboundedSender<Vec<u8>>) {
            let (feed_tx, feed_rx) = mpsc::unbounded_channel();
            let link = Arc::new(Self {
                rx: Mutex::new(Some(feed_rx)),
                writes: Mutex::new(Vec::new()),
                connected: AtomicBool::new(true),
            });
            (link, feed_tx)
        }

        pub fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl BleLink for MockLink {
        async fn write(&self, data: &[u8], _write_type: WriteKind) -> ProtocolResult<()> {
            self.writes.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        async fn notifications(&self) -> ProtocolResult<NotificationStream> {
            let rx = self
                .rx
                .lock()
                .unwrap()
                .take()
                .expect("notifications() called more than once");
            Ok(Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)))
        }

        async fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn close(&self) -> ProtocolResult<()> {
            self.disconnect();
            Ok(())
        }
    }
}

use btleplug::{
    api::{Central, CentralEvent, Peripheral as _, ScanFilter},
    platform::{Adapter, Peripheral, PeripheralId},
};
use futures::stream::StreamExt;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, ScaleError},
    event::{EventSink, ScaleEvent},
    protocol,
    types::{DeviceId, ScaleDevice, ScanConfig},
    BODY_COMPOSITION_SERVICE_UUID, WEIGHT_SCALE_SERVICE_UUID,
};

/// Device records shared between the scanner and the connection manager
pub(crate) type DeviceTable = Arc<StdMutex<HashMap<DeviceId, ScaleDevice>>>;

/// Handle for an in-progress scan session
struct ScanSession {
    stop: watch::Sender<bool>,
}

/// Drives passive discovery of nearby scale peripherals
///
/// Deduplicates advertisements into device records: each unique device id
/// triggers at most one `deviceFound` emission per physical scan session;
/// later advertisements from the same device refresh its cached RSSI and
/// metadata silently. Scanning auto-stops after the configured timeout.
pub struct DeviceScanner {
    adapter: Adapter,
    config: ScanConfig,
    sink: EventSink,
    devices: DeviceTable,
    peripherals: Arc<StdMutex<HashMap<DeviceId, Peripheral>>>,
    session: Arc<StdMutex<Option<ScanSession>>>,
}

impl DeviceScanner {
    /// Create a scanner over the given adapter
    pub(crate) fn new(
        adapter: Adapter,
        config: ScanConfig,
        sink: EventSink,
        devices: DeviceTable,
    ) -> Self {
        Self {
            adapter,
            config,
            sink,
            devices,
            peripherals: Arc::new(StdMutex::new(HashMap::new())),
            session: Arc::new(StdMutex::new(None)),
        }
    }

    /// Begin passive discovery filtered to known scale signatures
    ///
    /// A call while already scanning is a no-op; the existing scan session
    /// keeps running.
    ///
    /// # Errors
    ///
    /// Returns [`ScaleError::Scan`] if the adapter rejects the scan start.
    pub async fn start_scan(&self) -> Result<()> {
        {
            let session = self.session.lock().expect("scan session lock poisoned");
            if session.is_some() {
                debug!("scan already in progress, ignoring start request");
                return Ok(());
            }
        }

        let filter = if self.config.filter_services {
            ScanFilter {
                services: scale_service_uuids()?,
            }
        } else {
            ScanFilter::default()
        };

        let mut events = self.adapter.events().await?;
        self.adapter
            .start_scan(filter)
            .await
            .map_err(|e| ScaleError::Scan(e.to_string()))?;

        let (stop_tx, mut stop_rx) = watch::channel(false);
        {
            let mut session = self.session.lock().expect("scan session lock poisoned");
            *session = Some(ScanSession { stop: stop_tx });
        }

        info!(timeout_ms = self.config.timeout_ms, "scan started");

        let adapter = self.adapter.clone();
        let sink = self.sink.clone();
        let devices = Arc::clone(&self.devices);
        let peripherals = Arc::clone(&self.peripherals);
        let session = Arc::clone(&self.session);
        let timeout = Duration::from_millis(self.config.timeout_ms);

        tokio::spawn(async move {
            // Ids announced during this physical scan session.
            let mut announced: HashSet<DeviceId> = HashSet::new();
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    () = &mut deadline => {
                        info!("scan timeout reached, stopping discovery");
                        if let Err(e) = adapter.stop_scan().await {
                            warn!("failed to stop scan on timeout: {e}");
                        }
                        break;
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    event = events.next() => {
                        let Some(event) = event else { break };
                        if let Some(id) = advertising_peripheral(&event) {
                            if let Ok(peripheral) = adapter.peripheral(&id).await {
                                handle_advertisement(
                                    &peripheral,
                                    &devices,
                                    &peripherals,
                                    &mut announced,
                                    &sink,
                                )
                                .await;
                            }
                        }
                    }
                }
            }

            // Only vacate the slot on self-initiated stops; an explicit
            // stop_scan already did, and a newer session may occupy it.
            if !*stop_rx.borrow() {
                session.lock().expect("scan session lock poisoned").take();
            }
        });

        Ok(())
    }

    /// Stop an in-progress scan
    ///
    /// Idempotent: stopping while not scanning succeeds trivially.
    ///
    /// # Errors
    ///
    /// Returns [`ScaleError::Ble`] if the adapter rejects the stop request.
    pub async fn stop_scan(&self) -> Result<()> {
        let session = {
            let mut session = self.session.lock().expect("scan session lock poisoned");
            session.take()
        };

        let Some(session) = session else {
            return Ok(());
        };

        let _ = session.stop.send(true);
        self.adapter.stop_scan().await?;
        info!("scan stopped");
        Ok(())
    }

    /// Release the radio ahead of a connection attempt
    ///
    /// Scanning and connecting are mutually exclusive on the shared radio;
    /// discovery resumes only on an explicit new `start_scan` call.
    pub async fn suspend(&self) -> Result<()> {
        if self.is_scanning() {
            debug!("suspending scan for connection attempt");
        }
        self.stop_scan().await
    }

    /// Whether a scan session is currently running
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.session
            .lock()
            .expect("scan session lock poisoned")
            .is_some()
    }

    /// Point-in-time snapshot of every known device record
    #[must_use]
    pub fn snapshot(&self) -> Vec<ScaleDevice> {
        let devices = self.devices.lock().expect("device table lock poisoned");
        devices.values().cloned().collect()
    }

    /// Resolve the peripheral handle for a device id
    ///
    /// Checks the discovery cache first, then the adapter's known
    /// peripherals, so previously paired devices can be resolved without a
    /// fresh scan.
    pub(crate) async fn peripheral_for(&self, id: &DeviceId) -> Option<Peripheral> {
        {
            let peripherals = self.peripherals.lock().expect("peripheral cache poisoned");
            if let Some(peripheral) = peripherals.get(id) {
                return Some(peripheral.clone());
            }
        }

        let known = self.adapter.peripherals().await.ok()?;
        for peripheral in known {
            if peripheral.address().to_string() == id.as_str() {
                self.peripherals
                    .lock()
                    .expect("peripheral cache poisoned")
                    .insert(id.clone(), peripheral.clone());
                return Some(peripheral);
            }
        }

        None
    }
}

/// Extract the advertising peripheral id from a central event
fn advertising_peripheral(event: &CentralEvent) -> Option<PeripheralId> {
    match event {
        CentralEvent::DeviceDiscovered(id)
        | CentralEvent::DeviceUpdated(id)
        | CentralEvent::ManufacturerDataAdvertisement { id, .. }
        | CentralEvent::ServiceDataAdvertisement { id, .. }
        | CentralEvent::ServicesAdvertisement { id, .. } => Some(id.clone()),
        _ => None,
    }
}

/// Classify one advertisement and fold it into the device table
async fn handle_advertisement(
    peripheral: &Peripheral,
    devices: &DeviceTable,
    peripherals: &Arc<StdMutex<HashMap<DeviceId, Peripheral>>>,
    announced: &mut HashSet<DeviceId>,
    sink: &EventSink,
) {
    let Ok(Some(props)) = peripheral.properties().await else {
        return;
    };

    let Some(variant) = protocol::detect_variant(&props.services, &props.manufacturer_data) else {
        return;
    };

    let id = DeviceId::new(props.address.to_string());
    let name = props
        .local_name
        .clone()
        .unwrap_or_else(|| format!("Scale {}", props.address));
    let manufacturer = props
        .manufacturer_data
        .keys()
        .find_map(|key| protocol::vendor_name(*key))
        .map(ToString::to_string);

    peripherals
        .lock()
        .expect("peripheral cache poisoned")
        .insert(id.clone(), peripheral.clone());

    let record = {
        let mut devices = devices.lock().expect("device table lock poisoned");
        let record = devices
            .entry(id.clone())
            .or_insert_with(|| ScaleDevice::new(id.clone(), name.clone(), variant));
        // Repeat advertisements refresh metadata silently.
        record.rssi = props.rssi;
        record.name = name;
        if manufacturer.is_some() {
            record.manufacturer = manufacturer;
        }
        record.clone()
    };

    if announced.insert(id.clone()) {
        info!(device = %id, variant = %variant, "scale discovered");
        sink.send(ScaleEvent::DeviceFound(record));
    }
}

/// Service UUIDs advertised by supported scales
fn scale_service_uuids() -> Result<Vec<Uuid>> {
    let weight = Uuid::parse_str(WEIGHT_SCALE_SERVICE_UUID)
        .map_err(|e| ScaleError::Scan(format!("invalid weight service UUID: {e}")))?;
    let composition = Uuid::parse_str(BODY_COMPOSITION_SERVICE_UUID)
        .map_err(|e| ScaleError::Scan(format!("invalid body composition service UUID: {e}")))?;
    Ok(vec![weight, composition])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_service_uuids_parse() {
        let uuids = scale_service_uuids().unwrap();
        assert_eq!(uuids.len(), 2);
        assert_ne!(uuids[0], uuids[1]);
    }

    #[test]
    fn test_advertising_peripheral_filters_event_kinds() {
        // StateUpdate-style events carry no advertising peripheral.
        let event = CentralEvent::StateUpdate(btleplug::api::CentralState::PoweredOn);
        assert!(advertising_peripheral(&event).is_none());
    }
}

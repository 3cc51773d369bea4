use async_trait::async_trait;
use btleplug::{
    api::Manager as _,
    platform::{Adapter, Manager},
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    connection::ConnectionManager,
    error::{Result, ScaleError},
    event::EventSink,
    scanner::{DeviceScanner, DeviceTable},
    types::{ConnectionConfig, DeviceId, ScaleDevice, ScanConfig, UserBiometrics},
};

/// Discovery/connection backend behind the facade
///
/// Implemented by both the real scanner/connection pair ([`BleBackend`])
/// and the simulator ([`crate::mock::MockDataSource`]), selected once at
/// construction time; consumer code never branches on which one is
/// active, and a missing radio is surfaced from `initialize` rather than
/// silently falling back to the mock.
#[async_trait]
pub trait ScaleBackend: Send + Sync {
    /// Check capability and bind the event sink
    ///
    /// # Errors
    ///
    /// Returns [`ScaleError::CapabilityUnavailable`] when the radio is
    /// absent or permission is denied; never auto-retried.
    async fn initialize(&self, sink: EventSink) -> Result<()>;

    /// Begin passive discovery (no-op while already scanning)
    async fn start_scan(&self) -> Result<()>;

    /// Stop discovery (idempotent)
    async fn stop_scan(&self) -> Result<()>;

    /// Open a session to the device with the given id
    async fn connect(&self, id: &DeviceId) -> Result<ScaleDevice>;

    /// Close the session or cancel the in-flight attempt (idempotent)
    async fn disconnect(&self) -> Result<()>;

    /// Point-in-time snapshot of known devices, unique by id
    async fn discovered_devices(&self) -> Vec<ScaleDevice>;

    /// Seed a previously paired device so it can be connected without a
    /// fresh scan
    async fn register_paired(&self, device: ScaleDevice);

    /// Supply or clear the biometrics used for impedance analysis
    async fn set_biometrics(&self, biometrics: Option<UserBiometrics>);

    /// Stop scanning, disconnect, and release the radio
    async fn teardown(&self) -> Result<()>;
}

/// Live components, created by `initialize`
struct BleRuntime {
    scanner: DeviceScanner,
    connection: ConnectionManager,
}

/// Real backend over the platform Bluetooth adapter
///
/// Owns the shared radio: the scanner holds it while discovering, the
/// connection manager while a session is in flight or established, and
/// never both at once — `connect` suspends the scanner first, and
/// discovery resumes only on an explicit `start_scan`.
pub struct BleBackend {
    scan_config: ScanConfig,
    connection_config: ConnectionConfig,
    devices: DeviceTable,
    runtime: Mutex<Option<Arc<BleRuntime>>>,
    biometrics: StdMutex<Option<UserBiometrics>>,
}

impl BleBackend {
    /// Create an uninitialized backend
    #[must_use]
    pub fn new(scan_config: ScanConfig, connection_config: ConnectionConfig) -> Self {
        Self {
            scan_config,
            connection_config,
            devices: Arc::new(StdMutex::new(HashMap::new())),
            runtime: Mutex::new(None),
            biometrics: StdMutex::new(None),
        }
    }

    /// Grab the live runtime without holding the slot lock across awaits
    ///
    /// Commands run on a cloned handle so a long-running connect never
    /// blocks the disconnect that is supposed to cancel it.
    async fn runtime(&self) -> Result<Arc<BleRuntime>> {
        self.runtime
            .lock()
            .await
            .as_ref()
            .cloned()
            .ok_or(ScaleError::NotInitialized)
    }

    /// Acquire the first usable adapter
    async fn acquire_adapter() -> Result<Adapter> {
        let manager = Manager::new()
            .await
            .map_err(|e| ScaleError::CapabilityUnavailable(format!("Bluetooth manager: {e}")))?;

        let adapters = manager
            .adapters()
            .await
            .map_err(|e| ScaleError::CapabilityUnavailable(format!("adapter enumeration: {e}")))?;

        adapters.into_iter().next().ok_or_else(|| {
            ScaleError::CapabilityUnavailable("no Bluetooth adapter present".to_string())
        })
    }
}

impl Default for BleBackend {
    fn default() -> Self {
        Self::new(ScanConfig::default(), ConnectionConfig::default())
    }
}

#[async_trait]
impl ScaleBackend for BleBackend {
    async fn initialize(&self, sink: EventSink) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            debug!("backend already initialized");
            return Ok(());
        }

        let adapter = Self::acquire_adapter().await?;
        info!("Bluetooth adapter acquired");

        let scanner = DeviceScanner::new(
            adapter,
            self.scan_config.clone(),
            sink.clone(),
            Arc::clone(&self.devices),
        );
        let connection = ConnectionManager::new(
            self.connection_config.clone(),
            sink,
            Arc::clone(&self.devices),
        );
        connection.set_biometrics(*self.biometrics.lock().expect("biometrics lock poisoned"));

        *runtime = Some(Arc::new(BleRuntime {
            scanner,
            connection,
        }));
        Ok(())
    }

    async fn start_scan(&self) -> Result<()> {
        let runtime = self.runtime().await?;
        runtime.scanner.start_scan().await
    }

    async fn stop_scan(&self) -> Result<()> {
        let runtime = self.runtime().await?;
        runtime.scanner.stop_scan().await
    }

    async fn connect(&self, id: &DeviceId) -> Result<ScaleDevice> {
        let runtime = self.runtime().await?;

        let record = {
            let devices = self.devices.lock().expect("device table lock poisoned");
            devices.get(id).cloned()
        };
        let record = record.ok_or_else(|| ScaleError::UnknownDevice(id.clone()))?;

        // The radio is exclusive: discovery yields to the connection and
        // resumes only on an explicit start_scan.
        runtime.scanner.suspend().await?;

        let peripheral = runtime
            .scanner
            .peripheral_for(id)
            .await
            .ok_or_else(|| ScaleError::UnknownDevice(id.clone()))?;

        runtime.connection.connect(peripheral, record).await
    }

    async fn disconnect(&self) -> Result<()> {
        let runtime = self.runtime().await?;
        runtime.connection.disconnect().await
    }

    async fn discovered_devices(&self) -> Vec<ScaleDevice> {
        let devices = self.devices.lock().expect("device table lock poisoned");
        devices.values().cloned().collect()
    }

    async fn register_paired(&self, device: ScaleDevice) {
        let mut devices = self.devices.lock().expect("device table lock poisoned");
        devices.entry(device.id.clone()).or_insert(device);
    }

    async fn set_biometrics(&self, biometrics: Option<UserBiometrics>) {
        *self.biometrics.lock().expect("biometrics lock poisoned") = biometrics;
        let runtime = self.runtime.lock().await;
        if let Some(runtime) = runtime.as_ref() {
            runtime.connection.set_biometrics(biometrics);
        }
    }

    async fn teardown(&self) -> Result<()> {
        let runtime = {
            let mut runtime = self.runtime.lock().await;
            runtime.take()
        };

        let Some(runtime) = runtime else {
            return Ok(());
        };

        runtime.scanner.stop_scan().await?;
        runtime.connection.disconnect().await?;
        self.devices
            .lock()
            .expect("device table lock poisoned")
            .clear();
        info!("backend torn down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commands_require_initialization() {
        let backend = BleBackend::default();

        assert!(matches!(
            backend.start_scan().await,
            Err(ScaleError::NotInitialized)
        ));
        assert!(matches!(
            backend.connect(&DeviceId::new("AA:BB:CC:DD:EE:FF")).await,
            Err(ScaleError::NotInitialized)
        ));
        // Teardown before initialization is a harmless no-op.
        backend.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_register_paired_keeps_existing_record() {
        let backend = BleBackend::default();
        let id = DeviceId::new("AA:BB:CC:DD:EE:FF");

        let mut known = ScaleDevice::new(
            id.clone(),
            "Bathroom Scale".to_string(),
            crate::types::ProtocolVariant::Impedance,
        );
        known.rssi = Some(-58);
        backend.register_paired(known.clone()).await;

        // A second registration for the same id does not clobber metadata.
        let stale = ScaleDevice::new(
            id.clone(),
            "Old Name".to_string(),
            crate::types::ProtocolVariant::Impedance,
        );
        backend.register_paired(stale).await;

        let devices = backend.discovered_devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "Bathroom Scale");
        assert_eq!(devices[0].rssi, Some(-58));
    }

    #[tokio::test]
    async fn test_biometrics_accepted_before_initialization() {
        let backend = BleBackend::default();
        backend
            .set_biometrics(Some(UserBiometrics {
                sex: crate::types::Sex::Male,
                height_cm: 180.0,
                age_years: 40,
            }))
            .await;
        assert!(backend.biometrics.lock().unwrap().is_some());
    }
}

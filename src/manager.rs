use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{
    backend::{BleBackend, ScaleBackend},
    error::{Result, ScaleError},
    event::{EventBus, EventKind, EventSink, ListenerHandle, ScaleEvent},
    mock::MockDataSource,
    types::{DeviceId, MockConfig, ScaleData, ScaleDevice, UserBiometrics},
};

/// Live state created by `initialize`, discarded by `teardown`
struct Runtime {
    bus: Arc<EventBus>,
    pump: JoinHandle<()>,
}

/// The single entry point consumers use
///
/// Composes the scanner, connection manager, and event bus behind one
/// surface, enforcing the single-flight invariants: one scan session, one
/// connection, and exclusive radio ownership between them. Whether a real
/// adapter or the simulator is behind the facade is a construction-time
/// choice; no call site branches on it.
///
/// # Examples
///
/// ```no_run
/// use bodyscale::{EventKind, ScaleEvent, ScaleManager};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let manager = ScaleManager::new();
///     manager.initialize().await?;
///
///     manager.on(EventKind::WeightData, |event| {
///         if let ScaleEvent::WeightData(data) = event {
///             println!("{:.1} {}", data.weight, data.unit);
///         }
///     })?;
///
///     manager.start_scan().await?;
///     Ok(())
/// }
/// ```
pub struct ScaleManager {
    backend: Arc<dyn ScaleBackend>,
    runtime: StdMutex<Option<Runtime>>,
    latest: Arc<StdRwLock<Option<ScaleData>>>,
}

impl ScaleManager {
    /// Create a manager over the real Bluetooth backend
    #[must_use]
    pub fn new() -> Self {
        Self::with_backend(Arc::new(BleBackend::default()))
    }

    /// Create a manager over the simulated backend
    #[must_use]
    pub fn with_mock(config: MockConfig) -> Self {
        Self::with_backend(Arc::new(MockDataSource::new(config)))
    }

    /// Create a manager over any backend implementation
    #[must_use]
    pub fn with_backend(backend: Arc<dyn ScaleBackend>) -> Self {
        Self {
            backend,
            runtime: StdMutex::new(None),
            latest: Arc::new(StdRwLock::new(None)),
        }
    }

    /// Check capability and bring the subsystem up
    ///
    /// Fails fast with [`ScaleError::CapabilityUnavailable`] when the radio
    /// is absent or permission is denied; there is no silent fallback to
    /// the simulator. Initializing an already-initialized manager is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns the backend's capability error unchanged.
    pub async fn initialize(&self) -> Result<()> {
        {
            let runtime = self.runtime.lock().expect("runtime lock poisoned");
            if runtime.is_some() {
                debug!("already initialized");
                return Ok(());
            }
        }

        let (sink, mut rx) = EventSink::channel();
        self.backend.initialize(sink).await?;

        let bus = Arc::new(EventBus::new());
        let pump_bus = Arc::clone(&bus);
        let latest = Arc::clone(&self.latest);

        // Forward backend events into the bus, caching the newest reading.
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match &event {
                    ScaleEvent::WeightData(data) | ScaleEvent::BodyCompositionData(data) => {
                        *latest.write().expect("latest reading lock poisoned") = Some(data.clone());
                    }
                    _ => {}
                }
                pump_bus.emit(&event);
            }
        });

        let mut runtime = self.runtime.lock().expect("runtime lock poisoned");
        if runtime.is_some() {
            // A concurrent initialize won; keep its pump.
            pump.abort();
            return Ok(());
        }
        *runtime = Some(Runtime { bus, pump });
        info!("scale subsystem initialized");
        Ok(())
    }

    /// Begin passive discovery of nearby scales
    ///
    /// # Errors
    ///
    /// Returns [`ScaleError::NotInitialized`] before `initialize`, or
    /// [`ScaleError::Scan`] when the adapter rejects the scan.
    pub async fn start_scan(&self) -> Result<()> {
        self.ensure_initialized()?;
        self.surface(self.backend.start_scan().await)
    }

    /// Stop discovery; idempotent
    ///
    /// # Errors
    ///
    /// Returns [`ScaleError::NotInitialized`] before `initialize`.
    pub async fn stop_scan(&self) -> Result<()> {
        self.ensure_initialized()?;
        self.surface(self.backend.stop_scan().await)
    }

    /// Open a session to a discovered or registered device
    ///
    /// Scanning is suspended for the duration of the attempt; a second
    /// concurrent connect is rejected with [`ScaleError::Busy`], and a
    /// connect for the already-connected device resolves with the existing
    /// session.
    ///
    /// # Errors
    ///
    /// Returns [`ScaleError::UnknownDevice`] for an id that was neither
    /// discovered nor registered, [`ScaleError::Busy`] for a conflicting
    /// operation, [`ScaleError::Cancelled`] when interrupted by
    /// `disconnect_device`, or [`ScaleError::Connection`] after retries
    /// are exhausted.
    pub async fn connect_to_device(&self, id: &DeviceId) -> Result<ScaleDevice> {
        self.ensure_initialized()?;
        self.surface(self.backend.connect(id).await)
    }

    /// Close the session or cancel an in-flight attempt; idempotent
    ///
    /// # Errors
    ///
    /// Returns [`ScaleError::NotInitialized`] before `initialize`.
    pub async fn disconnect_device(&self) -> Result<()> {
        self.ensure_initialized()?;
        self.surface(self.backend.disconnect().await)
    }

    /// Point-in-time snapshot of known devices, unique by id
    pub async fn discovered_devices(&self) -> Vec<ScaleDevice> {
        self.backend.discovered_devices().await
    }

    /// Most recent decoded reading, if any
    #[must_use]
    pub fn latest_data(&self) -> Option<ScaleData> {
        self.latest
            .read()
            .expect("latest reading lock poisoned")
            .clone()
    }

    /// Seed a previously paired device from the app's persisted descriptor
    ///
    /// Paired devices support direct reconnect by stored id without a
    /// prior scan; the core itself never reads or writes the app's store.
    pub async fn register_paired_device(&self, device: ScaleDevice) {
        self.backend.register_paired(device).await;
    }

    /// Supply or clear the biometrics used for impedance analysis
    pub async fn set_biometrics(&self, biometrics: Option<UserBiometrics>) {
        self.backend.set_biometrics(biometrics).await;
    }

    /// Register a listener for one event kind
    ///
    /// # Errors
    ///
    /// Returns [`ScaleError::NotInitialized`] before `initialize`.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> Result<ListenerHandle>
    where
        F: Fn(&ScaleEvent) + Send + Sync + 'static,
    {
        let runtime = self.runtime.lock().expect("runtime lock poisoned");
        let runtime = runtime.as_ref().ok_or(ScaleError::NotInitialized)?;
        Ok(runtime.bus.on(kind, listener))
    }

    /// Remove a previously registered listener; unknown handles are a no-op
    pub fn remove_listener(&self, handle: ListenerHandle) {
        let runtime = self.runtime.lock().expect("runtime lock poisoned");
        if let Some(runtime) = runtime.as_ref() {
            runtime.bus.remove_listener(handle);
        }
    }

    /// Remove every registered listener
    pub fn remove_all_listeners(&self) {
        let runtime = self.runtime.lock().expect("runtime lock poisoned");
        if let Some(runtime) = runtime.as_ref() {
            runtime.bus.remove_all_listeners();
        }
    }

    /// Stop any scan, disconnect any session, and detach all listeners
    ///
    /// Leaves the subsystem indistinguishable from never having been
    /// initialized; calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns backend teardown failures after local state is cleared.
    pub async fn teardown(&self) -> Result<()> {
        let runtime = {
            let mut runtime = self.runtime.lock().expect("runtime lock poisoned");
            runtime.take()
        };

        let Some(runtime) = runtime else {
            return Ok(());
        };

        let result = self.backend.teardown().await;

        runtime.bus.remove_all_listeners();
        runtime.pump.abort();
        *self.latest.write().expect("latest reading lock poisoned") = None;

        info!("scale subsystem torn down");
        result
    }

    /// Broadcast a terminal error on the bus in addition to returning it
    fn surface<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(error) = &result {
            if error.is_broadcast() {
                let runtime = self.runtime.lock().expect("runtime lock poisoned");
                if let Some(runtime) = runtime.as_ref() {
                    runtime.bus.emit(&ScaleEvent::Error {
                        kind: error.kind(),
                        message: error.to_string(),
                    });
                }
            }
        }
        result
    }

    fn ensure_initialized(&self) -> Result<()> {
        let runtime = self.runtime.lock().expect("runtime lock poisoned");
        if runtime.is_some() {
            Ok(())
        } else {
            Err(ScaleError::NotInitialized)
        }
    }
}

impl Default for ScaleManager {
    fn default() -> Self {
        Self::new()
    }
}

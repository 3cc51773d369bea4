use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex, RwLock as StdRwLock,
    },
    time::{Duration, SystemTime},
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info};

use crate::{
    backend::ScaleBackend,
    connection::wait_cancelled,
    error::{Result, ScaleError},
    event::{EventSink, ScaleEvent},
    protocol,
    scanner::DeviceTable,
    types::{
        ConnectionPhase, DeviceId, MockConfig, MockDevice, ProtocolVariant, ScaleDevice,
        UserBiometrics, WeightUnit,
    },
};

/// Transient state of the simulated session
struct MockSession {
    phase: ConnectionPhase,
    device: Option<ScaleDevice>,
    emitter: Option<JoinHandle<()>>,
    cancel: Option<watch::Sender<bool>>,
}

impl MockSession {
    const fn idle() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            device: None,
            emitter: None,
            cancel: None,
        }
    }
}

/// Drop-in simulated backend for development without hardware
///
/// Implements the same discovery/connection interface as the real
/// scanner/connection pair: synthetic `deviceFound` events shortly after
/// `start_scan`, and, after a simulated connect, periodic measurement
/// frames pushed through the real protocol decoder so the full consumer
/// pipeline is exercised end to end.
pub struct MockDataSource {
    config: MockConfig,
    sink: StdMutex<Option<EventSink>>,
    devices: DeviceTable,
    session: Arc<StdMutex<MockSession>>,
    scan_task: StdMutex<Option<JoinHandle<()>>>,
    biometrics: Arc<StdRwLock<Option<UserBiometrics>>>,
    rejects: Arc<AtomicU64>,
}

impl MockDataSource {
    /// Create a mock serving the configured synthetic devices
    #[must_use]
    pub fn new(config: MockConfig) -> Self {
        Self {
            config,
            sink: StdMutex::new(None),
            devices: Arc::new(StdMutex::new(HashMap::new())),
            session: Arc::new(StdMutex::new(MockSession::idle())),
            scan_task: StdMutex::new(None),
            biometrics: Arc::new(StdRwLock::new(None)),
            rejects: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Frames rejected by the decoder since the mock was created
    #[must_use]
    pub fn protocol_reject_count(&self) -> u64 {
        self.rejects.load(Ordering::Relaxed)
    }

    /// Current lifecycle phase of the simulated session
    #[must_use]
    pub fn phase(&self) -> ConnectionPhase {
        self.session.lock().expect("mock session lock poisoned").phase
    }

    /// Feed a raw characteristic frame through the decode path
    ///
    /// Lets consumers exercise their handling of malformed or unusual
    /// frames. Valid frames produce the same events a real notification
    /// would; invalid frames are discarded and counted, and the session
    /// stays connected. Frames injected while no session is connected are
    /// dropped.
    pub fn inject_frame(&self, frame: &[u8]) {
        let (variant, sink) = {
            let session = self.session.lock().expect("mock session lock poisoned");
            if session.phase != ConnectionPhase::Connected {
                return;
            }
            let Some(device) = session.device.as_ref() else {
                return;
            };
            let sink = self.sink.lock().expect("sink lock poisoned").clone();
            let Some(sink) = sink else { return };
            (device.variant, sink)
        };

        let biometrics = *self.biometrics.read().expect("biometrics lock poisoned");
        match protocol::decode(frame, variant, biometrics.as_ref()) {
            Ok(reading) => {
                if reading.composition.is_some() {
                    sink.send(ScaleEvent::BodyCompositionData(reading));
                } else {
                    sink.send(ScaleEvent::WeightData(reading));
                }
            }
            Err(e) => {
                self.rejects.fetch_add(1, Ordering::Relaxed);
                debug!("discarded injected frame: {e}");
            }
        }
    }

    fn sink(&self) -> Result<EventSink> {
        self.sink
            .lock()
            .expect("sink lock poisoned")
            .clone()
            .ok_or(ScaleError::NotInitialized)
    }

    fn device_record(&self, id: &DeviceId) -> Option<ScaleDevice> {
        let devices = self.devices.lock().expect("device table lock poisoned");
        devices.get(id).cloned()
    }

    /// Produce measurement frames on the configured cadence until cancelled
    fn spawn_emitter(
        &self,
        mock: MockDevice,
        sink: EventSink,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let interval = Duration::from_millis(self.config.measurement_interval_ms);
        let settle_after = self.config.frames_until_stabilized;
        let biometrics = Arc::clone(&self.biometrics);
        let rejects = Arc::clone(&self.rejects);

        tokio::spawn(async move {
            let mut tick: u32 = 0;
            loop {
                tokio::select! {
                    () = wait_cancelled(&mut cancel_rx) => break,
                    () = tokio::time::sleep(interval) => {}
                }

                let frame = synthesize_frame(&mock, tick, settle_after);
                let biometrics = *biometrics.read().expect("biometrics lock poisoned");
                match protocol::decode(&frame, mock.variant, biometrics.as_ref()) {
                    Ok(reading) => {
                        if reading.composition.is_some() {
                            sink.send(ScaleEvent::BodyCompositionData(reading));
                        } else {
                            sink.send(ScaleEvent::WeightData(reading));
                        }
                    }
                    Err(e) => {
                        rejects.fetch_add(1, Ordering::Relaxed);
                        debug!("discarded synthetic frame: {e}");
                    }
                }

                tick = tick.wrapping_add(1);
            }
        })
    }
}

impl Default for MockDataSource {
    fn default() -> Self {
        Self::new(MockConfig::default())
    }
}

/// One frame of the simulated measurement cycle
///
/// A cycle mimics a weigh-in: a few transient readings while the user
/// settles, one stabilized weight broadcast, and, for impedance-capable
/// devices, the post-stabilization impedance broadcast.
fn synthesize_frame(mock: &MockDevice, tick: u32, settle_after: u32) -> Vec<u8> {
    let cycle_len = settle_after + 2;
    let position = tick % cycle_len;

    if position < settle_after {
        // Transient readings wobble around the settled value.
        let wobble = (position % 3) as u16;
        return match mock.variant {
            ProtocolVariant::Standard => protocol::encode_weight_frame(
                mock.weight_tenths + wobble,
                WeightUnit::Kilograms,
                false,
            ),
            ProtocolVariant::Impedance => protocol::encode_impedance_frame(
                mock.weight_tenths + wobble,
                WeightUnit::Kilograms,
                false,
                0,
            ),
        };
    }

    if position == settle_after {
        return match mock.variant {
            ProtocolVariant::Standard => {
                protocol::encode_weight_frame(mock.weight_tenths, WeightUnit::Kilograms, true)
            }
            ProtocolVariant::Impedance => protocol::encode_impedance_frame(
                mock.weight_tenths,
                WeightUnit::Kilograms,
                true,
                0,
            ),
        };
    }

    match mock.variant {
        ProtocolVariant::Standard => {
            protocol::encode_weight_frame(mock.weight_tenths, WeightUnit::Kilograms, true)
        }
        ProtocolVariant::Impedance => protocol::encode_impedance_frame(
            mock.weight_tenths,
            WeightUnit::Kilograms,
            true,
            mock.impedance_ohms,
        ),
    }
}

#[async_trait]
impl ScaleBackend for MockDataSource {
    async fn initialize(&self, sink: EventSink) -> Result<()> {
        let mut slot = self.sink.lock().expect("sink lock poisoned");
        if slot.is_none() {
            *slot = Some(sink);
            info!("mock data source initialized");
        }
        Ok(())
    }

    async fn start_scan(&self) -> Result<()> {
        let sink = self.sink()?;

        {
            let scan_task = self.scan_task.lock().expect("scan task lock poisoned");
            if scan_task.as_ref().is_some_and(|task| !task.is_finished()) {
                debug!("mock scan already in progress");
                return Ok(());
            }
        }

        let delay = Duration::from_millis(self.config.discovery_delay_ms);
        let announced = self.config.devices.clone();
        let devices = Arc::clone(&self.devices);

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for mock in announced {
                let mut record =
                    ScaleDevice::new(mock.id.clone(), mock.name.clone(), mock.variant);
                record.rssi = Some(-60);
                {
                    let mut devices = devices.lock().expect("device table lock poisoned");
                    devices.entry(mock.id.clone()).or_insert_with(|| record.clone());
                }
                sink.send(ScaleEvent::DeviceFound(record));
            }
        });

        *self.scan_task.lock().expect("scan task lock poisoned") = Some(task);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        let task = self.scan_task.lock().expect("scan task lock poisoned").take();
        if let Some(task) = task {
            task.abort();
        }
        Ok(())
    }

    async fn connect(&self, id: &DeviceId) -> Result<ScaleDevice> {
        let sink = self.sink()?;

        let (mock, mut cancel_rx) = {
            let mut session = self.session.lock().expect("mock session lock poisoned");
            match session.phase {
                ConnectionPhase::Connected => {
                    if session.device.as_ref().map(|d| &d.id) == Some(id) {
                        return Ok(session.device.clone().expect("connected without device"));
                    }
                    return Err(ScaleError::Busy("another connection"));
                }
                ConnectionPhase::Connecting => {
                    return Err(ScaleError::Busy("a connection attempt"))
                }
                ConnectionPhase::Disconnecting => return Err(ScaleError::Busy("a disconnect")),
                ConnectionPhase::Disconnected => {}
            }

            let mock = self
                .config
                .devices
                .iter()
                .find(|d| &d.id == id)
                .cloned()
                .ok_or_else(|| ScaleError::UnknownDevice(id.clone()))?;

            let (cancel_tx, cancel_rx) = watch::channel(false);
            session.phase = ConnectionPhase::Connecting;
            session.cancel = Some(cancel_tx);
            (mock, cancel_rx)
        };

        // Simulated link negotiation, cancellable by disconnect.
        let delay = Duration::from_millis(self.config.connect_delay_ms);
        tokio::select! {
            () = wait_cancelled(&mut cancel_rx) => return Err(ScaleError::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }

        let mut device = self
            .device_record(id)
            .unwrap_or_else(|| ScaleDevice::new(mock.id.clone(), mock.name.clone(), mock.variant));
        device.connected = true;
        device.last_connected = Some(SystemTime::now());

        {
            let mut session = self.session.lock().expect("mock session lock poisoned");
            if session.phase != ConnectionPhase::Connecting {
                return Err(ScaleError::Cancelled);
            }
            session.phase = ConnectionPhase::Connected;
            session.device = Some(device.clone());
            let emitter = self.spawn_emitter(mock, sink.clone(), cancel_rx);
            session.emitter = Some(emitter);
        }

        {
            let mut devices = self.devices.lock().expect("device table lock poisoned");
            devices.insert(device.id.clone(), device.clone());
        }

        info!(device = %device.id, "mock connected");
        sink.send(ScaleEvent::Connected(device.clone()));
        Ok(device)
    }

    async fn disconnect(&self) -> Result<()> {
        let (device, emitter) = {
            let mut session = self.session.lock().expect("mock session lock poisoned");
            match session.phase {
                ConnectionPhase::Disconnected | ConnectionPhase::Disconnecting => return Ok(()),
                ConnectionPhase::Connecting | ConnectionPhase::Connected => {
                    if let Some(cancel) = session.cancel.take() {
                        let _ = cancel.send(true);
                    }
                    let device = session.device.take();
                    let emitter = session.emitter.take();
                    *session = MockSession::idle();
                    (device, emitter)
                }
            }
        };

        if let Some(emitter) = emitter {
            emitter.abort();
        }

        if let Some(mut device) = device {
            device.connected = false;
            {
                let mut devices = self.devices.lock().expect("device table lock poisoned");
                if let Some(record) = devices.get_mut(&device.id) {
                    record.connected = false;
                }
            }
            info!(device = %device.id, "mock disconnected");
            if let Ok(sink) = self.sink() {
                sink.send(ScaleEvent::Disconnected(device));
            }
        }

        Ok(())
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
        *self.biometrics.write().expect("biometrics lock poisoned") = biometrics;
    }

    async fn teardown(&self) -> Result<()> {
        self.stop_scan().await?;
        self.disconnect().await?;
        self.devices
            .lock()
            .expect("device table lock poisoned")
            .clear();
        self.sink.lock().expect("sink lock poisoned").take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventSink;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn initialized_mock() -> (MockDataSource, UnboundedReceiver<ScaleEvent>) {
        let config = MockConfig {
            discovery_delay_ms: 5,
            connect_delay_ms: 10,
            measurement_interval_ms: 10,
            ..MockConfig::default()
        };
        let mock = MockDataSource::new(config);
        let (sink, rx) = EventSink::channel();
        mock.initialize(sink).await.unwrap();
        (mock, rx)
    }

    fn first_device_id(mock: &MockDataSource) -> DeviceId {
        mock.config.devices[0].id.clone()
    }

    #[tokio::test]
    async fn test_scan_announces_each_device_once() {
        let (mock, mut rx) = initialized_mock().await;
        mock.start_scan().await.unwrap();

        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(ScaleEvent::DeviceFound(device))) => {
                assert_eq!(device.id, first_device_id(&mock));
            }
            other => panic!("expected DeviceFound, got {other:?}"),
        }

        let snapshot = mock.discovered_devices().await;
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_unknown_id_fails_fast() {
        let (mock, _rx) = initialized_mock().await;
        let err = mock
            .connect(&DeviceId::new("00:00:00:00:00:00"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScaleError::UnknownDevice(_)));
    }

    #[tokio::test]
    async fn test_connect_emits_measurements() {
        let (mock, mut rx) = initialized_mock().await;
        let id = first_device_id(&mock);

        mock.connect(&id).await.unwrap();
        assert_eq!(mock.phase(), ConnectionPhase::Connected);

        let mut saw_weight = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
                Ok(Some(ScaleEvent::WeightData(data))) => {
                    assert!(data.weight > 0.0);
                    saw_weight = true;
                    break;
                }
                Ok(Some(_)) => {}
                _ => break,
            }
        }
        assert!(saw_weight, "expected at least one weight event");
    }

    #[tokio::test]
    async fn test_malformed_injection_keeps_session_alive() {
        let (mock, mut rx) = initialized_mock().await;
        let id = first_device_id(&mock);
        mock.connect(&id).await.unwrap();

        // Drain the Connected event.
        let _ = rx.recv().await;

        let mut bad = protocol::encode_impedance_frame(700, WeightUnit::Kilograms, true, 500);
        *bad.last_mut().unwrap() ^= 0xFF;
        mock.inject_frame(&bad);

        assert_eq!(mock.protocol_reject_count(), 1);
        assert_eq!(mock.phase(), ConnectionPhase::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_connect() {
        let config = MockConfig {
            discovery_delay_ms: 5,
            connect_delay_ms: 5_000,
            ..MockConfig::default()
        };
        let mock = Arc::new(MockDataSource::new(config));
        let (sink, _rx) = EventSink::channel();
        mock.initialize(sink).await.unwrap();

        let id = first_device_id(&mock);
        let connecting = {
            let mock = Arc::clone(&mock);
            tokio::spawn(async move { mock.connect(&id).await })
        };

        // Give the connect a moment to enter the simulated negotiation.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mock.phase(), ConnectionPhase::Connecting);

        mock.disconnect().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), connecting)
            .await
            .expect("cancelled connect must resolve promptly")
            .unwrap();
        assert!(matches!(result, Err(ScaleError::Cancelled)));
        assert_eq!(mock.phase(), ConnectionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_teardown_clears_state() {
        let (mock, _rx) = initialized_mock().await;
        mock.start_scan().await.unwrap();
        mock.teardown().await.unwrap();

        assert!(mock.discovered_devices().await.is_empty());
        assert!(matches!(
            mock.start_scan().await,
            Err(ScaleError::NotInitialized)
        ));
    }
}

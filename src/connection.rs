use btleplug::{
    api::{Characteristic, Peripheral as _},
    platform::Peripheral,
};
use futures::stream::StreamExt;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex, RwLock as StdRwLock,
    },
    time::{Duration, SystemTime},
};
use tokio::{sync::watch, task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, ScaleError},
    event::{EventSink, ScaleEvent},
    protocol,
    scanner::DeviceTable,
    types::{ConnectionConfig, ConnectionPhase, ProtocolVariant, ScaleDevice, UserBiometrics},
    BODY_COMPOSITION_MEASUREMENT_CHAR_UUID, WEIGHT_MEASUREMENT_CHAR_UUID,
};

/// Transient state of the single managed session
struct Session {
    phase: ConnectionPhase,
    device: Option<ScaleDevice>,
    peripheral: Option<Peripheral>,
    subscribed: Vec<Characteristic>,
    notify_task: Option<JoinHandle<()>>,
    cancel: Option<watch::Sender<bool>>,
}

impl Session {
    const fn idle() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            device: None,
            peripheral: None,
            subscribed: Vec::new(),
            notify_task: None,
            cancel: None,
        }
    }
}

/// Owns the single active wireless link
///
/// State machine per managed device: `Disconnected → Connecting →
/// Connected → Disconnecting → Disconnected`, with an error edge back to
/// `Disconnected` on failure, timeout, or unexpected link loss. At most
/// one session exists app-wide; a conflicting `connect` is rejected
/// synchronously with [`ScaleError::Busy`], never queued.
pub struct ConnectionManager {
    config: ConnectionConfig,
    sink: EventSink,
    devices: DeviceTable,
    biometrics: Arc<StdRwLock<Option<UserBiometrics>>>,
    session: Arc<StdMutex<Session>>,
    rejects: Arc<AtomicU64>,
}

impl ConnectionManager {
    /// Create a manager with no active session
    pub(crate) fn new(config: ConnectionConfig, sink: EventSink, devices: DeviceTable) -> Self {
        Self {
            config,
            sink,
            devices,
            biometrics: Arc::new(StdRwLock::new(None)),
            session: Arc::new(StdMutex::new(Session::idle())),
            rejects: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current lifecycle phase of the session
    #[must_use]
    pub fn phase(&self) -> ConnectionPhase {
        self.session.lock().expect("session lock poisoned").phase
    }

    /// The device behind the current session, if any
    #[must_use]
    pub fn session_device(&self) -> Option<ScaleDevice> {
        self.session
            .lock()
            .expect("session lock poisoned")
            .device
            .clone()
    }

    /// Frames discarded by the decoder since the manager was created
    ///
    /// Malformed frames are recovered locally: the frame is dropped, the
    /// count incremented, and the session continues.
    #[must_use]
    pub fn protocol_reject_count(&self) -> u64 {
        self.rejects.load(Ordering::Relaxed)
    }

    /// Supply or clear the biometrics used for impedance analysis
    pub fn set_biometrics(&self, biometrics: Option<UserBiometrics>) {
        *self.biometrics.write().expect("biometrics lock poisoned") = biometrics;
    }

    /// Open a session to the device
    ///
    /// A connect call for the device already connected is a no-op that
    /// resolves with the existing session. Transient failures (link
    /// negotiation timeout, subscription failure) are retried with
    /// exponential backoff before a terminal error is surfaced; partially
    /// opened resources are released before every retry.
    ///
    /// # Errors
    ///
    /// Returns [`ScaleError::Busy`] when another session is in progress,
    /// [`ScaleError::Cancelled`] when `disconnect` interrupts the attempt,
    /// or [`ScaleError::Connection`] after retries are exhausted.
    pub async fn connect(
        &self,
        peripheral: Peripheral,
        mut device: ScaleDevice,
    ) -> Result<ScaleDevice> {
        let mut cancel_rx = {
            let mut session = self.session.lock().expect("session lock poisoned");
            match session.phase {
                ConnectionPhase::Connected => {
                    if session.device.as_ref().map(|d| &d.id) == Some(&device.id) {
                        debug!(device = %device.id, "already connected, reusing session");
                        return Ok(session.device.clone().unwrap_or(device));
                    }
                    return Err(ScaleError::Busy("another connection"));
                }
                ConnectionPhase::Connecting => return Err(ScaleError::Busy("a connection attempt")),
                ConnectionPhase::Disconnecting => return Err(ScaleError::Busy("a disconnect")),
                ConnectionPhase::Disconnected => {}
            }

            let (cancel_tx, cancel_rx) = watch::channel(false);
            session.phase = ConnectionPhase::Connecting;
            session.device = Some(device.clone());
            session.cancel = Some(cancel_tx);
            cancel_rx
        };

        info!(device = %device.id, "connecting");

        for attempt in 0..self.config.max_attempts {
            let established = tokio::select! {
                () = wait_cancelled(&mut cancel_rx) => {
                    // Release anything the dropped attempt left half-open.
                    let _ = peripheral.disconnect().await;
                    return Err(ScaleError::Cancelled);
                }
                result = self.establish(&peripheral, device.variant) => result,
            };

            match established {
                Ok(subscribed) => {
                    device.connected = true;
                    device.last_connected = Some(SystemTime::now());

                    let raced = {
                        let mut session = self.session.lock().expect("session lock poisoned");
                        if session.phase == ConnectionPhase::Connecting {
                            session.phase = ConnectionPhase::Connected;
                            session.device = Some(device.clone());
                            session.peripheral = Some(peripheral.clone());
                            session.subscribed.clone_from(&subscribed);
                            false
                        } else {
                            true
                        }
                    };

                    if raced {
                        // A disconnect won the race while we were linking.
                        release_link(&peripheral, &subscribed).await;
                        return Err(ScaleError::Cancelled);
                    }

                    self.spawn_notification_task(&peripheral, device.variant);
                    self.update_table(&device);

                    info!(device = %device.id, "connected");
                    self.sink.send(ScaleEvent::Connected(device.clone()));
                    return Ok(device);
                }
                Err(reason) => {
                    warn!(
                        device = %device.id,
                        attempt = attempt + 1,
                        max = self.config.max_attempts,
                        "connection attempt failed: {reason}"
                    );
                    let _ = peripheral.disconnect().await;

                    if attempt + 1 == self.config.max_attempts {
                        self.reset_to_disconnected();
                        return Err(ScaleError::Connection {
                            reason,
                            attempts: self.config.max_attempts,
                        });
                    }

                    let delay = Duration::from_millis(self.config.backoff_delay_ms(attempt));
                    tokio::select! {
                        () = wait_cancelled(&mut cancel_rx) => {
                            return Err(ScaleError::Cancelled);
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.reset_to_disconnected();
        Err(ScaleError::Connection {
            reason: "no connection attempts configured".to_string(),
            attempts: 0,
        })
    }

    /// Close the session, or cancel the in-flight attempt
    ///
    /// Idempotent: disconnecting while already disconnected succeeds
    /// trivially. While connected, characteristics are unsubscribed before
    /// the physical link is released so no orphaned subscription survives
    /// the session. A pending connect attempt, including one sleeping in
    /// backoff, is cancelled promptly and never later reports `Connected`.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` mirrors the rest of the command
    /// surface.
    pub async fn disconnect(&self) -> Result<()> {
        let (peripheral, subscribed, notify_task, device) = {
            let mut session = self.session.lock().expect("session lock poisoned");
            match session.phase {
                ConnectionPhase::Disconnected | ConnectionPhase::Disconnecting => return Ok(()),
                ConnectionPhase::Connecting => {
                    if let Some(cancel) = session.cancel.take() {
                        let _ = cancel.send(true);
                    }
                    let device = session.device.take();
                    *session = Session::idle();
                    drop(session);

                    if let Some(device) = device {
                        self.mark_disconnected(&device);
                    }
                    return Ok(());
                }
                ConnectionPhase::Connected => {
                    session.phase = ConnectionPhase::Disconnecting;
                    (
                        session.peripheral.take(),
                        std::mem::take(&mut session.subscribed),
                        session.notify_task.take(),
                        session.device.take(),
                    )
                }
            }
        };

        if let Some(task) = notify_task {
            task.abort();
        }
        if let Some(peripheral) = peripheral {
            release_link(&peripheral, &subscribed).await;
        }

        {
            let mut session = self.session.lock().expect("session lock poisoned");
            *session = Session::idle();
        }

        if let Some(device) = device {
            info!(device = %device.id, "disconnected");
            self.mark_disconnected(&device);
        }

        Ok(())
    }

    /// Negotiate the link and subscribe to the measurement characteristics
    async fn establish(
        &self,
        peripheral: &Peripheral,
        variant: ProtocolVariant,
    ) -> std::result::Result<Vec<Characteristic>, String> {
        let attempt_timeout = Duration::from_millis(self.config.attempt_timeout_ms);
        timeout(attempt_timeout, peripheral.connect())
            .await
            .map_err(|_| {
                format!(
                    "link negotiation timed out after {}ms",
                    self.config.attempt_timeout_ms
                )
            })?
            .map_err(|e| format!("link negotiation failed: {e}"))?;

        peripheral
            .discover_services()
            .await
            .map_err(|e| format!("service discovery failed: {e}"))?;

        let weight_uuid = parse_uuid(WEIGHT_MEASUREMENT_CHAR_UUID)?;
        let composition_uuid = parse_uuid(BODY_COMPOSITION_MEASUREMENT_CHAR_UUID)?;

        let characteristics = peripheral.characteristics();
        let mut subscribed = Vec::new();

        let weight_char = characteristics
            .iter()
            .find(|c| c.uuid == weight_uuid)
            .cloned()
            .ok_or_else(|| "weight characteristic not found".to_string())?;
        peripheral
            .subscribe(&weight_char)
            .await
            .map_err(|e| format!("weight subscription failed: {e}"))?;
        subscribed.push(weight_char);

        if variant == ProtocolVariant::Impedance {
            let composition_char = characteristics
                .iter()
                .find(|c| c.uuid == composition_uuid)
                .cloned()
                .ok_or_else(|| "body composition characteristic not found".to_string())?;
            peripheral
                .subscribe(&composition_char)
                .await
                .map_err(|e| format!("body composition subscription failed: {e}"))?;
            subscribed.push(composition_char);
        }

        Ok(subscribed)
    }

    /// Forward decoded notification frames until the link drops
    fn spawn_notification_task(&self, peripheral: &Peripheral, variant: ProtocolVariant) {
        let peripheral = peripheral.clone();
        let sink = self.sink.clone();
        let session = Arc::clone(&self.session);
        let devices = Arc::clone(&self.devices);
        let biometrics = Arc::clone(&self.biometrics);
        let rejects = Arc::clone(&self.rejects);

        let task = tokio::spawn(async move {
            let mut stream = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("failed to open notification stream: {e}");
                    return;
                }
            };

            while let Some(notification) = stream.next().await {
                let biometrics = *biometrics.read().expect("biometrics lock poisoned");
                match protocol::decode(&notification.value, variant, biometrics.as_ref()) {
                    Ok(reading) => {
                        if reading.composition.is_some() {
                            sink.send(ScaleEvent::BodyCompositionData(reading));
                        } else {
                            sink.send(ScaleEvent::WeightData(reading));
                        }
                    }
                    Err(e) => {
                        // Noise, not a session failure: drop the frame and
                        // keep listening.
                        rejects.fetch_add(1, Ordering::Relaxed);
                        debug!(uuid = %notification.uuid, "discarded frame: {e}");
                    }
                }
            }

            // Stream end without an orderly disconnect is link loss.
            let device = {
                let mut session = session.lock().expect("session lock poisoned");
                if session.phase == ConnectionPhase::Connected {
                    let device = session.device.take();
                    *session = Session::idle();
                    device
                } else {
                    None
                }
            };

            if let Some(mut device) = device {
                warn!(device = %device.id, "link lost");
                device.connected = false;
                if let Ok(mut table) = devices.lock() {
                    if let Some(record) = table.get_mut(&device.id) {
                        record.connected = false;
                    }
                }
                sink.send(ScaleEvent::Disconnected(device));
            }
        });

        let mut session = self.session.lock().expect("session lock poisoned");
        session.notify_task = Some(task);
    }

    /// Record a connected device in the shared table
    fn update_table(&self, device: &ScaleDevice) {
        let mut table = self.devices.lock().expect("device table lock poisoned");
        table.insert(device.id.clone(), device.clone());
    }

    /// Flip the table record to disconnected and announce it
    fn mark_disconnected(&self, device: &ScaleDevice) {
        let mut device = device.clone();
        device.connected = false;
        {
            let mut table = self.devices.lock().expect("device table lock poisoned");
            if let Some(record) = table.get_mut(&device.id) {
                record.connected = false;
            }
        }
        self.sink.send(ScaleEvent::Disconnected(device));
    }

    /// Drop back to the idle state after a terminal failure
    fn reset_to_disconnected(&self) {
        let mut session = self.session.lock().expect("session lock poisoned");
        *session = Session::idle();
    }
}

/// Unsubscribe from every characteristic, then release the link
///
/// Runs on both the orderly and the cancelled paths so no partially
/// opened resource outlives the attempt.
async fn release_link(peripheral: &Peripheral, subscribed: &[Characteristic]) {
    for characteristic in subscribed {
        if let Err(e) = peripheral.unsubscribe(characteristic).await {
            debug!(uuid = %characteristic.uuid, "unsubscribe failed: {e}");
        }
    }
    if let Err(e) = peripheral.disconnect().await {
        debug!("link release failed: {e}");
    }
}

/// Wait until the cancel flag is raised
pub(crate) async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            // Sender dropped without cancelling; park forever so the
            // sibling select arm decides the outcome.
            std::future::pending::<()>().await;
        }
    }
}

fn parse_uuid(uuid: &str) -> std::result::Result<Uuid, String> {
    Uuid::parse_str(uuid).map_err(|e| format!("invalid characteristic UUID: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventSink;
    use crate::types::DeviceId;
    use std::collections::HashMap;

    fn manager() -> ConnectionManager {
        let (sink, _rx) = EventSink::channel();
        ConnectionManager::new(
            ConnectionConfig::default(),
            sink,
            Arc::new(StdMutex::new(HashMap::new())),
        )
    }

    #[test]
    fn test_initial_phase_is_disconnected() {
        let manager = manager();
        assert_eq!(manager.phase(), ConnectionPhase::Disconnected);
        assert!(manager.session_device().is_none());
        assert_eq!(manager.protocol_reject_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_when_idle() {
        let manager = manager();
        manager.disconnect().await.unwrap();
        manager.disconnect().await.unwrap();
        assert_eq!(manager.phase(), ConnectionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_cancel_flag_wakes_waiter() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move {
            wait_cancelled(&mut rx).await;
        });

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancel should resolve the waiter")
            .unwrap();
    }

    #[test]
    fn test_biometrics_round_trip() {
        let manager = manager();
        manager.set_biometrics(Some(UserBiometrics {
            sex: crate::types::Sex::Female,
            height_cm: 170.0,
            age_years: 28,
        }));
        assert!(manager
            .biometrics
            .read()
            .unwrap()
            .is_some());

        manager.set_biometrics(None);
        assert!(manager.biometrics.read().unwrap().is_none());
    }

    #[test]
    fn test_table_marking() {
        let (sink, _rx) = EventSink::channel();
        let table: DeviceTable = Arc::new(StdMutex::new(HashMap::new()));
        let manager = ConnectionManager::new(ConnectionConfig::default(), sink, Arc::clone(&table));

        let mut device = ScaleDevice::new(
            DeviceId::new("AA:BB:CC:DD:EE:FF"),
            "Scale".to_string(),
            ProtocolVariant::Standard,
        );
        device.connected = true;
        manager.update_table(&device);
        assert!(table.lock().unwrap()[&device.id].connected);

        manager.mark_disconnected(&device);
        assert!(!table.lock().unwrap()[&device.id].connected);
    }
}

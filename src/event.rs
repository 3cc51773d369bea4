use crate::{
    error::ErrorKind,
    types::{ScaleData, ScaleDevice},
};
use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::mpsc;
use tracing::warn;

/// Typed event announced by the subsystem
#[derive(Debug, Clone)]
pub enum ScaleEvent {
    /// A new scale was discovered during a scan session
    DeviceFound(ScaleDevice),
    /// A session to the device was established
    Connected(ScaleDevice),
    /// The session to the device ended, orderly or not
    Disconnected(ScaleDevice),
    /// A weight-only reading was decoded
    WeightData(ScaleData),
    /// A reading carrying extended body-composition fields was decoded
    BodyCompositionData(ScaleData),
    /// A terminal error was surfaced
    Error {
        /// Error category
        kind: ErrorKind,
        /// Human-readable description
        message: String,
    },
}

/// Discriminant of a [`ScaleEvent`], used for subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// New device discovered
    DeviceFound,
    /// Session established
    Connected,
    /// Session ended
    Disconnected,
    /// Weight reading decoded
    WeightData,
    /// Extended reading decoded
    BodyCompositionData,
    /// Terminal error surfaced
    Error,
}

impl ScaleEvent {
    /// The subscription kind this event dispatches under
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::DeviceFound(_) => EventKind::DeviceFound,
            Self::Connected(_) => EventKind::Connected,
            Self::Disconnected(_) => EventKind::Disconnected,
            Self::WeightData(_) => EventKind::WeightData,
            Self::BodyCompositionData(_) => EventKind::BodyCompositionData,
            Self::Error { .. } => EventKind::Error,
        }
    }
}

/// Handle returned by [`EventBus::on`], used to remove the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle {
    kind: EventKind,
    id: u64,
}

type Listener = Arc<dyn Fn(&ScaleEvent) + Send + Sync>;

/// Typed publish/subscribe dispatcher
///
/// Dispatch is synchronous and in registration order per event kind. A
/// listener that panics is isolated: the panic is caught and logged, and
/// the remaining listeners still receive the event.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<EventKind, Vec<(u64, Listener)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one event kind
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerHandle
    where
        F: Fn(&ScaleEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.listeners.lock().expect("listener table poisoned");
        listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        ListenerHandle { kind, id }
    }

    /// Remove a previously registered listener
    ///
    /// Removing a listener that is not currently registered is a no-op.
    pub fn remove_listener(&self, handle: ListenerHandle) {
        let mut listeners = self.listeners.lock().expect("listener table poisoned");
        if let Some(registered) = listeners.get_mut(&handle.kind) {
            registered.retain(|(id, _)| *id != handle.id);
        }
    }

    /// Remove every registered listener
    pub fn remove_all_listeners(&self) {
        self.listeners
            .lock()
            .expect("listener table poisoned")
            .clear();
    }

    /// Number of listeners currently registered across all kinds
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .expect("listener table poisoned")
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Dispatch an event to its subscribers, in registration order
    pub fn emit(&self, event: &ScaleEvent) {
        // Snapshot outside the lock so listeners may re-enter the bus.
        let snapshot: Vec<Listener> = {
            let listeners = self.listeners.lock().expect("listener table poisoned");
            listeners
                .get(&event.kind())
                .map(|registered| registered.iter().map(|(_, l)| Arc::clone(l)).collect())
                .unwrap_or_default()
        };

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(kind = ?event.kind(), "event listener panicked, continuing dispatch");
            }
        }
    }
}

/// Clonable sender half handed to backends
///
/// Backends announce state changes through the sink; the facade pumps the
/// receiving half into its [`EventBus`]. Sending after the facade is torn
/// down is a silent no-op.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ScaleEvent>,
}

impl EventSink {
    /// Create a sink/receiver pair
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ScaleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Announce an event
    pub fn send(&self, event: ScaleEvent) {
        let _ = self.tx.send(event);
    }

    /// Announce a terminal error
    pub fn error(&self, kind: ErrorKind, message: impl Into<String>) {
        self.send(ScaleEvent::Error {
            kind,
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceId, ProtocolVariant, ScaleDevice, WeightUnit};
    use std::sync::atomic::AtomicUsize;

    fn device() -> ScaleDevice {
        ScaleDevice::new(
            DeviceId::new("AA:BB:CC:DD:EE:FF"),
            "Test Scale".to_string(),
            ProtocolVariant::Standard,
        )
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.on(EventKind::DeviceFound, move |_| {
                order.lock().unwrap().push(tag);
            });
        }

        bus.emit(&ScaleEvent::DeviceFound(device()));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_listeners_filtered_by_kind() {
        let bus = EventBus::new();
        let weight_hits = Arc::new(AtomicUsize::new(0));

        let hits = Arc::clone(&weight_hits);
        bus.on(EventKind::WeightData, move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&ScaleEvent::DeviceFound(device()));
        assert_eq!(weight_hits.load(Ordering::SeqCst), 0);

        let data = crate::types::ScaleData::weight_only(70.0, WeightUnit::Kilograms, true);
        bus.emit(&ScaleEvent::WeightData(data));
        assert_eq!(weight_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_listener_and_redundant_removal() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let handle = bus.on(EventKind::Connected, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.remove_listener(handle);
        // Removing again is a no-op, not an error.
        bus.remove_listener(handle);

        bus.emit(&ScaleEvent::Connected(device()));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.on(EventKind::DeviceFound, |_| panic!("listener bug"));
        let counter = Arc::clone(&hits);
        bus.on(EventKind::DeviceFound, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&ScaleEvent::DeviceFound(device()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_all_listeners() {
        let bus = EventBus::new();
        bus.on(EventKind::DeviceFound, |_| {});
        bus.on(EventKind::Error, |_| {});
        assert_eq!(bus.listener_count(), 2);

        bus.remove_all_listeners();
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_sink_forwards_events() {
        let (sink, mut rx) = EventSink::channel();
        sink.send(ScaleEvent::DeviceFound(device()));
        sink.error(ErrorKind::Scan, "adapter busy");

        assert!(matches!(
            rx.recv().await,
            Some(ScaleEvent::DeviceFound(_))
        ));
        match rx.recv().await {
            Some(ScaleEvent::Error { kind, message }) => {
                assert_eq!(kind, ErrorKind::Scan);
                assert_eq!(message, "adapter busy");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

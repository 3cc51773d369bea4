#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Bodyscale ⚖️
//!
//! A Rust library for integrating Bluetooth Low Energy body-composition
//! scales.
//!
//! This library discovers nearby smart scales, manages their connection
//! lifecycle, decodes vendor-specific binary measurement frames into
//! structured readings, and republishes those readings as typed events.
//! It tolerates unreliable wireless links, rejects untrusted binary
//! payloads without crashing, and exposes a single coherent API whether a
//! real device or a simulated one is behind it.
//!
//! ## Design
//!
//! - **One facade**: [`ScaleManager`] is the only entry point consumers
//!   use. It owns the event bus, serializes commands, and enforces the
//!   single-flight invariants (one scan, one connection, exclusive radio
//!   ownership between them).
//! - **Construction-time backend choice**: the real scanner/connection
//!   pair and [`MockDataSource`] implement the same [`ScaleBackend`]
//!   interface. Pick one when building the manager; no call site branches
//!   on which is active, and a missing radio is a hard
//!   [`ScaleError::CapabilityUnavailable`], never a silent mock fallback.
//! - **Pure decoding**: frame decoding is side-effect free and validates
//!   length and checksum before interpreting a single field. Malformed
//!   frames are dropped and counted, not surfaced as session errors.
//!
//! ## Quick Start
//!
//! ```no_run
//! use bodyscale::{EventKind, ScaleEvent, ScaleManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ScaleManager::new();
//!     manager.initialize().await?;
//!
//!     manager.on(EventKind::WeightData, |event| {
//!         if let ScaleEvent::WeightData(data) = event {
//!             println!("weight: {:.1} {}", data.weight, data.unit);
//!         }
//!     })?;
//!
//!     manager.start_scan().await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(15)).await;
//!
//!     if let Some(device) = manager.discovered_devices().await.first() {
//!         manager.connect_to_device(&device.id).await?;
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Development without hardware
//!
//! Construct the manager with [`ScaleManager::with_mock`] to drive the
//! full pipeline — discovery, connection, frame decoding, events — from
//! synthesized data.

/// Backend seam shared by the real adapter pair and the simulator
pub mod backend;
/// Connection lifecycle and notification decoding
pub mod connection;
/// Error types and handling
pub mod error;
/// Typed event bus
pub mod event;
/// Simulated data source for development without hardware
pub mod mock;
/// Integration facade
pub mod manager;
/// Frame decoding and vendor protocol variants
pub mod protocol;
/// Device discovery
pub mod scanner;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use backend::{BleBackend, ScaleBackend};
pub use error::{ErrorKind, ProtocolError, Result, ScaleError};
pub use event::{EventKind, ListenerHandle, ScaleEvent};
pub use manager::ScaleManager;
pub use mock::MockDataSource;
pub use types::{
    BodyComposition, ConnectionConfig, ConnectionPhase, DeviceId, MockConfig, MockDevice,
    ProtocolVariant, ScaleData, ScaleDevice, ScanConfig, Sex, UserBiometrics, WeightUnit,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Weight Scale service UUID advertised by weight-only scales
///
/// Standard 16-bit service identifier `0x181D` expanded to its 128-bit
/// form. Scales advertising this service without the body-composition
/// service are decoded with [`ProtocolVariant::Standard`].
pub const WEIGHT_SCALE_SERVICE_UUID: &str = "0000181D-0000-1000-8000-00805F9B34FB";

/// Body Composition service UUID advertised by impedance-capable scales
///
/// Standard 16-bit service identifier `0x181B` expanded to its 128-bit
/// form. Its presence in an advertisement selects
/// [`ProtocolVariant::Impedance`].
pub const BODY_COMPOSITION_SERVICE_UUID: &str = "0000181B-0000-1000-8000-00805F9B34FB";

/// Weight Measurement characteristic UUID
///
/// Notification channel carrying the fixed-point weight frames described
/// in [`protocol`].
pub const WEIGHT_MEASUREMENT_CHAR_UUID: &str = "00002A9D-0000-1000-8000-00805F9B34FB";

/// Body Composition Measurement characteristic UUID
///
/// Notification channel carrying the extended impedance frames. Only
/// subscribed for [`ProtocolVariant::Impedance`] devices.
pub const BODY_COMPOSITION_MEASUREMENT_CHAR_UUID: &str = "00002A9C-0000-1000-8000-00805F9B34FB";

/// Manufacturer id carried in impedance-capable scale advertisements
///
/// Observed in the manufacturer-data section of advertisements from the
/// impedance scale family this library was developed against; used for
/// variant selection when the service list is absent from the
/// advertisement.
pub const IMPEDANCE_MANUFACTURER_ID: u16 = 0x0157;

/// Manufacturer id carried in weight-only scale advertisements
///
/// Companion identifier for the weight-only family; selects
/// [`ProtocolVariant::Standard`] when present.
pub const STANDARD_MANUFACTURER_ID: u16 = 0x0203;

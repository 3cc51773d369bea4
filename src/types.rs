use serde::{Deserialize, Serialize};
use std::{fmt, time::SystemTime};

/// Weight unit reported by a scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightUnit {
    /// Kilograms
    Kilograms,
    /// Pounds
    Pounds,
}

impl fmt::Display for WeightUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kilograms => write!(f, "kg"),
            Self::Pounds => write!(f, "lb"),
        }
    }
}

/// Biological sex used by the impedance formulas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sex {
    /// Male coefficients
    Male,
    /// Female coefficients
    Female,
}

/// Stable identifier for a scale peripheral
///
/// Wraps the platform peripheral id (a hardware address on Linux/Windows,
/// an opaque identifier on macOS). Unique within any snapshot returned by
/// the subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device id from its string form
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// String form of the id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Vendor decoding strategy for a scale, selected once at discovery time
/// from the advertisement signature
///
/// A device keeps its variant for the lifetime of a session; the decoder
/// never mixes variants mid-session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVariant {
    /// Weight-only frames: 5 bytes, XOR checksum
    Standard,
    /// Extended frames carrying a bioelectrical impedance field:
    /// 13 bytes, additive checksum
    Impedance,
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Impedance => write!(f, "impedance"),
        }
    }
}

/// Identity and metadata for a discoverable or paired scale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleDevice {
    /// Stable device identifier
    pub id: DeviceId,
    /// Display name from the advertisement
    pub name: String,
    /// Manufacturer, when the advertisement carries one
    pub manufacturer: Option<String>,
    /// Model number, when known
    pub model: Option<String>,
    /// Signal strength at last advertisement
    pub rssi: Option<i16>,
    /// Whether a session to this device is currently established
    pub connected: bool,
    /// Timestamp of the last successful connection
    pub last_connected: Option<SystemTime>,
    /// Decoding strategy selected from the advertisement signature
    pub variant: ProtocolVariant,
}

impl ScaleDevice {
    /// Create a device record as first observed by a scan advertisement
    #[must_use]
    pub fn new(id: DeviceId, name: String, variant: ProtocolVariant) -> Self {
        Self {
            id,
            name,
            manufacturer: None,
            model: None,
            rssi: None,
            connected: false,
            last_connected: None,
            variant,
        }
    }
}

/// Body-composition estimates derived from an impedance measurement
///
/// The five fields are always computed together; a reading either carries
/// all of them or none (see [`ScaleData::composition`]).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BodyComposition {
    /// Body fat, percent of total weight
    pub body_fat_pct: f32,
    /// Total body water, percent of total weight
    pub water_pct: f32,
    /// Muscle mass in kilograms
    pub muscle_mass_kg: f32,
    /// Bone mass in kilograms
    pub bone_mass_kg: f32,
    /// Body-mass index
    pub bmi: f32,
}

/// One decoded measurement
///
/// Weight is always present and strictly positive. Extended fields are
/// present only when the frame carried a valid impedance measurement and
/// user biometrics were available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleData {
    /// Weight value in `unit`
    pub weight: f32,
    /// Unit the weight was reported in
    pub unit: WeightUnit,
    /// Whether the reading came from a stabilized (settled) measurement
    pub stabilized: bool,
    /// Capture timestamp
    pub timestamp: SystemTime,
    /// Extended body-composition estimates, all-or-nothing
    pub composition: Option<BodyComposition>,
}

impl ScaleData {
    /// Create a weight-only reading captured now
    #[must_use]
    pub fn weight_only(weight: f32, unit: WeightUnit, stabilized: bool) -> Self {
        Self {
            weight,
            unit,
            stabilized,
            timestamp: SystemTime::now(),
            composition: None,
        }
    }
}

/// User biometrics supplied by the caller for impedance analysis
///
/// The decoder never substitutes defaults: when biometrics are absent,
/// extended fields are omitted entirely.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserBiometrics {
    /// Biological sex
    pub sex: Sex,
    /// Height in centimeters
    pub height_cm: f32,
    /// Age in years
    pub age_years: u8,
}

impl UserBiometrics {
    /// Physiologically plausible height range accepted by the formulas
    pub const HEIGHT_RANGE_CM: std::ops::RangeInclusive<f32> = 50.0..=250.0;
    /// Age range accepted by the formulas
    pub const AGE_RANGE_YEARS: std::ops::RangeInclusive<u8> = 5..=120;

    /// Whether the biometrics fall inside the ranges the formulas are
    /// defined for
    #[must_use]
    pub fn is_plausible(&self) -> bool {
        Self::HEIGHT_RANGE_CM.contains(&self.height_cm)
            && Self::AGE_RANGE_YEARS.contains(&self.age_years)
    }
}

/// Lifecycle state of the single managed session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionPhase {
    /// No session
    Disconnected,
    /// Link negotiation or retry/backoff in progress
    Connecting,
    /// Link established and characteristics subscribed
    Connected,
    /// Orderly teardown in progress
    Disconnecting,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// Scan behavior configuration
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Scan auto-stop timeout in milliseconds
    pub timeout_ms: u64,
    /// Restrict discovery to advertisements matching known scale service
    /// signatures
    pub filter_services: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 12_000,
            filter_services: true,
        }
    }
}

/// Connection attempt and retry configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Per-attempt timeout in milliseconds
    pub attempt_timeout_ms: u64,
    /// Maximum connection attempts before a terminal error
    pub max_attempts: u32,
    /// Backoff delay before the second attempt, in milliseconds
    pub backoff_base_ms: u64,
    /// Multiplier applied to the backoff delay after each failed attempt
    pub backoff_factor: u32,
    /// Upper bound on a single backoff delay, in milliseconds
    pub backoff_cap_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 10_000,
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_factor: 2,
            backoff_cap_ms: 8_000,
        }
    }
}

impl ConnectionConfig {
    /// Backoff delay before retrying after the given zero-based attempt
    #[must_use]
    pub fn backoff_delay_ms(&self, attempt: u32) -> u64 {
        let factor = u64::from(self.backoff_factor).saturating_pow(attempt);
        self.backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_cap_ms)
    }
}

/// Description of one synthetic device served by the mock data source
#[derive(Debug, Clone)]
pub struct MockDevice {
    /// Identifier the mock advertises
    pub id: DeviceId,
    /// Display name the mock advertises
    pub name: String,
    /// Variant the mock speaks
    pub variant: ProtocolVariant,
    /// Weight in the frames it produces, in tenths of a unit
    pub weight_tenths: u16,
    /// Impedance in ohms, for `Impedance` variants
    pub impedance_ohms: u16,
}

/// Mock data source configuration
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Devices announced after `start_scan`
    pub devices: Vec<MockDevice>,
    /// Delay before synthetic discovery events, in milliseconds
    pub discovery_delay_ms: u64,
    /// Simulated link negotiation delay, in milliseconds
    pub connect_delay_ms: u64,
    /// Cadence of synthetic measurement frames, in milliseconds
    pub measurement_interval_ms: u64,
    /// Emit a post-stabilization impedance frame after this many weight
    /// frames (impedance-variant devices only)
    pub frames_until_stabilized: u32,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            devices: vec![MockDevice {
                id: DeviceId::new("AA:BB:CC:DD:EE:01"),
                name: "Composition Scale S1".to_string(),
                variant: ProtocolVariant::Impedance,
                weight_tenths: 723,
                impedance_ohms: 510,
            }],
            discovery_delay_ms: 150,
            connect_delay_ms: 100,
            measurement_interval_ms: 400,
            frames_until_stabilized: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_display() {
        assert_eq!(WeightUnit::Kilograms.to_string(), "kg");
        assert_eq!(WeightUnit::Pounds.to_string(), "lb");
    }

    #[test]
    fn test_device_creation() {
        let device = ScaleDevice::new(
            DeviceId::new("AA:BB:CC:DD:EE:FF"),
            "Test Scale".to_string(),
            ProtocolVariant::Standard,
        );
        assert_eq!(device.id.as_str(), "AA:BB:CC:DD:EE:FF");
        assert!(!device.connected);
        assert!(device.last_connected.is_none());
        assert!(device.rssi.is_none());
    }

    #[test]
    fn test_biometrics_plausibility() {
        let ok = UserBiometrics {
            sex: Sex::Female,
            height_cm: 168.0,
            age_years: 34,
        };
        assert!(ok.is_plausible());

        let bad_height = UserBiometrics {
            height_cm: 20.0,
            ..ok
        };
        assert!(!bad_height.is_plausible());

        let bad_age = UserBiometrics { age_years: 2, ..ok };
        assert!(!bad_age.is_plausible());
    }

    #[test]
    fn test_connection_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.attempt_timeout_ms, 10_000);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_base_ms, 1_000);
        assert_eq!(config.backoff_factor, 2);
    }

    #[test]
    fn test_backoff_schedule() {
        let config = ConnectionConfig::default();
        assert_eq!(config.backoff_delay_ms(0), 1_000);
        assert_eq!(config.backoff_delay_ms(1), 2_000);
        assert_eq!(config.backoff_delay_ms(2), 4_000);
        // capped
        assert_eq!(config.backoff_delay_ms(5), 8_000);
    }

    #[test]
    fn test_scan_config_defaults() {
        let config = ScanConfig::default();
        assert_eq!(config.timeout_ms, 12_000);
        assert!(config.filter_services);
    }
}

use crate::types::DeviceId;
use thiserror::Error;

/// Frame-level decoding failures
///
/// These are recovered locally by discarding the frame and continuing the
/// session; they are logged but never surfaced as session-ending errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Frame length or checksum did not validate; no field was interpreted
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Frame validated but carried a weight outside the positive range
    #[error("weight value out of range: {0}")]
    OutOfRange(f32),
}

/// Errors that can occur when working with body-composition scales
#[derive(Error, Debug)]
pub enum ScaleError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Radio unavailable or permission denied; fatal for the session
    #[error("Bluetooth capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// Scan could not be started; the caller may retry
    #[error("Scan failed: {0}")]
    Scan(String),

    /// Connection failed after retries were exhausted
    #[error("Failed to connect after {attempts} attempt(s): {reason}")]
    Connection {
        /// Why the final attempt failed
        reason: String,
        /// How many attempts were made
        attempts: u32,
    },

    /// Malformed or unrecognized frame
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A conflicting operation is already in progress
    #[error("Operation rejected, {0} already in progress")]
    Busy(&'static str),

    /// The device id is neither discovered nor registered as paired
    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),

    /// Operation timed out
    #[error("Timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// In-flight operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// The facade has not been initialized, or was torn down
    #[error("Subsystem not initialized")]
    NotInitialized,
}

/// Result type for scale operations
pub type Result<T> = std::result::Result<T, ScaleError>;

/// Error categories broadcast on the `error` event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Radio unavailable or permission denied
    Capability,
    /// Scan start rejected or adapter busy
    Scan,
    /// Timeout, link loss, or subscription failure
    Connection,
    /// Malformed or unrecognized frame
    Protocol,
    /// Conflicting operation in progress
    Busy,
}

impl ScaleError {
    /// Map this error to its broadcast category
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::CapabilityUnavailable(_) => ErrorKind::Capability,
            Self::Scan(_) => ErrorKind::Scan,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Busy(_) => ErrorKind::Busy,
            Self::Ble(_)
            | Self::Connection { .. }
            | Self::UnknownDevice(_)
            | Self::Timeout { .. }
            | Self::Cancelled
            | Self::NotInitialized => ErrorKind::Connection,
        }
    }

    /// Check if the caller may reasonably retry the failed operation
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Scan(_) | Self::Connection { .. } | Self::Timeout { .. } | Self::Busy(_)
        )
    }

    /// Check if this error ends the session permanently until the radio
    /// situation changes
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::CapabilityUnavailable(_))
    }

    /// Check if this error should be broadcast on the `error` event
    ///
    /// Frame-level protocol rejects and caller-initiated cancellation are
    /// internal noise, not session failures.
    #[must_use]
    pub const fn is_broadcast(&self) -> bool {
        !matches!(self, Self::Protocol(_) | Self::Cancelled | Self::Busy(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let capability = ScaleError::CapabilityUnavailable("no adapter".to_string());
        assert_eq!(capability.kind(), ErrorKind::Capability);
        assert!(capability.is_fatal());
        assert!(!capability.is_recoverable());

        let scan = ScaleError::Scan("adapter busy".to_string());
        assert_eq!(scan.kind(), ErrorKind::Scan);
        assert!(scan.is_recoverable());
        assert!(!scan.is_fatal());

        let connection = ScaleError::Connection {
            reason: "link negotiation timed out".to_string(),
            attempts: 3,
        };
        assert_eq!(connection.kind(), ErrorKind::Connection);
        assert!(connection.is_recoverable());
    }

    #[test]
    fn test_protocol_errors_stay_internal() {
        let protocol = ScaleError::from(ProtocolError::Malformed("bad checksum".to_string()));
        assert_eq!(protocol.kind(), ErrorKind::Protocol);
        assert!(!protocol.is_broadcast());

        let cancelled = ScaleError::Cancelled;
        assert!(!cancelled.is_broadcast());

        let timeout = ScaleError::Timeout { timeout_ms: 10_000 };
        assert!(timeout.is_broadcast());
    }

    #[test]
    fn test_error_display() {
        let error = ScaleError::Connection {
            reason: "subscription failed".to_string(),
            attempts: 3,
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("3 attempt"));
        assert!(error_string.contains("subscription failed"));

        let busy = ScaleError::Busy("a connection attempt");
        assert!(format!("{busy}").contains("already in progress"));
    }
}

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while bridging a treadmill to FTMS
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Central-side Bluetooth Low Energy errors (treadmill link)
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Peripheral-side BlueZ errors (FTMS service and advertisement)
    #[error("BlueZ peripheral error: {0}")]
    Peripheral(#[from] bluer::Error),

    /// No Bluetooth adapter or no peripheral with the requested address
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Operation requires a connected treadmill
    #[error("Not connected to treadmill")]
    NotConnected,

    /// Connect or write timed out
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Characteristic discovery found no usable notify or write characteristic
    #[error("No {kind} characteristic found (expected {expected})")]
    CharacteristicNotFound {
        /// Which capability was missing ("notify" or "write")
        kind: &'static str,
        /// The characteristic UUID the treadmill normally exposes
        expected: Uuid,
    },

    /// The adapter used for the FTMS peripheral cannot be accessed
    #[error("Cannot access BLE adapter '{adapter}': {reason}")]
    AdapterUnavailable {
        /// Adapter identifier, e.g. `hci0`
        adapter: String,
        /// Underlying failure description
        reason: String,
    },

    /// The command queue has no live consumer
    #[error("Command dispatcher is not running")]
    DispatchUnavailable,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::NotConnected
                | Self::DeviceNotFound(_)
                | Self::Timeout { .. }
        )
    }

    /// Check if this error came from characteristic discovery
    #[must_use]
    pub const fn is_discovery_error(&self) -> bool {
        matches!(self, Self::CharacteristicNotFound { .. })
    }

    /// Check if this error was raised by one of the BLE stacks
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(self, Self::Ble(_) | Self::Peripheral(_) | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = BridgeError::ConnectionFailed("test".to_string());
        assert!(connection_error.is_connection_error());
        assert!(!connection_error.is_discovery_error());
        assert!(!connection_error.is_transport_error());

        let discovery_error = BridgeError::CharacteristicNotFound {
            kind: "notify",
            expected: crate::DEVICE_NOTIFY_CHAR_UUID,
        };
        assert!(!discovery_error.is_connection_error());
        assert!(discovery_error.is_discovery_error());

        let timeout_error = BridgeError::Timeout { timeout_ms: 15_000 };
        assert!(timeout_error.is_connection_error());

        let io_error = BridgeError::from(std::io::Error::other("adapter gone"));
        assert!(io_error.is_transport_error());
    }

    #[test]
    fn test_error_display() {
        let error = BridgeError::CharacteristicNotFound {
            kind: "write",
            expected: crate::DEVICE_WRITE_CHAR_UUID,
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("No write characteristic found"));
        assert!(error_string.contains("00002ad9-0000-1000-8000-00805f9b34fb"));

        let error = BridgeError::AdapterUnavailable {
            adapter: "hci1".to_string(),
            reason: "no such adapter".to_string(),
        };
        assert!(format!("{error}").contains("'hci1'"));
    }
}

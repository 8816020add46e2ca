use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Belt state code reported while the belt is moving
pub const BELT_RUNNING: u8 = 1;

/// Belt state code reported once the belt has stopped
pub const BELT_STOPPED: u8 = 5;

/// Highest speed the treadmill accepts, in km/h
pub const MAX_SPEED_KMH: f64 = 6.0;

/// Shortest auto loop cadence; smaller or invalid configured values use this
pub const MIN_SCAN_INTERVAL: Duration = Duration::from_millis(100);

/// Live treadmill metrics decoded from one status notification
///
/// Every successfully parsed notification replaces the previous value
/// wholesale; there are no partial updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Current belt speed in km/h
    pub speed_kmh: f64,
    /// Distance covered in the current session, in km
    pub distance_km: f64,
    /// Elapsed session time in seconds
    pub elapsed_time_s: u32,
    /// Steps counted in the current session
    pub step_count: u32,
    /// Raw belt state code (1 = running, 5 = stopped, others passed through)
    pub belt_state: u8,
    /// Manual mode flag as reported by the firmware
    pub manual_mode: u8,
    /// Speed last requested through the vendor app protocol, in km/h
    pub app_reported_speed_kmh: f64,
}

impl DeviceStatus {
    /// Whether the belt is currently running
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.belt_state == BELT_RUNNING
    }
}

/// Command forwarded to the treadmill
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceCommand {
    /// Start the belt
    Start,
    /// Stop the belt
    Stop,
    /// Set target speed in km/h, always within `[0, 6.0]`
    SetSpeed(f64),
}

impl DeviceCommand {
    /// Build a speed command, clamping into the supported range
    #[must_use]
    pub fn set_speed(speed_kmh: f64) -> Self {
        let speed = if speed_kmh.is_nan() {
            0.0
        } else {
            speed_kmh.clamp(0.0, MAX_SPEED_KMH)
        };
        Self::SetSpeed(speed)
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "Start"),
            Self::Stop => write!(f, "Stop"),
            Self::SetSpeed(speed) => write!(f, "SetSpeed({speed:.2} km/h)"),
        }
    }
}

/// Lifecycle of the link to the treadmill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link
    Disconnected,
    /// Connect and characteristic discovery in progress
    Connecting,
    /// Subscribed and polling
    Connected,
    /// Tearing down the poll task and transport link
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// FTMS control ownership
///
/// There is one session for the whole peripheral: whichever link last
/// requested control controls the machine for every link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControlSession {
    /// No client has requested control
    #[default]
    NoControl,
    /// A client has requested control
    HasControl,
}

/// A peripheral seen during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Platform address of the peripheral
    pub address: String,
    /// Advertised name, or the address when nothing was advertised
    pub name: String,
    /// Whether the advertisement lists the fitness machine service
    pub advertises_ftms: bool,
}

impl DiscoveredDevice {
    /// Whether the peripheral advertised a real name
    #[must_use]
    pub fn has_name(&self) -> bool {
        !self.name.is_empty() && self.name != self.address
    }
}

/// Settings consumed by the bridge core
///
/// Loading and merging configuration files is left to the embedding
/// application; serde names match the keys of the bridge's config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Adapter used for both the treadmill link and FTMS advertising
    #[serde(rename = "ble_adapter")]
    pub adapter: String,
    /// Status poll interval while connected, in milliseconds
    pub stats_interval_ms: u64,
    /// Discovery/reconnect cadence of the auto loop, in seconds
    #[serde(rename = "scan_interval")]
    pub scan_interval_s: f64,
    /// Start the FTMS bridge as soon as the treadmill connects
    pub auto_start_bridge: bool,
    /// Advertised-name prefix used for auto-discovery
    #[serde(rename = "kingsmith_ble_name_prefix")]
    pub name_prefix: String,
    /// Explicit advertised FTMS name, overriding the derived one
    pub ftms_device_name: Option<String>,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Minimum spacing between belt commands, in milliseconds (0 disables)
    pub min_command_interval_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            adapter: "hci0".to_string(),
            stats_interval_ms: 750,
            scan_interval_s: 5.0,
            auto_start_bridge: true,
            name_prefix: "KS-SC-".to_string(),
            ftms_device_name: None,
            connect_timeout_ms: 15_000,
            min_command_interval_ms: 690,
        }
    }
}

impl BridgeConfig {
    /// Status poll interval
    #[must_use]
    pub const fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    /// Auto loop cadence, also used as the backoff after a failed iteration
    ///
    /// Never shorter than [`MIN_SCAN_INTERVAL`].
    #[must_use]
    pub fn scan_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.scan_interval_s)
            .unwrap_or(Duration::ZERO)
            .max(MIN_SCAN_INTERVAL)
    }

    /// Scan window used by auto-discovery: the scan interval plus two
    /// seconds, capped at ten seconds
    #[must_use]
    pub fn discovery_scan_timeout(&self) -> Duration {
        (self.scan_interval() + Duration::from_secs(2)).min(Duration::from_secs(10))
    }

    /// Connect timeout
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Minimum spacing between belt commands
    #[must_use]
    pub const fn min_command_interval(&self) -> Duration {
        Duration::from_millis(self.min_command_interval_ms)
    }
}

//! Fitness Machine Service frames and the control point state machine.
//!
//! Frames follow the Bluetooth SIG FTMS profile for a treadmill. Only the
//! fields the WalkingPad can actually fill are announced: instantaneous
//! speed, total distance and elapsed time.

use crate::{
    error::Result,
    types::{ControlSession, DeviceCommand, DeviceStatus},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Fitness Machine Service (0x1826)
pub const FTMS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1826_0000_1000_8000_0080_5f9b_34fb);

/// Treadmill Data characteristic (0x2ACD), read + notify
pub const TREADMILL_DATA_UUID: Uuid = Uuid::from_u128(0x0000_2acd_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine Feature characteristic (0x2ACC), read
pub const FEATURE_UUID: Uuid = Uuid::from_u128(0x0000_2acc_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine Control Point characteristic (0x2AD9), write + indicate
pub const CONTROL_POINT_UUID: Uuid = Uuid::from_u128(0x0000_2ad9_0000_1000_8000_0080_5f9b_34fb);

/// GAP appearance for a running/walking device
pub const APPEARANCE_RUNNING_WALKING: u16 = 0x0340;

/// Treadmill Data flags: Total Distance Present (bit 2) and Elapsed Time
/// Present (bit 10). Instantaneous speed has no flag and is always present.
pub const TREADMILL_DATA_FLAGS: u16 = 0x0404;

/// Fitness Machine Features: average speed (bit 0), total distance (bit 2),
/// step count (bit 6), elapsed time (bit 9)
pub const MACHINE_FEATURES: u32 = 0x0000_0245;

/// Target Setting Features: speed target (bit 0)
pub const TARGET_SETTING_FEATURES: u32 = 0x0000_0001;

/// First byte of every control point response
pub const RESPONSE_CODE: u8 = 0x80;

/// Length of a Treadmill Data frame
pub const TREADMILL_DATA_LEN: usize = 9;

const MAX_SPEED_FIELD: u16 = 0xFFFE;
const MAX_DISTANCE_FIELD: u64 = 0xFF_FFFF;

/// Control point request opcodes understood by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlOpcode {
    /// Take control of the machine
    RequestControl = 0x00,
    /// Release control
    Reset = 0x01,
    /// Set target speed (uint16 LE, 0.01 km/h)
    SetTargetSpeed = 0x02,
    /// Start or resume the belt
    StartResume = 0x07,
    /// Stop (1) or pause (2) the belt
    StopPause = 0x08,
}

impl ControlOpcode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::RequestControl),
            0x01 => Some(Self::Reset),
            0x02 => Some(Self::SetTargetSpeed),
            0x07 => Some(Self::StartResume),
            0x08 => Some(Self::StopPause),
            _ => None,
        }
    }
}

/// Control point result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    /// Request accepted
    Success = 0x01,
    /// Opcode not supported
    NotSupported = 0x02,
    /// Payload missing or out of range
    InvalidParameter = 0x03,
    /// Command could not be handed off to the treadmill
    OperationFailed = 0x04,
    /// Control has not been requested
    NotPermitted = 0x05,
}

/// Encode the Fitness Machine Feature value.
#[must_use]
pub fn encode_feature() -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32_le(MACHINE_FEATURES);
    buf.put_u32_le(TARGET_SETTING_FEATURES);
    buf.freeze()
}

/// Encode a Treadmill Data frame.
///
/// `None` (no status received yet) encodes as all-zero metrics.
///
/// Layout:
/// - Bytes 0-1: flags
/// - Bytes 2-3: instantaneous speed, 0.01 km/h
/// - Bytes 4-6: total distance, meters
/// - Bytes 7-8: elapsed time, seconds
#[must_use]
pub fn encode_treadmill_data(status: Option<&DeviceStatus>) -> Bytes {
    let (speed_kmh, distance_km, elapsed_s) = status.map_or((0.0, 0.0, 0), |s| {
        (s.speed_kmh, s.distance_km, s.elapsed_time_s)
    });

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let speed = (speed_kmh * 100.0).round().clamp(0.0, f64::from(MAX_SPEED_FIELD)) as u16;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let distance_m = ((distance_km * 1000.0).floor().max(0.0) as u64).min(MAX_DISTANCE_FIELD);
    let elapsed = u16::try_from(elapsed_s).unwrap_or(u16::MAX);

    let mut buf = BytesMut::with_capacity(TREADMILL_DATA_LEN);
    buf.put_u16_le(TREADMILL_DATA_FLAGS);
    buf.put_u16_le(speed);
    buf.put_uint_le(distance_m, 3);
    buf.put_u16_le(elapsed);
    buf.freeze()
}

/// Encode a control point response: response code, echoed opcode, result.
#[must_use]
pub const fn encode_control_response(request_opcode: u8, result: ResultCode) -> [u8; 3] {
    [RESPONSE_CODE, request_opcode, result as u8]
}

/// Destination for commands accepted on the control point
///
/// `submit` must hand the command off without waiting for the treadmill:
/// an `Ok` means "accepted for dispatch", not "executed".
pub trait CommandSink: Send + Sync {
    /// Queue a command for asynchronous execution
    ///
    /// # Errors
    ///
    /// Returns an error when the command cannot be queued.
    fn submit(&self, command: DeviceCommand) -> Result<()>;
}

/// FTMS control point state machine
///
/// Owns the single global [`ControlSession`] and maps every write to exactly
/// one 3-byte response.
pub struct ControlPoint {
    session: ControlSession,
    sink: Option<Arc<dyn CommandSink>>,
}

impl ControlPoint {
    /// Create a control point forwarding accepted commands to `sink`
    #[must_use]
    pub fn new(sink: Option<Arc<dyn CommandSink>>) -> Self {
        Self {
            session: ControlSession::NoControl,
            sink,
        }
    }

    /// Current control session
    #[must_use]
    pub const fn session(&self) -> ControlSession {
        self.session
    }

    /// Handle one control point write and return the response to indicate.
    ///
    /// An empty write carries no opcode to echo and yields `None`.
    pub fn handle_write(&mut self, value: &[u8]) -> Option<[u8; 3]> {
        let (&opcode, payload) = value.split_first()?;
        info!(
            "FTMS Control Point: opcode=0x{:02X} payload={:02X?}",
            opcode, payload
        );
        let result = self.handle(opcode, payload);
        Some(encode_control_response(opcode, result))
    }

    fn handle(&mut self, opcode: u8, mut payload: &[u8]) -> ResultCode {
        let Some(op) = ControlOpcode::from_u8(opcode) else {
            warn!("FTMS: unsupported opcode 0x{:02X}", opcode);
            return ResultCode::NotSupported;
        };

        if op == ControlOpcode::RequestControl {
            self.session = ControlSession::HasControl;
            info!("FTMS: client requested control");
            return ResultCode::Success;
        }

        if self.session != ControlSession::HasControl {
            warn!("FTMS: command {:?} rejected, control not requested", op);
            return ResultCode::NotPermitted;
        }

        match op {
            ControlOpcode::RequestControl => ResultCode::Success,
            ControlOpcode::Reset => {
                self.session = ControlSession::NoControl;
                info!("FTMS: reset");
                ResultCode::Success
            }
            ControlOpcode::SetTargetSpeed => {
                if payload.len() < 2 {
                    return ResultCode::InvalidParameter;
                }
                let speed_kmh = f64::from(payload.get_u16_le()) / 100.0;
                info!("FTMS: set target speed {:.2} km/h", speed_kmh);
                self.dispatch(DeviceCommand::set_speed(speed_kmh))
            }
            ControlOpcode::StartResume => {
                info!("FTMS: start/resume");
                self.dispatch(DeviceCommand::Start)
            }
            ControlOpcode::StopPause => match payload.first() {
                Some(0x01) => {
                    info!("FTMS: stop");
                    self.dispatch(DeviceCommand::Stop)
                }
                Some(0x02) => {
                    info!("FTMS: pause (treated as stop)");
                    self.dispatch(DeviceCommand::Stop)
                }
                _ => ResultCode::InvalidParameter,
            },
        }
    }

    fn dispatch(&self, command: DeviceCommand) -> ResultCode {
        let Some(sink) = &self.sink else {
            warn!("FTMS: no control command handler registered");
            return ResultCode::OperationFailed;
        };
        match sink.submit(command) {
            Ok(()) => ResultCode::Success,
            Err(e) => {
                error!("FTMS: control command {} failed: {}", command, e);
                ResultCode::OperationFailed
            }
        }
    }
}

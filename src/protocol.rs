//! WalkingPad vendor byte protocol.
//!
//! The treadmill exposes FTMS-shaped UUIDs but speaks its own framing:
//!
//! - Status notifications start with the marker `F8 A2` and are at least
//!   19 bytes long. Multi-byte counters are 3-byte big-endian.
//! - The status request is a fixed 6-byte frame whose second-to-last byte is
//!   a checksum over the bytes between the header and the checksum.
//! - Belt commands (start, stop, set speed) are short opcode frames with no
//!   checksum byte at all.

use crate::types::{DeviceCommand, DeviceStatus, MAX_SPEED_KMH};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Marker opening every status notification
pub const STATUS_MARKER: [u8; 2] = [0xF8, 0xA2];

/// Shortest frame that carries a full status record
pub const STATUS_FRAME_MIN_LEN: usize = 19;

/// Status request template; byte 4 is overwritten by the checksum
const STATUS_REQUEST_TEMPLATE: [u8; 6] = [0xF7, 0xA2, 0x00, 0x00, 0xA2, 0xFD];

/// Opcode starting the belt
pub const START_OPCODE: u8 = 0x07;

/// Opcode stopping the belt
pub const STOP_OPCODE: u8 = 0x08;

/// Fixed parameter sent with the stop opcode
const STOP_PARAMETER: u8 = 0x01;

/// Opcode setting the target speed
pub const SET_SPEED_OPCODE: u8 = 0x02;

/// Highest raw speed value accepted by the set-speed command (0.01 km/h units)
pub const MAX_SPEED_RAW: u16 = 600;

/// Parse a status notification.
///
/// Returns `None` for anything that is not a status frame: the notify
/// characteristic also carries unrelated traffic, so this is not an error.
///
/// Layout after the marker:
/// - Byte 2: belt state
/// - Byte 3: speed (km/h × 10)
/// - Byte 4: manual mode flag
/// - Bytes 5-7: elapsed time in seconds
/// - Bytes 8-10: distance in units of 10 m
/// - Bytes 11-13: step count
/// - Byte 14: app-reported speed (30 units = 6.0 km/h)
#[must_use]
pub fn parse_status(data: &[u8]) -> Option<DeviceStatus> {
    if data.len() < STATUS_FRAME_MIN_LEN || data[..2] != STATUS_MARKER {
        return None;
    }

    let mut buf = &data[2..];

    let belt_state = buf.get_u8();
    let speed_raw = buf.get_u8();
    let manual_mode = buf.get_u8();
    #[allow(clippy::cast_possible_truncation)]
    let elapsed_time_s = buf.get_uint(3) as u32;
    #[allow(clippy::cast_precision_loss)]
    let distance_km = buf.get_uint(3) as f64 / 100.0;
    #[allow(clippy::cast_possible_truncation)]
    let step_count = buf.get_uint(3) as u32;
    let app_speed_raw = buf.get_u8();

    Some(DeviceStatus {
        speed_kmh: f64::from(speed_raw) / 10.0,
        distance_km,
        elapsed_time_s,
        step_count,
        belt_state,
        manual_mode,
        app_reported_speed_kmh: f64::from(app_speed_raw) * MAX_SPEED_KMH / 30.0,
    })
}

/// Build the periodic status request.
#[must_use]
pub fn build_status_request_frame() -> Bytes {
    let mut frame = STATUS_REQUEST_TEMPLATE;
    let checksum_at = frame.len() - 2;
    frame[checksum_at] = frame[1..checksum_at]
        .iter()
        .fold(0u8, |sum, byte| sum.wrapping_add(*byte));
    Bytes::copy_from_slice(&frame)
}

/// Build the belt start command.
#[must_use]
pub fn build_start_frame() -> Bytes {
    Bytes::from_static(&[START_OPCODE])
}

/// Build the belt stop command.
#[must_use]
pub fn build_stop_frame() -> Bytes {
    Bytes::from_static(&[STOP_OPCODE, STOP_PARAMETER])
}

/// Build a set-speed command.
///
/// The speed is clamped to `[0, 6.0]` km/h and sent as a little-endian
/// count of 0.01 km/h.
#[must_use]
pub fn build_set_speed_frame(speed_kmh: f64) -> Bytes {
    let speed = if speed_kmh.is_nan() {
        0.0
    } else {
        speed_kmh.clamp(0.0, MAX_SPEED_KMH)
    };

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let raw = ((speed * 100.0).round() as u16).min(MAX_SPEED_RAW);

    let mut buf = BytesMut::with_capacity(3);
    buf.put_u8(SET_SPEED_OPCODE);
    buf.put_u16_le(raw);
    buf.freeze()
}

impl DeviceCommand {
    /// Encode this command as a vendor frame
    #[must_use]
    pub fn to_frame(&self) -> Bytes {
        match self {
            Self::Start => build_start_frame(),
            Self::Stop => build_stop_frame(),
            Self::SetSpeed(speed) => build_set_speed_frame(*speed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a synthetic status frame the way the firmware lays it out
    fn status_frame(
        belt: u8,
        speed_raw: u8,
        time_s: u32,
        distance_raw: u32,
        steps: u32,
        app_speed_raw: u8,
    ) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(20);
        buf.put_slice(&STATUS_MARKER);
        buf.put_u8(belt);
        buf.put_u8(speed_raw);
        buf.put_u8(1);
        buf.put_uint(u64::from(time_s), 3);
        buf.put_uint(u64::from(distance_raw), 3);
        buf.put_uint(u64::from(steps), 3);
        buf.put_u8(app_speed_raw);
        buf.put_slice(&[0x00, 0x00, 0x00, 0x00, 0xFD]);
        buf.to_vec()
    }

    #[test]
    fn test_parse_status_fields() {
        let frame = status_frame(1, 35, 0x01_02_03, 123, 4567, 15);
        let status = parse_status(&frame).unwrap();

        assert!((status.speed_kmh - 3.5).abs() < 1e-9);
        assert!((status.distance_km - 1.23).abs() < 1e-9);
        assert_eq!(status.elapsed_time_s, 0x01_02_03);
        assert_eq!(status.step_count, 4567);
        assert_eq!(status.belt_state, 1);
        assert_eq!(status.manual_mode, 1);
        assert!((status.app_reported_speed_kmh - 3.0).abs() < 1e-9);
        assert!(status.is_running());
    }

    #[test]
    fn test_parse_status_reproduces_resolution() {
        for (speed_raw, distance_raw) in [(0u8, 0u32), (5, 1), (60, 99_999), (255, 0xFF_FF_FF)] {
            let frame = status_frame(5, speed_raw, 42, distance_raw, 0, 0);
            let status = parse_status(&frame).unwrap();

            let speed_back = (status.speed_kmh * 10.0).round();
            let distance_back = (status.distance_km * 100.0).round();
            assert!((speed_back - f64::from(speed_raw)).abs() < f64::EPSILON);
            assert!((distance_back - f64::from(distance_raw)).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn test_parse_status_zero_app_speed_is_exact() {
        let frame = status_frame(5, 0, 0, 0, 0, 0);
        let status = parse_status(&frame).unwrap();
        assert_eq!(status.app_reported_speed_kmh.to_bits(), 0.0f64.to_bits());
        assert!(!status.is_running());
    }

    #[test]
    fn test_parse_status_rejects_other_frames() {
        let frame = status_frame(1, 10, 0, 0, 0, 0);

        assert!(parse_status(&frame[..STATUS_FRAME_MIN_LEN - 1]).is_none());
        assert!(parse_status(&[]).is_none());

        let mut wrong_marker = frame.clone();
        wrong_marker[1] = 0xA7;
        assert!(parse_status(&wrong_marker).is_none());

        assert!(parse_status(&frame[..STATUS_FRAME_MIN_LEN]).is_some());
    }

    #[test]
    fn test_status_request_frame_checksum() {
        let frame = build_status_request_frame();

        assert_eq!(frame.len(), 6);
        assert_eq!(frame[0], 0xF7);
        assert_eq!(frame[5], 0xFD);
        let expected = frame[1..4].iter().map(|b| u32::from(*b)).sum::<u32>() % 256;
        assert_eq!(u32::from(frame[4]), expected);
        assert_eq!(&frame[..], &[0xF7, 0xA2, 0x00, 0x00, 0xA2, 0xFD]);
    }

    #[test]
    fn test_belt_frames_carry_no_checksum() {
        assert_eq!(&build_start_frame()[..], &[0x07]);
        assert_eq!(&build_stop_frame()[..], &[0x08, 0x01]);
    }

    #[test]
    fn test_set_speed_frame_encoding() {
        assert_eq!(&build_set_speed_frame(3.5)[..], &[0x02, 0x5E, 0x01]);
        assert_eq!(&build_set_speed_frame(0.5)[..], &[0x02, 0x32, 0x00]);
        assert_eq!(&build_set_speed_frame(6.0)[..], &[0x02, 0x58, 0x02]);
    }

    #[test]
    fn test_set_speed_frame_clamps() {
        assert_eq!(&build_set_speed_frame(-1.0)[..], &[0x02, 0x00, 0x00]);
        assert_eq!(&build_set_speed_frame(12.0)[..], &[0x02, 0x58, 0x02]);
        assert_eq!(&build_set_speed_frame(f64::NAN)[..], &[0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_set_speed_frame_is_monotonic() {
        let mut previous = 0u16;
        for step in 0..=70 {
            let frame = build_set_speed_frame(f64::from(step) * 0.1);
            let raw = u16::from_le_bytes([frame[1], frame[2]]);
            assert!(raw >= previous, "raw speed decreased at step {step}");
            assert!(raw <= MAX_SPEED_RAW);
            previous = raw;
        }
        assert_eq!(previous, MAX_SPEED_RAW);
    }

    #[test]
    fn test_command_frames() {
        assert_eq!(DeviceCommand::Start.to_frame(), build_start_frame());
        assert_eq!(DeviceCommand::Stop.to_frame(), build_stop_frame());
        assert_eq!(
            DeviceCommand::set_speed(2.0).to_frame(),
            build_set_speed_frame(2.0)
        );
    }
}

//! Renpho Scale Protocol
//!
//! Frame layouts, characteristic identifiers and the codec used to talk to
//! the scale. Everything here is pure: no I/O and no state.
//!
//! # Frame Structure
//!
//! ```text
//! [0]      : Command
//! [1]      : Total frame length, checksum included
//! [2]      : Protocol type
//! [3..n-1] : Payload
//! [n-1]    : Checksum, sum of all preceding bytes modulo 256
//! ```
//!
//! The time sync command is the exception: `[0x02] [u32 LE seconds] [checksum]`.

use crate::domain::models::{ParsedMeasurement, WeightUnit};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Renpho Scale BLE Service UUID
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);
/// Weight data characteristic - notify
pub const WEIGHT_CHAR_UUID: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);
/// Status characteristic - indicate
pub const STATUS_CHAR_UUID: Uuid = Uuid::from_u128(0x0000ffe2_0000_1000_8000_00805f9b34fb);
/// Command characteristic - write
pub const COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x0000ffe3_0000_1000_8000_00805f9b34fb);
/// Time sync characteristic - write
pub const TIME_SYNC_CHAR_UUID: Uuid = Uuid::from_u128(0x0000ffe4_0000_1000_8000_00805f9b34fb);

/// Service used by some older firmware revisions
pub const ALT_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);
/// Weight data characteristic on the older service - notify
pub const ALT_WEIGHT_CHAR_UUID: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);
/// Command and time sync characteristic on the older service - write
pub const ALT_COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x0000fff2_0000_1000_8000_00805f9b34fb);

/// Manufacturer id advertised by the scales
pub const MANUFACTURER_ID: u16 = 0xFFFF;

/// Scale clock epoch expressed as a Unix timestamp
pub const SCALE_EPOCH_OFFSET: i64 = 946_702_800;

/// Smallest frame carrying a header and a checksum
pub const MIN_FRAME_LEN: usize = 4;

/// Raw resistance values meaning "no foot contact"
pub const NO_CONTACT_SENTINELS: [u16; 2] = [0x0000, 0xFFFF];

/// Resistance below which the impedance conversion is clamped
const RESISTANCE_FLOOR: u16 = 410;
const IMPEDANCE_FLOOR_OHMS: f64 = 3.0;

/// Command bytes
pub mod command {
    pub const TIME_SYNC: u8 = 0x02;
    pub const WEIGHT: u8 = 0x10;
    pub const SCALE_SETTINGS: u8 = 0x12;
    pub const WEIGHT_REQUEST: u8 = 0x13;
    pub const REQUEST_14: u8 = 0x14;
    pub const REPLY_14: u8 = 0x20;
    pub const REQUEST_21: u8 = 0x21;
    pub const REPLY_A1: u8 = 0x22;
    pub const HISTORY: u8 = 0x23;
    pub const REPLY_21: u8 = 0xA0;
    pub const REQUEST_A1: u8 = 0xA1;
}

/// Protocol type byte selecting the extended weight frame layout
pub const PROTOCOL_TYPE_EXTENDED: u8 = 0xFF;

/// Byte positions within a weight frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WeightLayout {
    stability: usize,
    weight: usize,
    resistance: usize,
    final_marker: u8,
}

impl WeightLayout {
    const STANDARD: Self = Self {
        stability: 5,
        weight: 3,
        resistance: 6,
        final_marker: 1,
    };

    const EXTENDED: Self = Self {
        stability: 4,
        weight: 5,
        resistance: 7,
        final_marker: 2,
    };

    fn for_protocol(protocol_type: u8) -> Self {
        if protocol_type == PROTOCOL_TYPE_EXTENDED {
            Self::EXTENDED
        } else {
            Self::STANDARD
        }
    }

    /// Two resistance words followed by the checksum
    fn min_len(&self) -> usize {
        self.resistance + 4 + 1
    }
}

/// Characteristic layout of a scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GattProfile {
    #[default]
    Primary,
    Alternative,
}

impl GattProfile {
    /// Pick the layout a peripheral exposes. Scales lacking the primary
    /// weight or time sync characteristics but offering the older weight
    /// characteristic use the older layout.
    pub fn detect(has_characteristic: impl Fn(Uuid) -> bool) -> Self {
        let primary =
            has_characteristic(WEIGHT_CHAR_UUID) && has_characteristic(TIME_SYNC_CHAR_UUID);
        if !primary && has_characteristic(ALT_WEIGHT_CHAR_UUID) {
            Self::Alternative
        } else {
            Self::Primary
        }
    }

    pub fn service(self) -> Uuid {
        match self {
            Self::Primary => SERVICE_UUID,
            Self::Alternative => ALT_SERVICE_UUID,
        }
    }

    pub fn weight_characteristic(self) -> Uuid {
        match self {
            Self::Primary => WEIGHT_CHAR_UUID,
            Self::Alternative => ALT_WEIGHT_CHAR_UUID,
        }
    }

    /// The older service has no status characteristic
    pub fn status_characteristic(self) -> Option<Uuid> {
        match self {
            Self::Primary => Some(STATUS_CHAR_UUID),
            Self::Alternative => None,
        }
    }

    pub fn command_characteristic(self) -> Uuid {
        match self {
            Self::Primary => COMMAND_CHAR_UUID,
            Self::Alternative => ALT_COMMAND_CHAR_UUID,
        }
    }

    pub fn time_sync_characteristic(self) -> Uuid {
        match self {
            Self::Primary => TIME_SYNC_CHAR_UUID,
            Self::Alternative => ALT_COMMAND_CHAR_UUID,
        }
    }

    /// Characteristics the session subscribes to, in order
    pub fn subscriptions(self) -> Vec<Uuid> {
        let mut uuids = vec![self.weight_characteristic()];
        uuids.extend(self.status_characteristic());
        uuids
    }

    /// Identify the source of a notification
    pub fn characteristic_id(self, uuid: Uuid) -> Option<CharacteristicId> {
        if uuid == self.weight_characteristic() {
            Some(CharacteristicId::WeightData)
        } else if Some(uuid) == self.status_characteristic() {
            Some(CharacteristicId::Status)
        } else {
            None
        }
    }

    /// Weight scale for this layout. The older service reports weight with
    /// one extra decimal.
    pub fn weight_scale(self, reported: WeightScale) -> WeightScale {
        match self {
            Self::Primary => reported,
            Self::Alternative => WeightScale {
                divisor: reported.divisor * 10.0,
            },
        }
    }
}

/// Notification source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicId {
    WeightData,
    Status,
}

/// Fixed-point divisor applied to the raw weight field
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightScale {
    divisor: f64,
}

impl WeightScale {
    /// Weight in hundredths of a kilogram (the default)
    pub const HUNDREDTHS: Self = Self { divisor: 100.0 };
    /// Weight in tenths of a kilogram
    pub const TENTHS: Self = Self { divisor: 10.0 };

    /// Decode the precision flag of the scale settings frame
    pub fn from_settings_flag(flag: u8) -> Self {
        if flag == 1 {
            Self::HUNDREDTHS
        } else {
            Self::TENTHS
        }
    }

    pub fn divisor(&self) -> f64 {
        self.divisor
    }

    pub fn apply(&self, raw: u16) -> f64 {
        f64::from(raw) / self.divisor
    }
}

impl Default for WeightScale {
    fn default() -> Self {
        Self::HUNDREDTHS
    }
}

/// Control requests the scale sends and expects a reply to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    ScaleSettings,
    Request14,
    Request21,
    RequestA1,
}

/// Commands sent to the scale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Ask the scale to start streaming weight notifications
    WeightRequest { unit: WeightUnit, protocol_type: u8 },
    /// Set the scale clock, Unix seconds
    TimeSync { timestamp: i64 },
    /// Reply to a control request
    Ack {
        kind: AckKind,
        protocol_type: u8,
        unit: WeightUnit,
    },
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::WeightRequest { .. } => "weight request",
            Self::TimeSync { .. } => "time sync",
            Self::Ack { .. } => "ack",
        }
    }
}

/// Decoded status or control frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatusKind {
    /// Scale settings; carries the weight precision when present
    ScaleSettings { weight_scale: Option<WeightScale> },
    Request14,
    Request21,
    RequestA1,
    /// Stored measurements; not used by the session
    History,
    /// Indication received on the status characteristic
    Indication { command: u8 },
}

impl StatusKind {
    /// Reply the scale expects for this frame, if any
    pub fn ack(&self) -> Option<AckKind> {
        match self {
            Self::ScaleSettings { .. } => Some(AckKind::ScaleSettings),
            Self::Request14 => Some(AckKind::Request14),
            Self::Request21 => Some(AckKind::Request21),
            Self::RequestA1 => Some(AckKind::RequestA1),
            Self::History | Self::Indication { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusFrame {
    pub kind: StatusKind,
    pub protocol_type: u8,
}

/// A notification after validation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParsedFrame {
    /// Transient weight while the user is stepping on
    InProgress(ParsedMeasurement),
    /// Settled weight
    Final(ParsedMeasurement),
    Status(StatusFrame),
    /// Valid frame with a command this codec does not interpret
    Unknown { command: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("frame too short: {actual} bytes, need {expected}")]
    FrameTooShort { expected: usize, actual: usize },
    #[error("checksum mismatch: frame says {received:#04X}, computed {computed:#04X}")]
    ChecksumMismatch { received: u8, computed: u8 },
    #[error("unknown weight frame marker {0:#04X}")]
    UnknownFrameType(u8),
}

/// Additive checksum over `data`
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &byte| acc.wrapping_add(byte))
}

fn verify_checksum(frame: &[u8]) -> Result<(), ParseError> {
    let (body, tail) = frame.split_at(frame.len() - 1);
    let computed = checksum(body);
    if computed == tail[0] {
        Ok(())
    } else {
        Err(ParseError::ChecksumMismatch {
            received: tail[0],
            computed,
        })
    }
}

/// `[command] [length] [protocol type] [payload..] [checksum]`
fn build_message(command: u8, protocol_type: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() + 4;
    let mut msg = Vec::with_capacity(len);
    msg.push(command);
    msg.push(len as u8);
    msg.push(protocol_type);
    msg.extend_from_slice(payload);
    msg.push(checksum(&msg));
    msg
}

/// Seconds on the scale clock for a Unix timestamp
pub fn scale_seconds(unix_timestamp: i64) -> u32 {
    (unix_timestamp - SCALE_EPOCH_OFFSET).clamp(0, i64::from(u32::MAX)) as u32
}

/// Build the bytes for a command
pub fn build_command(kind: CommandKind) -> Vec<u8> {
    match kind {
        CommandKind::WeightRequest {
            unit,
            protocol_type,
        } => weight_request(unit, protocol_type),
        CommandKind::TimeSync { timestamp } => {
            let mut msg = Vec::with_capacity(6);
            msg.push(command::TIME_SYNC);
            msg.extend_from_slice(&scale_seconds(timestamp).to_le_bytes());
            msg.push(checksum(&msg));
            msg
        }
        CommandKind::Ack {
            kind,
            protocol_type,
            unit,
        } => match kind {
            AckKind::ScaleSettings => weight_request(unit, protocol_type),
            AckKind::Request14 => {
                build_message(command::REPLY_14, protocol_type, &[0x25, 0x74, 0x18, 0x30])
            }
            AckKind::Request21 => build_message(
                command::REPLY_21,
                0x02,
                &[0xFE, 0xFF, 0xEE, 0x01, 0x1C, 0x06, 0x86, 0x03, 0x02],
            ),
            AckKind::RequestA1 => build_message(command::REPLY_A1, protocol_type, &[0x00, 0x01]),
        },
    }
}

fn weight_request(unit: WeightUnit, protocol_type: u8) -> Vec<u8> {
    build_message(
        command::WEIGHT_REQUEST,
        protocol_type,
        &[unit.protocol_byte(), 0x10, 0x00, 0x00, 0x00],
    )
}

fn read_u16_be(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

fn resistance(raw: u16) -> Option<u16> {
    (!NO_CONTACT_SENTINELS.contains(&raw)).then_some(raw)
}

/// Impedance in ohms for a raw resistance reading
pub fn impedance_from_resistance(resistance: u16) -> f64 {
    if resistance < RESISTANCE_FLOOR {
        IMPEDANCE_FLOOR_OHMS
    } else {
        0.3 * (f64::from(resistance) - 400.0)
    }
}

/// Validate and decode a notification
///
/// # Weight Frame (command 0x10)
///
/// ```text
/// protocol type != 0xFF        protocol type == 0xFF
/// [3-4]  : weight (u16 BE)     [4]    : stability
/// [5]    : stability           [5-6]  : weight (u16 BE)
/// [6-7]  : resistance 1        [7-8]  : resistance 1
/// [8-9]  : resistance 2        [9-10] : resistance 2
/// final marker = 1             final marker = 2
/// ```
///
/// A stability byte of 0 marks a transient reading.
pub fn parse_notification(
    source: CharacteristicId,
    bytes: &[u8],
    weight_scale: WeightScale,
) -> Result<ParsedFrame, ParseError> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(ParseError::FrameTooShort {
            expected: MIN_FRAME_LEN,
            actual: bytes.len(),
        });
    }

    let command = bytes[0];
    let protocol_type = bytes[2];

    if source == CharacteristicId::WeightData && command == command::WEIGHT {
        let expected = WeightLayout::for_protocol(protocol_type).min_len();
        if bytes.len() < expected {
            return Err(ParseError::FrameTooShort {
                expected,
                actual: bytes.len(),
            });
        }
    }

    verify_checksum(bytes)?;

    if source == CharacteristicId::Status {
        return Ok(ParsedFrame::Status(StatusFrame {
            kind: StatusKind::Indication { command },
            protocol_type,
        }));
    }

    let status = |kind: StatusKind| -> Result<ParsedFrame, ParseError> {
        Ok(ParsedFrame::Status(StatusFrame {
            kind,
            protocol_type,
        }))
    };

    match command {
        command::WEIGHT => parse_weight(bytes, protocol_type, weight_scale),
        command::SCALE_SETTINGS => {
            // Precision flag sits right before the checksum on long frames
            let weight_scale =
                (bytes.len() > 11).then(|| WeightScale::from_settings_flag(bytes[10]));
            status(StatusKind::ScaleSettings { weight_scale })
        }
        command::REQUEST_14 => status(StatusKind::Request14),
        command::REQUEST_21 => status(StatusKind::Request21),
        command::HISTORY => status(StatusKind::History),
        command::REQUEST_A1 => status(StatusKind::RequestA1),
        other => Ok(ParsedFrame::Unknown { command: other }),
    }
}

fn parse_weight(
    bytes: &[u8],
    protocol_type: u8,
    weight_scale: WeightScale,
) -> Result<ParsedFrame, ParseError> {
    let layout = WeightLayout::for_protocol(protocol_type);

    let marker = bytes[layout.stability];
    let stable = if marker == 0 {
        false
    } else if marker == layout.final_marker {
        true
    } else {
        return Err(ParseError::UnknownFrameType(marker));
    };

    let raw_weight = read_u16_be(bytes, layout.weight);
    let primary = resistance(read_u16_be(bytes, layout.resistance));
    let secondary = resistance(read_u16_be(bytes, layout.resistance + 2));

    let measurement = ParsedMeasurement {
        weight_kg: weight_scale.apply(raw_weight),
        raw_weight,
        resistance: primary,
        secondary_resistance: secondary,
        impedance_ohms: primary.map(impedance_from_resistance),
        stable,
        protocol_type,
    };

    Ok(if stable {
        ParsedFrame::Final(measurement)
    } else {
        ParsedFrame::InProgress(measurement)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Append the checksum to a frame body
    fn frame(body: &[u8]) -> Vec<u8> {
        let mut bytes = body.to_vec();
        bytes.push(checksum(body));
        bytes
    }

    fn decode_time_sync(bytes: &[u8]) -> i64 {
        assert_eq!(bytes[0], command::TIME_SYNC);
        let seconds = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        i64::from(seconds) + SCALE_EPOCH_OFFSET
    }

    fn all_commands() -> Vec<CommandKind> {
        let mut kinds = vec![
            CommandKind::WeightRequest {
                unit: WeightUnit::Kg,
                protocol_type: 0x00,
            },
            CommandKind::WeightRequest {
                unit: WeightUnit::Lb,
                protocol_type: 0xFF,
            },
            CommandKind::TimeSync {
                timestamp: 1_700_000_000,
            },
        ];
        for kind in [
            AckKind::ScaleSettings,
            AckKind::Request14,
            AckKind::Request21,
            AckKind::RequestA1,
        ] {
            kinds.push(CommandKind::Ack {
                kind,
                protocol_type: 0x03,
                unit: WeightUnit::Kg,
            });
        }
        kinds
    }

    #[test]
    fn test_uuids() {
        assert_eq!(
            WEIGHT_CHAR_UUID.to_string(),
            "0000ffe1-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            ALT_COMMAND_CHAR_UUID.to_string(),
            "0000fff2-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
        assert_eq!(checksum(&[]), 0x00);
    }

    #[test]
    fn test_every_command_ends_with_checksum() {
        for kind in all_commands() {
            let bytes = build_command(kind);
            let (body, tail) = bytes.split_at(bytes.len() - 1);
            assert_eq!(tail[0], checksum(body), "{kind:?}");
        }
    }

    #[test]
    fn test_weight_request_golden() {
        let bytes = build_command(CommandKind::WeightRequest {
            unit: WeightUnit::Kg,
            protocol_type: 0x00,
        });
        assert_eq!(
            bytes,
            vec![0x13, 0x09, 0x00, 0x01, 0x10, 0x00, 0x00, 0x00, 0x2D]
        );
    }

    #[test]
    fn test_ack_golden() {
        let bytes = build_command(CommandKind::Ack {
            kind: AckKind::RequestA1,
            protocol_type: 0x01,
            unit: WeightUnit::Kg,
        });
        assert_eq!(bytes, vec![0x22, 0x06, 0x01, 0x00, 0x01, 0x2A]);

        let bytes = build_command(CommandKind::Ack {
            kind: AckKind::Request21,
            protocol_type: 0x01,
            unit: WeightUnit::Kg,
        });
        assert_eq!(bytes[..3], [0xA0, 0x0D, 0x02]);
        assert_eq!(bytes.len(), 13);
    }

    #[test]
    fn test_time_sync_round_trip() {
        let timestamp = 1_718_035_200;
        let bytes = build_command(CommandKind::TimeSync { timestamp });
        assert_eq!(bytes.len(), 6);
        assert_eq!(decode_time_sync(&bytes), timestamp);
    }

    #[test]
    fn test_short_frames_rejected() {
        let full = frame(&[0x10, 0x0B, 0x01, 0x1B, 0x58, 0x01, 0x07, 0xD0, 0x07, 0xDA]);
        for len in 0..MIN_FRAME_LEN {
            for source in [CharacteristicId::WeightData, CharacteristicId::Status] {
                assert!(matches!(
                    parse_notification(source, &full[..len], WeightScale::default()),
                    Err(ParseError::FrameTooShort { .. })
                ));
            }
        }
    }

    #[test]
    fn test_truncated_weight_frame_rejected() {
        // Header is valid but the resistance words are missing
        let short = frame(&[0x10, 0x08, 0x01, 0x1B, 0x58, 0x01, 0x07]);
        assert_eq!(
            parse_notification(CharacteristicId::WeightData, &short, WeightScale::default()),
            Err(ParseError::FrameTooShort {
                expected: 11,
                actual: 8
            })
        );
    }

    #[test]
    fn test_corrupted_checksum() {
        let mut bytes = frame(&[0x10, 0x0B, 0x01, 0x1B, 0x58, 0x01, 0x07, 0xD0, 0x07, 0xDA]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0x5A;
        assert!(matches!(
            parse_notification(CharacteristicId::WeightData, &bytes, WeightScale::default()),
            Err(ParseError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_final_weight_standard_layout() {
        // 0x1B58 = 7000 -> 70.00 kg, resistance 0x07D0 = 2000
        let bytes = frame(&[0x10, 0x0B, 0x01, 0x1B, 0x58, 0x01, 0x07, 0xD0, 0x07, 0xDA]);
        let parsed =
            parse_notification(CharacteristicId::WeightData, &bytes, WeightScale::default())
                .unwrap();

        let ParsedFrame::Final(m) = parsed else {
            panic!("expected final frame, got {parsed:?}");
        };
        assert_eq!(m.raw_weight, 7000);
        assert!((m.weight_kg - 70.0).abs() < 1e-9);
        assert_eq!(m.resistance, Some(2000));
        assert_eq!(m.secondary_resistance, Some(2010));
        assert!((m.impedance_ohms.unwrap() - 480.0).abs() < 1e-9);
        assert!(m.stable);
    }

    #[test]
    fn test_in_progress_extended_layout() {
        // Protocol 0xFF: stability at 4, weight at 5
        let bytes = frame(&[
            0x10, 0x0C, 0xFF, 0x00, 0x00, 0x02, 0x9E, 0x05, 0xDC, 0x05, 0xE6,
        ]);
        let parsed =
            parse_notification(CharacteristicId::WeightData, &bytes, WeightScale::TENTHS).unwrap();

        let ParsedFrame::InProgress(m) = parsed else {
            panic!("expected in-progress frame, got {parsed:?}");
        };
        assert!((m.weight_kg - 67.0).abs() < 1e-9);
        assert!(!m.stable);
        assert_eq!(m.protocol_type, 0xFF);
    }

    #[test]
    fn test_extended_final_marker() {
        let bytes = frame(&[
            0x10, 0x0C, 0xFF, 0x00, 0x02, 0x1B, 0x58, 0x05, 0xDC, 0x05, 0xE6,
        ]);
        assert!(matches!(
            parse_notification(CharacteristicId::WeightData, &bytes, WeightScale::default()),
            Ok(ParsedFrame::Final(_))
        ));
    }

    #[test]
    fn test_unknown_stability_marker() {
        let bytes = frame(&[0x10, 0x0B, 0x01, 0x1B, 0x58, 0x07, 0x07, 0xD0, 0x07, 0xDA]);
        assert_eq!(
            parse_notification(CharacteristicId::WeightData, &bytes, WeightScale::default()),
            Err(ParseError::UnknownFrameType(0x07))
        );
    }

    #[test]
    fn test_no_contact_sentinel_is_absent() {
        for sentinel in NO_CONTACT_SENTINELS {
            let [hi, lo] = sentinel.to_be_bytes();
            let bytes = frame(&[0x10, 0x0B, 0x01, 0x1B, 0x58, 0x01, hi, lo, hi, lo]);
            let Ok(ParsedFrame::Final(m)) =
                parse_notification(CharacteristicId::WeightData, &bytes, WeightScale::default())
            else {
                panic!("expected final frame");
            };
            assert_eq!(m.resistance, None);
            assert_eq!(m.impedance_ohms, None);
        }
    }

    #[test]
    fn test_low_resistance_clamped() {
        assert_eq!(impedance_from_resistance(405), 3.0);
        assert!((impedance_from_resistance(2000) - 480.0).abs() < 1e-9);
    }

    #[test]
    fn test_scale_settings_frame() {
        let bytes = frame(&[
            0x12, 0x0C, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ]);
        assert_eq!(
            parse_notification(CharacteristicId::WeightData, &bytes, WeightScale::default()),
            Ok(ParsedFrame::Status(StatusFrame {
                kind: StatusKind::ScaleSettings {
                    weight_scale: Some(WeightScale::TENTHS)
                },
                protocol_type: 0x01,
            }))
        );
    }

    #[test]
    fn test_status_characteristic() {
        let bytes = frame(&[0x14, 0x05, 0x02, 0x00]);
        assert_eq!(
            parse_notification(CharacteristicId::Status, &bytes, WeightScale::default()),
            Ok(ParsedFrame::Status(StatusFrame {
                kind: StatusKind::Indication { command: 0x14 },
                protocol_type: 0x02,
            }))
        );
    }

    #[test]
    fn test_unknown_command() {
        let bytes = frame(&[0x42, 0x04, 0x01]);
        assert_eq!(
            parse_notification(CharacteristicId::WeightData, &bytes, WeightScale::default()),
            Ok(ParsedFrame::Unknown { command: 0x42 })
        );
    }

    #[test]
    fn test_parse_is_idempotent() {
        let bytes = frame(&[0x10, 0x0B, 0x01, 0x1B, 0x58, 0x00, 0x07, 0xD0, 0x07, 0xDA]);
        let first = parse_notification(CharacteristicId::WeightData, &bytes, WeightScale::default());
        let second =
            parse_notification(CharacteristicId::WeightData, &bytes, WeightScale::default());
        assert_eq!(first, second);
    }

    #[test]
    fn test_alternative_profile() {
        let profile = GattProfile::Alternative;
        assert_eq!(profile.subscriptions(), vec![ALT_WEIGHT_CHAR_UUID]);
        assert_eq!(profile.weight_scale(WeightScale::HUNDREDTHS).divisor(), 1000.0);
        assert_eq!(
            GattProfile::Primary.characteristic_id(STATUS_CHAR_UUID),
            Some(CharacteristicId::Status)
        );
        assert_eq!(profile.characteristic_id(STATUS_CHAR_UUID), None);
    }

    #[test]
    fn test_detect_profile() {
        let older = [ALT_SERVICE_UUID, ALT_WEIGHT_CHAR_UUID, ALT_COMMAND_CHAR_UUID];
        assert_eq!(
            GattProfile::detect(|uuid| older.contains(&uuid)),
            GattProfile::Alternative
        );

        let both = [WEIGHT_CHAR_UUID, TIME_SYNC_CHAR_UUID, ALT_WEIGHT_CHAR_UUID];
        assert_eq!(
            GattProfile::detect(|uuid| both.contains(&uuid)),
            GattProfile::Primary
        );

        // Nothing recognizable: the primary layout fails loudly at subscribe
        assert_eq!(GattProfile::detect(|_| false), GattProfile::Primary);
    }
}

// MIT License - Copyright (c) 2026 Peter Wright

//! Omni wire protocol constants and message builders.

use crate::command::{ArmMode, TempScale};
use crate::model::UnitKind;

/// Outer packet types (application envelope).
pub mod packet {
    pub const NEW_SESSION_REQ: u8 = 0x01;
    pub const NEW_SESSION_ACK: u8 = 0x02;
    pub const SECURE_SESSION_REQ: u8 = 0x03;
    pub const SECURE_SESSION_ACK: u8 = 0x04;
    pub const CLIENT_SESSION_TERMINATED: u8 = 0x05;
    pub const CONTROLLER_SESSION_TERMINATED: u8 = 0x06;
    pub const NEW_SESSION_NAK: u8 = 0x07;
    pub const OMNI_MESSAGE: u8 = 0x20;
}

/// Inner message types (inside the encrypted payload).
pub mod msg {
    pub const ACK: u8 = 0x01;
    pub const NAK: u8 = 0x02;
    pub const END_OF_DATA: u8 = 0x03;
    pub const READ_NAME: u8 = 0x0D;
    pub const NAME_DATA: u8 = 0x0E;
    pub const SEND_CMD: u8 = 0x14;
    pub const ENABLE_NOTIFY: u8 = 0x15;
    pub const SYS_INFO_REQ: u8 = 0x16;
    pub const SYS_INFO_REPLY: u8 = 0x17;
    pub const SYS_STATUS_REQ: u8 = 0x18;
    pub const SYS_STATUS_REPLY: u8 = 0x19;
    pub const OBJ_CAP_REQ: u8 = 0x1E;
    pub const OBJ_CAP_REPLY: u8 = 0x1F;
    pub const OBJ_PROP_REQ: u8 = 0x20;
    pub const OBJ_PROP_REPLY: u8 = 0x21;
    pub const VALIDATE_CODE_REQ: u8 = 0x26;
    pub const VALIDATE_CODE_REPLY: u8 = 0x27;
    pub const OTHER_NOTIFICATIONS: u8 = 0x37;
    pub const EXT_OBJ_STATUS_REQ: u8 = 0x3A;
    pub const EXT_OBJ_STATUS_REPLY: u8 = 0x3B;
}

/// Panel object types used in capacity, property and status messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjType {
    Zone = 1,
    Unit = 2,
    Button = 3,
    Code = 4,
    Area = 5,
    Thermostat = 6,
    AuxSensor = 8,
    Lock = 9,
}

impl ObjType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Zone),
            2 => Some(Self::Unit),
            3 => Some(Self::Button),
            4 => Some(Self::Code),
            5 => Some(Self::Area),
            6 => Some(Self::Thermostat),
            8 => Some(Self::AuxSensor),
            9 => Some(Self::Lock),
            _ => None,
        }
    }

    /// The unit kind this object type maps to in the device model, when it
    /// has one (buttons and codes are not model units).
    pub fn unit_kind(&self) -> Option<UnitKind> {
        match self {
            Self::Zone => Some(UnitKind::Zone),
            Self::Unit => Some(UnitKind::Switch),
            Self::Area => Some(UnitKind::Area),
            Self::Thermostat => Some(UnitKind::Thermostat),
            Self::AuxSensor => Some(UnitKind::Sensor),
            Self::Lock => Some(UnitKind::Lock),
            Self::Button | Self::Code => None,
        }
    }

    pub fn from_unit_kind(kind: UnitKind) -> Option<Self> {
        match kind {
            UnitKind::Zone => Some(Self::Zone),
            UnitKind::Switch => Some(Self::Unit),
            UnitKind::Area => Some(Self::Area),
            UnitKind::Thermostat => Some(Self::Thermostat),
            UnitKind::Sensor => Some(Self::AuxSensor),
            UnitKind::Lock => Some(Self::Lock),
            UnitKind::Controller => None,
        }
    }

    /// Extended status record length for this object type.
    pub fn status_record_len(&self) -> usize {
        match self {
            Self::Zone => 4,
            Self::Unit => 5,
            Self::Area => 5,
            Self::Thermostat => 9,
            Self::AuxSensor => 5,
            Self::Lock => 3,
            Self::Button | Self::Code => 2,
        }
    }

    /// Poll batch size: units of this type fetched per status request.
    pub fn poll_block_size(&self) -> u16 {
        match self {
            Self::Thermostat => 4,
            _ => 8,
        }
    }
}

/// Command codes for `SEND_CMD`.
pub mod cmd {
    pub const UNIT_OFF: u8 = 0;
    pub const UNIT_ON: u8 = 1;
    pub const UNIT_PERCENT: u8 = 9;
    pub const BYPASS_ZONE: u8 = 4;
    pub const RESTORE_ZONE: u8 = 5;
    pub const AREA_DISARM: u8 = 48;
    pub const AREA_ARM_DAY: u8 = 49;
    pub const AREA_ARM_NIGHT: u8 = 50;
    pub const AREA_ARM_AWAY: u8 = 51;
    pub const AREA_ARM_VACATION: u8 = 52;
    pub const SET_HEAT_SETPOINT: u8 = 66;
    pub const SET_COOL_SETPOINT: u8 = 67;
    pub const LOCK_DOOR: u8 = 105;
    pub const UNLOCK_DOOR: u8 = 106;
}

impl ArmMode {
    pub fn omni_command(&self) -> u8 {
        match self {
            Self::Disarm => cmd::AREA_DISARM,
            Self::Day => cmd::AREA_ARM_DAY,
            Self::Night => cmd::AREA_ARM_NIGHT,
            Self::Away => cmd::AREA_ARM_AWAY,
            Self::Vacation => cmd::AREA_ARM_VACATION,
        }
    }
}

/// Area arm-mode bytes. 0..=6 are settled states; the same mode while the
/// exit delay runs is reported with an offset of 8 (9..=14).
pub const ARM_DISARMED: u8 = 0;
const ARM_TRANSITIONAL_OFFSET: u8 = 8;

/// Whether an arm mode byte is a settled (non-transitional) state.
pub fn arm_mode_is_settled(mode: u8) -> bool {
    mode < ARM_TRANSITIONAL_OFFSET
}

/// Strip the transitional offset, yielding the target settled mode.
pub fn arm_mode_target(mode: u8) -> u8 {
    if mode >= ARM_TRANSITIONAL_OFFSET { mode - ARM_TRANSITIONAL_OFFSET } else { mode }
}

/// One logical Omni message: type byte plus data bytes. The codec wraps it
/// in `STX, length, type, data, CRC` and encrypts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: u8,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(msg_type: u8, data: Vec<u8>) -> Self {
        Self { msg_type, data }
    }

    pub fn bare(msg_type: u8) -> Self {
        Self { msg_type, data: Vec::new() }
    }

    pub fn u16_at(&self, offset: usize) -> Option<u16> {
        let hi = *self.data.get(offset)?;
        let lo = *self.data.get(offset + 1)?;
        Some(u16::from_be_bytes([hi, lo]))
    }
}

pub fn sys_info_req() -> Message {
    Message::bare(msg::SYS_INFO_REQ)
}

pub fn sys_status_req() -> Message {
    Message::bare(msg::SYS_STATUS_REQ)
}

pub fn enable_notifications(enable: bool) -> Message {
    Message::new(msg::ENABLE_NOTIFY, vec![u8::from(enable)])
}

pub fn obj_capacity_req(obj: ObjType) -> Message {
    Message::new(msg::OBJ_CAP_REQ, vec![obj as u8])
}

pub fn obj_properties_req(obj: ObjType, id: u16) -> Message {
    let [hi, lo] = id.to_be_bytes();
    Message::new(msg::OBJ_PROP_REQ, vec![obj as u8, hi, lo])
}

pub fn ext_status_req(obj: ObjType, from: u16, to: u16) -> Message {
    let [fh, fl] = from.to_be_bytes();
    let [th, tl] = to.to_be_bytes();
    Message::new(msg::EXT_OBJ_STATUS_REQ, vec![obj as u8, fh, fl, th, tl])
}

pub fn send_cmd(command: u8, param1: u8, param2: u16) -> Message {
    let [hi, lo] = param2.to_be_bytes();
    Message::new(msg::SEND_CMD, vec![command, param1, hi, lo])
}

/// Validate-code request: area plus the four code digits as nibble bytes.
pub fn validate_code_req(area: u8, code: &str) -> Option<Message> {
    if code.len() != 4 || !code.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let mut data = vec![area];
    data.extend(code.bytes().map(|b| b - b'0'));
    Some(Message::new(msg::VALIDATE_CODE_REQ, data))
}

/// Panel temperature encoding: 0..=255 covers -40.0C to 87.5C in half
/// degree steps.
pub fn omni_temp_to_half_c(raw: u8) -> i16 {
    raw as i16 - 80
}

/// Convert a user setpoint to the panel byte.
pub fn setpoint_to_omni_temp(degrees: i16, scale: TempScale) -> u8 {
    let half_c: i32 = match scale {
        TempScale::Celsius => degrees as i32 * 2,
        // round to the nearest half degree C
        TempScale::Fahrenheit => ((degrees as i32 - 32) * 10 + 4) / 9,
    };
    (half_c + 80).clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obj_kind_mapping_roundtrip() {
        for obj in [ObjType::Zone, ObjType::Unit, ObjType::Area, ObjType::Thermostat, ObjType::AuxSensor, ObjType::Lock] {
            let kind = obj.unit_kind().unwrap();
            assert_eq!(ObjType::from_unit_kind(kind), Some(obj));
        }
        assert!(ObjType::Button.unit_kind().is_none());
    }

    #[test]
    fn arm_mode_settlement() {
        assert!(arm_mode_is_settled(0));
        assert!(arm_mode_is_settled(3));
        assert!(!arm_mode_is_settled(11));
        assert_eq!(arm_mode_target(11), 3);
        assert_eq!(arm_mode_target(3), 3);
    }

    #[test]
    fn validate_code_shape() {
        let m = validate_code_req(1, "1234").unwrap();
        assert_eq!(m.data, vec![1, 1, 2, 3, 4]);
        assert!(validate_code_req(1, "12a4").is_none());
        assert!(validate_code_req(1, "123").is_none());
    }

    #[test]
    fn temp_conversion() {
        // 0C == raw 80, 22C == raw 124
        assert_eq!(omni_temp_to_half_c(80), 0);
        assert_eq!(setpoint_to_omni_temp(22, TempScale::Celsius), 124);
    }

    #[test]
    fn ext_status_request_layout() {
        let m = ext_status_req(ObjType::Zone, 1, 8);
        assert_eq!(m.msg_type, msg::EXT_OBJ_STATUS_REQ);
        assert_eq!(m.data, vec![1, 0, 1, 0, 8]);
    }
}

// MIT License - Copyright (c) 2026 Peter Wright

//! VRCOP ASCII line protocol: command classes and line builders.
//!
//! Outbound lines are bare bodies; the codec adds the `>` prompt and CR.
//! Class and command numbers appear in decimal on the wire.

use crate::command::SetpointKind;
use crate::model::{UnitCaps, UnitKind};

/// Command classes understood by the dongle.
pub mod class {
    pub const BASIC: u16 = 32;
    pub const BINARY_SWITCH: u16 = 37;
    pub const SCENE_ACTIVATION: u16 = 43;
    pub const MULTILEVEL_SWITCH: u16 = 38;
    pub const BINARY_SENSOR: u16 = 48;
    pub const MULTILEVEL_SENSOR: u16 = 49;
    pub const THERMOSTAT_SETPOINT: u16 = 67;
    pub const DOOR_LOCK: u16 = 98;
}

/// Commands within a class.
pub mod op {
    pub const SET: u16 = 1;
    pub const GET: u16 = 2;
    pub const REPORT: u16 = 3;
}

pub const SETPOINT_HEAT: u16 = 1;
pub const SETPOINT_COOL: u16 = 2;

impl SetpointKind {
    pub fn vrcop_selector(&self) -> u16 {
        match self {
            Self::Heat => SETPOINT_HEAT,
            Self::Cool => SETPOINT_COOL,
        }
    }
}

/// One scannable device class: wire class, the model kind it creates, its
/// capabilities and the getters cycled through when polling.
pub struct ScanClass {
    pub class: u16,
    pub kind: UnitKind,
    pub caps: UnitCaps,
    pub getters: &'static [Getter],
}

/// A poll getter variant for one unit kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Getter {
    Basic,
    BinarySensor,
    MultilevelSensor,
    Setpoint(u16),
    Lock,
}

impl Getter {
    pub fn line(&self, node: u16) -> String {
        match self {
            Self::Basic => format!("N{}SE{},{}", node, class::BASIC, op::GET),
            Self::BinarySensor => format!("N{}SE{},{}", node, class::BINARY_SENSOR, op::GET),
            Self::MultilevelSensor => {
                format!("N{}SE{},{}", node, class::MULTILEVEL_SENSOR, op::GET)
            }
            Self::Setpoint(which) => {
                format!("N{}SE{},{},{}", node, class::THERMOSTAT_SETPOINT, op::GET, which)
            }
            Self::Lock => format!("N{}SE{},{}", node, class::DOOR_LOCK, op::GET),
        }
    }
}

/// Classes probed during enumeration, in scan order. A node answering for
/// more than one class keeps the first match and gains the capabilities of
/// the later ones.
pub fn scan_classes() -> [ScanClass; 6] {
    [
        ScanClass {
            class: class::MULTILEVEL_SWITCH,
            kind: UnitKind::Switch,
            caps: UnitCaps::READABLE.union(UnitCaps::WRITABLE).union(UnitCaps::ASYNC_NOTIFY),
            getters: &[Getter::Basic],
        },
        ScanClass {
            class: class::BINARY_SWITCH,
            kind: UnitKind::Switch,
            caps: UnitCaps::READABLE.union(UnitCaps::WRITABLE).union(UnitCaps::ASYNC_NOTIFY),
            getters: &[Getter::Basic],
        },
        ScanClass {
            class: class::DOOR_LOCK,
            kind: UnitKind::Lock,
            caps: UnitCaps::READABLE
                .union(UnitCaps::WRITABLE)
                .union(UnitCaps::ASYNC_NOTIFY)
                .union(UnitCaps::SECURE),
            getters: &[Getter::Lock],
        },
        ScanClass {
            class: class::THERMOSTAT_SETPOINT,
            kind: UnitKind::Thermostat,
            caps: UnitCaps::READABLE.union(UnitCaps::WRITABLE),
            getters: &[
                Getter::Setpoint(SETPOINT_HEAT),
                Getter::Setpoint(SETPOINT_COOL),
                Getter::MultilevelSensor,
            ],
        },
        ScanClass {
            class: class::MULTILEVEL_SENSOR,
            kind: UnitKind::Sensor,
            caps: UnitCaps::READABLE.union(UnitCaps::ASYNC_NOTIFY),
            getters: &[Getter::MultilevelSensor],
        },
        // battery powered; reports arrive unsolicited, never polled
        ScanClass {
            class: class::BINARY_SENSOR,
            kind: UnitKind::Sensor,
            caps: UnitCaps::READABLE.union(UnitCaps::ASYNC_NOTIFY).union(UnitCaps::BATTERY),
            getters: &[],
        },
    ]
}

/// The getter cycle for a unit kind (used by the poll loop).
pub fn getters_for(kind: UnitKind) -> &'static [Getter] {
    match kind {
        UnitKind::Switch => &[Getter::Basic],
        UnitKind::Lock => &[Getter::Lock],
        UnitKind::Thermostat => &[
            Getter::Setpoint(SETPOINT_HEAT),
            Getter::Setpoint(SETPOINT_COOL),
            Getter::MultilevelSensor,
        ],
        UnitKind::Sensor => &[Getter::MultilevelSensor],
        _ => &[],
    }
}

/// Per-id, per-class existence query.
pub fn exists_query(node: u16, class: u16) -> String {
    format!("?N{},{}", node, class)
}

pub fn switch_on(node: u16) -> String {
    format!("N{}ON", node)
}

pub fn switch_off(node: u16) -> String {
    format!("N{}OF", node)
}

pub fn switch_level(node: u16, level: u8) -> String {
    format!("N{}L{}", node, level)
}

pub fn group_on(group: u16) -> String {
    format!("GR{}ON", group)
}

pub fn group_off(group: u16) -> String {
    format!("GR{}OF", group)
}

pub fn lock_set(node: u16, locked: bool) -> String {
    format!("N{}SE{},{},{}", node, class::DOOR_LOCK, op::SET, if locked { 255 } else { 0 })
}

/// Setpoint set, in half-degrees Celsius (converted to whole degrees F on
/// the wire, which is what the dongle's thermostats speak).
pub fn setpoint_set(node: u16, which: u16, half_c: i16) -> String {
    format!(
        "N{}SE{},{},{},{}",
        node,
        class::THERMOSTAT_SETPOINT,
        op::SET,
        which,
        half_c_to_f(half_c)
    )
}

pub fn half_c_to_f(half_c: i16) -> i16 {
    (half_c as i32 * 9 / 10 + 32) as i16
}

pub fn f_to_half_c(f: i16) -> i16 {
    ((f as i32 - 32) * 10 / 9) as i16
}

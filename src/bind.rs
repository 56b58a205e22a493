// MIT License - Copyright (c) 2026 Peter Wright

//! Field binding conventions shared by both drivers.
//!
//! Each unit kind binds a fixed, ordered set of host fields; dispatchers
//! index into `unit.fields` with the constants below. Index 0 is always
//! the lifecycle status field. Temperatures are stored in half-degrees
//! Celsius.

use crate::error::Result;
use crate::field::{FieldDef, FieldKind, FieldStore};
use crate::model::{Unit, UnitKind};

pub const F_STATUS: usize = 0;
pub const ZONE_F_CONDITION: usize = 1;
pub const ZONE_F_ARMED: usize = 2;
pub const ZONE_F_ALARM: usize = 3;
pub const ZONE_F_ANALOG: usize = 4;
pub const ZONE_F_BYPASSED: usize = 5;
pub const SWITCH_F_ON: usize = 1;
pub const SWITCH_F_LEVEL: usize = 2;
pub const AREA_F_ARM_MODE: usize = 1;
pub const AREA_F_ALARM_BITS: usize = 2;
pub const THERMO_F_TEMP: usize = 1;
pub const THERMO_F_HEAT: usize = 2;
pub const THERMO_F_COOL: usize = 3;
pub const THERMO_F_MODE: usize = 4;
pub const THERMO_F_FAN: usize = 5;
pub const THERMO_F_HOLD: usize = 6;
pub const SENSOR_F_VALUE: usize = 1;
pub const SENSOR_F_ACTIVE: usize = 2;
pub const LOCK_F_LOCKED: usize = 1;

/// Register the field set for a unit and record the ids on the unit.
pub fn register_unit_fields(store: &mut dyn FieldStore, unit: &mut Unit) -> Result<()> {
    let base = format!("{}.{}", unit.kind().as_str(), unit.name);
    let f = |suffix: &str, kind, writable| FieldDef::new(format!("{}.{}", base, suffix), kind, writable);
    let defs = match unit.kind() {
        UnitKind::Zone => vec![
            f("Status", FieldKind::Str, false),
            f("Condition", FieldKind::Str, false),
            f("Armed", FieldKind::Bool, false),
            f("Alarm", FieldKind::Bool, false),
            f("Analog", FieldKind::Card, false),
            f("Bypassed", FieldKind::Bool, false),
        ],
        UnitKind::Switch => vec![
            f("Status", FieldKind::Str, false),
            f("On", FieldKind::Bool, true),
            f("Level", FieldKind::Card, true),
        ],
        UnitKind::Area => vec![
            f("Status", FieldKind::Str, false),
            f("ArmMode", FieldKind::Str, false),
            f("AlarmBits", FieldKind::Card, false),
        ],
        UnitKind::Thermostat => vec![
            f("Status", FieldKind::Str, false),
            f("Temp", FieldKind::Int, false),
            f("HeatSetpoint", FieldKind::Int, true),
            f("CoolSetpoint", FieldKind::Int, true),
            f("Mode", FieldKind::Card, false),
            f("FanOn", FieldKind::Bool, false),
            f("Hold", FieldKind::Bool, false),
        ],
        UnitKind::Sensor => vec![
            f("Status", FieldKind::Str, false),
            f("Value", FieldKind::Int, false),
            f("Active", FieldKind::Bool, false),
        ],
        UnitKind::Lock => vec![
            f("Status", FieldKind::Str, false),
            f("Locked", FieldKind::Bool, true),
        ],
        UnitKind::Controller => vec![f("Status", FieldKind::Str, false)],
    };
    unit.fields = store.register_fields(&defs)?;
    Ok(())
}

// MIT License - Copyright (c) 2026 Peter Wright

//! The in-memory catalog of configured units.
//!
//! One `Unit` per controllable or observable endpoint. The per-kind payload
//! lives in a closed sum type rather than a subclass hierarchy; shared
//! identity, capability and freshness state lives in the common record.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::error::{DriverError, Result};
use crate::field::FieldId;

bitflags! {
    /// Capability flags for a unit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnitCaps: u8 {
        const READABLE      = 0b0000_0001;
        const WRITABLE      = 0b0000_0010;
        /// Device pushes unsolicited status for this unit.
        const ASYNC_NOTIFY  = 0b0000_0100;
        /// Battery powered; never polled (would wake the radio).
        const BATTERY       = 0b0000_1000;
        /// Commands to this unit must go over the secure session.
        const SECURE        = 0b0001_0000;
    }
}

/// Unit lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Ready,
    /// Stale past threshold or a malformed reply; recoverable.
    Error,
    /// Not found during the last rescan.
    Missing,
    /// Field bindings could not be established; permanent until the next
    /// full reconfiguration.
    Failed,
}

impl UnitStatus {
    /// Whether the poll scheduler may select this unit.
    pub fn is_viable(&self) -> bool {
        matches!(self, Self::Ready | Self::Error)
    }
}

/// Kind of unit. Covers both drivers' taxonomies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UnitKind {
    Zone,
    Area,
    Thermostat,
    Switch,
    Lock,
    Sensor,
    Controller,
}

impl UnitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zone => "Zone",
            Self::Area => "Area",
            Self::Thermostat => "Thermostat",
            Self::Switch => "Switch",
            Self::Lock => "Lock",
            Self::Sensor => "Sensor",
            Self::Controller => "Controller",
        }
    }
}

/// Kind-specific state.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitData {
    Zone {
        /// Owning area id (Omni), 0 when unassigned.
        area: u16,
        /// Raw condition byte from the last status report.
        condition: u8,
        /// Analog loop reading.
        analog: u8,
        bypassed: bool,
        armed: bool,
        in_alarm: bool,
    },
    Area {
        /// Settled or transitional arm mode byte.
        arm_mode: u8,
        alarm_bits: u16,
    },
    Thermostat {
        temp: i16,
        heat_setpoint: i16,
        cool_setpoint: i16,
        mode: u8,
        fan_on: bool,
        hold: bool,
    },
    Switch {
        level: u8,
        on: bool,
    },
    Lock {
        locked: bool,
    },
    Sensor {
        value: i16,
        active: bool,
    },
    Controller,
}

impl UnitData {
    /// Fresh payload for a kind, all-default.
    pub fn new(kind: UnitKind) -> Self {
        match kind {
            UnitKind::Zone => Self::Zone {
                area: 0,
                condition: 0,
                analog: 0,
                bypassed: false,
                armed: false,
                in_alarm: false,
            },
            UnitKind::Area => Self::Area { arm_mode: 0, alarm_bits: 0 },
            UnitKind::Thermostat => Self::Thermostat {
                temp: 0,
                heat_setpoint: 0,
                cool_setpoint: 0,
                mode: 0,
                fan_on: false,
                hold: false,
            },
            UnitKind::Switch => Self::Switch { level: 0, on: false },
            UnitKind::Lock => Self::Lock { locked: false },
            UnitKind::Sensor => Self::Sensor { value: 0, active: false },
            UnitKind::Controller => Self::Controller,
        }
    }

    pub fn kind(&self) -> UnitKind {
        match self {
            Self::Zone { .. } => UnitKind::Zone,
            Self::Area { .. } => UnitKind::Area,
            Self::Thermostat { .. } => UnitKind::Thermostat,
            Self::Switch { .. } => UnitKind::Switch,
            Self::Lock { .. } => UnitKind::Lock,
            Self::Sensor { .. } => UnitKind::Sensor,
            Self::Controller => UnitKind::Controller,
        }
    }
}

/// One configured unit.
#[derive(Debug, Clone)]
pub struct Unit {
    pub id: u16,
    pub name: String,
    pub caps: UnitCaps,
    pub enabled: bool,
    /// Zero means never polled.
    pub poll_period: Duration,
    pub status: UnitStatus,
    pub last_poll: Option<Instant>,
    pub last_value: Option<Instant>,
    pub fields: Vec<FieldId>,
    /// Round-robin index over the unit's get-message variants (VRCOP).
    pub poll_cursor: u8,
    pub data: UnitData,
}

impl Unit {
    pub fn new(kind: UnitKind, id: u16, name: impl Into<String>) -> Self {
        Self {
            id,
            name: normalize_name(&name.into()),
            caps: UnitCaps::READABLE,
            enabled: true,
            poll_period: Duration::ZERO,
            status: UnitStatus::Ready,
            last_poll: None,
            last_value: None,
            fields: Vec::new(),
            poll_cursor: 0,
            data: UnitData::new(kind),
        }
    }

    pub fn kind(&self) -> UnitKind {
        self.data.kind()
    }

    /// Whether the scheduler may ever poll this unit.
    pub fn is_pollable(&self) -> bool {
        self.enabled
            && self.caps.contains(UnitCaps::READABLE)
            && !self.caps.contains(UnitCaps::BATTERY)
            && !self.poll_period.is_zero()
            && self.status.is_viable()
    }

    /// The instant this unit next becomes due. `None` means due immediately
    /// (never polled).
    pub fn next_poll_at(&self) -> Option<Instant> {
        self.last_poll.map(|t| t + self.poll_period)
    }

    /// Whether the unit has gone stale past `multiple` times its own period.
    pub fn is_stale(&self, now: Instant, multiple: u32) -> bool {
        if self.poll_period.is_zero() {
            return false;
        }
        match self.last_value {
            Some(t) => now.duration_since(t) > self.poll_period * multiple,
            // Never heard from: stale once a full threshold has elapsed
            // since the first poll attempt.
            None => match self.last_poll {
                Some(t) => now.duration_since(t) > self.poll_period * multiple,
                None => false,
            },
        }
    }
}

/// Normalize a display name to the allowed character set: alphanumerics,
/// space, dash, underscore and dot; trimmed; other characters dropped.
pub fn normalize_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// The full configured set of units for one driver instance.
///
/// Mutated only by the single connection-owning task; no interior locking.
#[derive(Debug, Default)]
pub struct DeviceModel {
    units: BTreeMap<(UnitKind, u16), Unit>,
    /// Configured maximum item number per kind, from device capacity
    /// queries or the scan bound. Zero means the kind is absent.
    capacities: BTreeMap<UnitKind, u16>,
}

impl DeviceModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a unit. Item number 0 is reserved on both wire protocols;
    /// rejects it along with a duplicate identity or a duplicate name
    /// within the unit's kind.
    pub fn add(&mut self, unit: Unit) -> Result<()> {
        let kind = unit.kind();
        if unit.id == 0 {
            return Err(DriverError::malformed(format!(
                "{} item number 0 is reserved",
                kind.as_str()
            )));
        }
        if self.units.contains_key(&(kind, unit.id)) {
            return Err(DriverError::DuplicateUnit {
                details: format!("{} {} already configured", kind.as_str(), unit.id),
            });
        }
        if !unit.name.is_empty()
            && self
                .units_of(kind)
                .any(|u| u.name.eq_ignore_ascii_case(&unit.name))
        {
            return Err(DriverError::DuplicateUnit {
                details: format!("{} name '{}' already in use", kind.as_str(), unit.name),
            });
        }
        self.units.insert((kind, unit.id), unit);
        Ok(())
    }

    pub fn remove(&mut self, kind: UnitKind, id: u16) -> Option<Unit> {
        self.units.remove(&(kind, id))
    }

    pub fn get(&self, kind: UnitKind, id: u16) -> Option<&Unit> {
        self.units.get(&(kind, id))
    }

    pub fn get_mut(&mut self, kind: UnitKind, id: u16) -> Option<&mut Unit> {
        self.units.get_mut(&(kind, id))
    }

    pub fn lookup_by_name(&self, kind: UnitKind, name: &str) -> Option<&Unit> {
        let wanted = normalize_name(name);
        self.units_of(kind).find(|u| u.name.eq_ignore_ascii_case(&wanted))
    }

    pub fn units_of(&self, kind: UnitKind) -> impl Iterator<Item = &Unit> {
        self.units
            .range((kind, 0)..=(kind, u16::MAX))
            .map(|(_, u)| u)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Unit> {
        self.units.values_mut()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Configured maximum item number for a kind (0 = none configured).
    pub fn capacity(&self, kind: UnitKind) -> u16 {
        self.capacities.get(&kind).copied().unwrap_or(0)
    }

    pub fn set_capacity(&mut self, kind: UnitKind, max: u16) {
        self.capacities.insert(kind, max);
    }

    /// Validate a device-referenced item number against the configured
    /// maximum for its kind. Zero or out-of-range is invalid.
    pub fn item_in_range(&self, kind: UnitKind, id: u16) -> bool {
        id != 0 && id <= self.capacity(kind)
    }

    /// Mark everything Missing and reset freshness, ahead of a rescan.
    pub fn prepare_for_rescan(&mut self) {
        for unit in self.units.values_mut() {
            unit.status = UnitStatus::Missing;
            unit.last_poll = None;
            unit.last_value = None;
        }
    }

    /// Units due for polling at `now`, most overdue first.
    ///
    /// Never-polled units sort ahead of everything else. Ties are broken by
    /// model order, which is arbitrary but stable.
    pub fn due_for_poll(&self, now: Instant) -> Vec<(UnitKind, u16)> {
        let mut due: Vec<(Option<Instant>, UnitKind, u16)> = self
            .units
            .values()
            .filter(|u| u.is_pollable())
            .filter(|u| match u.next_poll_at() {
                Some(next) => next <= now,
                None => true,
            })
            .map(|u| (u.next_poll_at(), u.kind(), u.id))
            .collect();
        due.sort_by_key(|(next, _, _)| *next);
        due.into_iter().map(|(_, kind, id)| (kind, id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pollable(kind: UnitKind, id: u16, name: &str, period_secs: u64) -> Unit {
        let mut u = Unit::new(kind, id, name);
        u.poll_period = Duration::from_secs(period_secs);
        u
    }

    #[test]
    fn add_rejects_duplicate_id() {
        let mut model = DeviceModel::new();
        model.add(Unit::new(UnitKind::Zone, 1, "Front Door")).unwrap();
        assert!(model.add(Unit::new(UnitKind::Zone, 1, "Other")).is_err());
        // Same id under another kind is a different identity
        model.add(Unit::new(UnitKind::Switch, 1, "Lamp")).unwrap();
    }

    #[test]
    fn add_rejects_item_number_zero() {
        let mut model = DeviceModel::new();
        assert!(model.add(Unit::new(UnitKind::Switch, 0, "Ghost")).is_err());
    }

    #[test]
    fn add_rejects_duplicate_name_within_kind() {
        let mut model = DeviceModel::new();
        model.add(Unit::new(UnitKind::Zone, 1, "Front Door")).unwrap();
        assert!(model.add(Unit::new(UnitKind::Zone, 2, "front door")).is_err());
        // Same name under another kind is fine
        model.add(Unit::new(UnitKind::Switch, 2, "Front Door")).unwrap();
    }

    #[test]
    fn name_normalization() {
        assert_eq!(normalize_name("  Living\tRoom! "), "LivingRoom");
        assert_eq!(normalize_name("Lamp_1-a.b"), "Lamp_1-a.b");
    }

    #[test]
    fn due_list_order_most_overdue_first() {
        let mut model = DeviceModel::new();
        let now = Instant::now();

        let mut u1 = pollable(UnitKind::Switch, 1, "U1", 10);
        u1.last_poll = Some(now - Duration::from_secs(20)); // due 10s ago
        let mut u2 = pollable(UnitKind::Switch, 2, "U2", 10);
        u2.last_poll = Some(now - Duration::from_secs(11)); // due 1s ago
        let mut u3 = pollable(UnitKind::Switch, 3, "U3", 10);
        u3.last_poll = Some(now - Duration::from_secs(5)); // not due

        model.add(u1).unwrap();
        model.add(u2).unwrap();
        model.add(u3).unwrap();

        let due = model.due_for_poll(now);
        assert_eq!(due, vec![(UnitKind::Switch, 1), (UnitKind::Switch, 2)]);
    }

    #[test]
    fn due_list_excludes_battery_and_zero_period_and_nonviable() {
        let mut model = DeviceModel::new();
        let now = Instant::now();

        let mut battery = pollable(UnitKind::Sensor, 1, "B", 10);
        battery.caps |= UnitCaps::BATTERY;
        let zero_period = Unit::new(UnitKind::Sensor, 2, "Z");
        let mut missing = pollable(UnitKind::Sensor, 3, "M", 10);
        missing.status = UnitStatus::Missing;
        let mut disabled = pollable(UnitKind::Sensor, 4, "D", 10);
        disabled.enabled = false;
        let mut unreadable = pollable(UnitKind::Sensor, 5, "R", 10);
        unreadable.caps.remove(UnitCaps::READABLE);

        for u in [battery, zero_period, missing, disabled, unreadable] {
            model.add(u).unwrap();
        }
        assert!(model.due_for_poll(now).is_empty());
    }

    #[test]
    fn never_polled_sorts_first() {
        let mut model = DeviceModel::new();
        let now = Instant::now();

        let mut overdue = pollable(UnitKind::Switch, 1, "A", 10);
        overdue.last_poll = Some(now - Duration::from_secs(100));
        let fresh = pollable(UnitKind::Switch, 2, "B", 10);

        model.add(overdue).unwrap();
        model.add(fresh).unwrap();
        let due = model.due_for_poll(now);
        assert_eq!(due[0], (UnitKind::Switch, 2));
    }

    #[test]
    fn staleness_threshold() {
        let now = Instant::now();
        let mut u = pollable(UnitKind::Switch, 1, "L", 10);
        u.last_value = Some(now - Duration::from_secs(41));
        assert!(u.is_stale(now, 4));
        u.last_value = Some(now - Duration::from_secs(39));
        assert!(!u.is_stale(now, 4));
    }

    #[test]
    fn rescan_prep_marks_missing() {
        let mut model = DeviceModel::new();
        let mut u = pollable(UnitKind::Switch, 1, "L", 10);
        u.last_poll = Some(Instant::now());
        model.add(u).unwrap();
        model.prepare_for_rescan();
        let u = model.get(UnitKind::Switch, 1).unwrap();
        assert_eq!(u.status, UnitStatus::Missing);
        assert!(u.last_poll.is_none());
    }

    #[test]
    fn item_range_validation() {
        let mut model = DeviceModel::new();
        model.set_capacity(UnitKind::Zone, 16);
        assert!(model.item_in_range(UnitKind::Zone, 1));
        assert!(model.item_in_range(UnitKind::Zone, 16));
        assert!(!model.item_in_range(UnitKind::Zone, 0));
        assert!(!model.item_in_range(UnitKind::Zone, 17));
        assert!(!model.item_in_range(UnitKind::Area, 1));
    }
}

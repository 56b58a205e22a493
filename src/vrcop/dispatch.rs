// MIT License - Copyright (c) 2026 Peter Wright

//! VRCOP node report dispatch.
//!
//! Reports are `class, command, data...` value lists. Only REPORT commands
//! carry state; the class picks the decode and the node id picks the unit.
//! Redelivered reports store identical values and raise no second event.

use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::bind::{
    LOCK_F_LOCKED, SENSOR_F_ACTIVE, SENSOR_F_VALUE, SWITCH_F_LEVEL, SWITCH_F_ON, THERMO_F_COOL,
    THERMO_F_HEAT, THERMO_F_TEMP,
};
use crate::error::Result;
use crate::event::{HostEvent, UserActionKind};
use crate::field::{FieldId, FieldStore, FieldValue};
use crate::model::{DeviceModel, UnitData, UnitKind};
use crate::poll::mark_unit_fresh;

use super::engine::ReportSink;
use super::protocol::{class, f_to_half_c, op, SETPOINT_COOL, SETPOINT_HEAT};

/// Z-Wave basic level byte: 0 off, 1-99 a dim level, 255 fully on.
fn basic_level(raw: u16) -> u8 {
    match raw {
        0 => 0,
        255 => 100,
        v => v.min(99) as u8,
    }
}

pub struct VrcopDispatcher<'a> {
    pub model: &'a mut DeviceModel,
    pub store: &'a mut dyn FieldStore,
}

impl ReportSink for VrcopDispatcher<'_> {
    fn on_report(&mut self, node: u16, values: &[u16]) {
        if let Err(e) = self.apply(node, values) {
            warn!(node, error = %e, "failed to apply node report");
        }
    }
}

impl<'a> VrcopDispatcher<'a> {
    pub fn new(model: &'a mut DeviceModel, store: &'a mut dyn FieldStore) -> Self {
        Self { model, store }
    }

    pub fn apply(&mut self, node: u16, values: &[u16]) -> Result<()> {
        let (Some(&cls), Some(&command)) = (values.first(), values.get(1)) else {
            debug!(node, "short node report");
            return Ok(());
        };
        if command != op::REPORT {
            trace!(node, cls, command, "ignoring non-report command");
            return Ok(());
        }
        // Scenes are not model units; a scene report becomes a user action.
        if cls == class::SCENE_ACTIVATION {
            let scene = values.get(2).copied().unwrap_or(0);
            self.store.queue_event_trigger(HostEvent::UserAction {
                kind: UserActionKind::SceneActivate,
                source: node,
                param: scene,
            });
            return Ok(());
        }
        let kind = match cls {
            class::BASIC | class::BINARY_SWITCH | class::MULTILEVEL_SWITCH => UnitKind::Switch,
            class::BINARY_SENSOR => UnitKind::Sensor,
            class::MULTILEVEL_SENSOR => {
                // a thermostat's ambient temperature arrives under this class
                if self.model.get(UnitKind::Thermostat, node).is_some() {
                    UnitKind::Thermostat
                } else {
                    UnitKind::Sensor
                }
            }
            class::THERMOSTAT_SETPOINT => UnitKind::Thermostat,
            class::DOOR_LOCK => UnitKind::Lock,
            other => {
                debug!(node, class = other, "report for unhandled class");
                return Ok(());
            }
        };
        if !self.model.item_in_range(kind, node) {
            warn!(kind = kind.as_str(), node, "report from out-of-range node, skipping");
            return Ok(());
        }
        if self.model.get(kind, node).is_none() {
            debug!(kind = kind.as_str(), node, "report from unconfigured node");
            return Ok(());
        }

        match cls {
            class::BASIC | class::BINARY_SWITCH | class::MULTILEVEL_SWITCH => {
                self.apply_switch(node, values.get(2).copied().unwrap_or(0))?
            }
            class::BINARY_SENSOR => self.apply_binary_sensor(node, values.get(2).copied().unwrap_or(0))?,
            class::MULTILEVEL_SENSOR => {
                self.apply_level_reading(kind, node, values.get(2).copied().unwrap_or(0))?
            }
            class::THERMOSTAT_SETPOINT => {
                let (Some(&which), Some(&temp)) = (values.get(2), values.get(3)) else {
                    debug!(node, "short setpoint report");
                    return Ok(());
                };
                self.apply_setpoint(node, which, temp)?
            }
            class::DOOR_LOCK => self.apply_lock(node, values.get(2).copied().unwrap_or(0) != 0)?,
            _ => {}
        }
        mark_unit_fresh(self.model, self.store, kind, node, Instant::now());
        Ok(())
    }

    fn put(
        &mut self,
        fields: &[FieldId],
        idx: usize,
        value: FieldValue,
        event: Option<HostEvent>,
    ) -> Result<bool> {
        let Some(&fid) = fields.get(idx) else {
            return Ok(false);
        };
        let changed = self.store.store(fid, value, true)?;
        if changed {
            if let Some(ev) = event {
                self.store.queue_event_trigger(ev);
            }
        }
        Ok(changed)
    }

    fn apply_switch(&mut self, node: u16, raw: u16) -> Result<()> {
        let level = basic_level(raw);
        let fields = {
            let unit = self.model.get_mut(UnitKind::Switch, node).ok_or_else(vanished)?;
            unit.data = UnitData::Switch { level, on: level > 0 };
            unit.fields.clone()
        };
        self.put(&fields, SWITCH_F_ON, FieldValue::Bool(level > 0), None)?;
        self.put(
            &fields,
            SWITCH_F_LEVEL,
            FieldValue::Card(level as u32),
            Some(HostEvent::LoadChange { unit_id: node, level }),
        )?;
        Ok(())
    }

    fn apply_binary_sensor(&mut self, node: u16, raw: u16) -> Result<()> {
        let active = raw != 0;
        let fields = {
            let unit = self.model.get_mut(UnitKind::Sensor, node).ok_or_else(vanished)?;
            unit.data = UnitData::Sensor { value: raw as i16, active };
            unit.fields.clone()
        };
        self.put(&fields, SENSOR_F_VALUE, FieldValue::Int(raw as i32), None)?;
        self.put(
            &fields,
            SENSOR_F_ACTIVE,
            FieldValue::Bool(active),
            Some(HostEvent::Motion { unit_id: node, active }),
        )?;
        Ok(())
    }

    /// Multilevel sensor reading: thermostat ambient temperature (degrees F
    /// on the wire) or a plain sensor value.
    fn apply_level_reading(&mut self, kind: UnitKind, node: u16, raw: u16) -> Result<()> {
        if kind == UnitKind::Thermostat {
            let half_c = f_to_half_c(raw as i16);
            let fields = {
                let unit = self.model.get_mut(kind, node).ok_or_else(vanished)?;
                if let UnitData::Thermostat { ref mut temp, .. } = unit.data {
                    *temp = half_c;
                }
                unit.fields.clone()
            };
            let data = self.thermo_data(node);
            self.put(
                &fields,
                THERMO_F_TEMP,
                FieldValue::Int(half_c as i32),
                data.map(|(t, h, c)| HostEvent::ThermoChange {
                    unit_id: node,
                    temp: t,
                    heat_setpoint: h,
                    cool_setpoint: c,
                }),
            )?;
        } else {
            let fields = {
                let unit = self.model.get_mut(kind, node).ok_or_else(vanished)?;
                unit.data = UnitData::Sensor { value: raw as i16, active: raw != 0 };
                unit.fields.clone()
            };
            self.put(&fields, SENSOR_F_VALUE, FieldValue::Int(raw as i32), None)?;
        }
        Ok(())
    }

    fn apply_setpoint(&mut self, node: u16, which: u16, temp_f: u16) -> Result<()> {
        let half_c = f_to_half_c(temp_f as i16);
        let idx = match which {
            SETPOINT_HEAT => THERMO_F_HEAT,
            SETPOINT_COOL => THERMO_F_COOL,
            other => {
                debug!(node, selector = other, "unknown setpoint selector");
                return Ok(());
            }
        };
        let fields = {
            let unit = self.model.get_mut(UnitKind::Thermostat, node).ok_or_else(vanished)?;
            if let UnitData::Thermostat { ref mut heat_setpoint, ref mut cool_setpoint, .. } =
                unit.data
            {
                if which == SETPOINT_HEAT {
                    *heat_setpoint = half_c;
                } else {
                    *cool_setpoint = half_c;
                }
            }
            unit.fields.clone()
        };
        let data = self.thermo_data(node);
        self.put(
            &fields,
            idx,
            FieldValue::Int(half_c as i32),
            data.map(|(t, h, c)| HostEvent::ThermoChange {
                unit_id: node,
                temp: t,
                heat_setpoint: h,
                cool_setpoint: c,
            }),
        )?;
        Ok(())
    }

    fn thermo_data(&self, node: u16) -> Option<(i16, i16, i16)> {
        match self.model.get(UnitKind::Thermostat, node).map(|u| &u.data) {
            Some(&UnitData::Thermostat { temp, heat_setpoint, cool_setpoint, .. }) => {
                Some((temp, heat_setpoint, cool_setpoint))
            }
            _ => None,
        }
    }

    fn apply_lock(&mut self, node: u16, locked: bool) -> Result<()> {
        let fields = {
            let unit = self.model.get_mut(UnitKind::Lock, node).ok_or_else(vanished)?;
            unit.data = UnitData::Lock { locked };
            unit.fields.clone()
        };
        self.put(
            &fields,
            LOCK_F_LOCKED,
            FieldValue::Bool(locked),
            Some(HostEvent::LockStatus { unit_id: node, locked }),
        )?;
        Ok(())
    }
}

fn vanished() -> crate::error::DriverError {
    crate::error::DriverError::malformed("unit vanished during dispatch")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::register_unit_fields;
    use crate::field::MemoryFieldStore;
    use crate::model::Unit;

    fn setup() -> (DeviceModel, MemoryFieldStore) {
        let mut model = DeviceModel::new();
        let mut store = MemoryFieldStore::new();
        for kind in [UnitKind::Switch, UnitKind::Sensor, UnitKind::Thermostat, UnitKind::Lock] {
            model.set_capacity(kind, 232);
        }
        for (kind, id) in [
            (UnitKind::Switch, 5),
            (UnitKind::Sensor, 6),
            (UnitKind::Thermostat, 7),
            (UnitKind::Lock, 8),
        ] {
            let mut u = Unit::new(kind, id, format!("{}{}", kind.as_str(), id));
            register_unit_fields(&mut store, &mut u).unwrap();
            model.add(u).unwrap();
        }
        (model, store)
    }

    #[test]
    fn switch_report_stores_level_and_event() {
        let (mut model, mut store) = setup();
        {
            let mut d = VrcopDispatcher::new(&mut model, &mut store);
            d.apply(5, &[class::BASIC, op::REPORT, 255]).unwrap();
        }
        assert!(store
            .take_events()
            .contains(&HostEvent::LoadChange { unit_id: 5, level: 100 }));
        assert!(matches!(
            model.get(UnitKind::Switch, 5).unwrap().data,
            UnitData::Switch { level: 100, on: true }
        ));
    }

    #[test]
    fn redelivered_report_is_idempotent() {
        let (mut model, mut store) = setup();
        {
            let mut d = VrcopDispatcher::new(&mut model, &mut store);
            d.apply(5, &[class::BASIC, op::REPORT, 40]).unwrap();
        }
        store.take_events();
        let mut d = VrcopDispatcher::new(&mut model, &mut store);
        d.apply(5, &[class::BASIC, op::REPORT, 40]).unwrap();
        assert!(store.take_events().is_empty());
    }

    #[test]
    fn binary_sensor_trip_raises_motion() {
        let (mut model, mut store) = setup();
        let mut d = VrcopDispatcher::new(&mut model, &mut store);
        d.apply(6, &[class::BINARY_SENSOR, op::REPORT, 255]).unwrap();
        assert!(store
            .take_events()
            .contains(&HostEvent::Motion { unit_id: 6, active: true }));
    }

    #[test]
    fn setpoint_report_updates_thermostat() {
        let (mut model, mut store) = setup();
        {
            let mut d = VrcopDispatcher::new(&mut model, &mut store);
            d.apply(7, &[class::THERMOSTAT_SETPOINT, op::REPORT, SETPOINT_HEAT, 72]).unwrap();
        }
        let events = store.take_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, HostEvent::ThermoChange { unit_id: 7, heat_setpoint: 44, .. })));
        assert!(matches!(
            model.get(UnitKind::Thermostat, 7).unwrap().data,
            UnitData::Thermostat { heat_setpoint: 44, .. }
        ));
    }

    #[test]
    fn report_from_unknown_node_is_skipped() {
        let (mut model, mut store) = setup();
        let mut d = VrcopDispatcher::new(&mut model, &mut store);
        d.apply(99, &[class::BASIC, op::REPORT, 1]).unwrap();
        d.apply(0, &[class::BASIC, op::REPORT, 1]).unwrap();
        assert!(store.take_events().is_empty());
    }

    #[test]
    fn non_report_commands_ignored() {
        let (mut model, mut store) = setup();
        let mut d = VrcopDispatcher::new(&mut model, &mut store);
        d.apply(5, &[class::BASIC, op::GET]).unwrap();
        assert!(store.take_events().is_empty());
    }

    #[test]
    fn scene_report_raises_user_action() {
        let (mut model, mut store) = setup();
        let mut d = VrcopDispatcher::new(&mut model, &mut store);
        d.apply(5, &[class::SCENE_ACTIVATION, op::REPORT, 3]).unwrap();
        assert!(store.take_events().contains(&HostEvent::UserAction {
            kind: UserActionKind::SceneActivate,
            source: 5,
            param: 3,
        }));
    }

    #[test]
    fn basic_level_mapping() {
        assert_eq!(basic_level(0), 0);
        assert_eq!(basic_level(50), 50);
        assert_eq!(basic_level(255), 100);
    }
}

// MIT License - Copyright (c) 2026 Peter Wright

//! Omni notification dispatch.
//!
//! Decodes extended status reports and "other notification" records into
//! model updates, field stores and host events. The same path handles
//! unsolicited frames and poll replies, so a report delivered twice stores
//! identical values and raises no second event.

use std::time::Instant;

use tracing::{debug, warn};

use crate::bind::{
    AREA_F_ALARM_BITS, AREA_F_ARM_MODE, LOCK_F_LOCKED, SENSOR_F_ACTIVE, SENSOR_F_VALUE,
    SWITCH_F_LEVEL, SWITCH_F_ON, THERMO_F_COOL, THERMO_F_FAN, THERMO_F_HEAT, THERMO_F_HOLD,
    THERMO_F_MODE, THERMO_F_TEMP, ZONE_F_ALARM, ZONE_F_ANALOG, ZONE_F_ARMED, ZONE_F_BYPASSED,
    ZONE_F_CONDITION,
};
use crate::error::Result;
use crate::event::{HostEvent, UserActionKind};
use crate::field::{FieldStore, FieldValue};
use crate::model::{DeviceModel, UnitData, UnitKind};
use crate::poll::mark_unit_fresh;

use super::engine::AsyncSink;
use super::protocol::{arm_mode_is_settled, arm_mode_target, msg, omni_temp_to_half_c, Message, ObjType};

pub(crate) fn zone_condition_str(condition: u8) -> &'static str {
    match condition {
        0 => "Secure",
        1 => "NotReady",
        2 => "Trouble",
        _ => "Unknown",
    }
}

pub(crate) fn arm_mode_name(mode: u8) -> &'static str {
    if !arm_mode_is_settled(mode) {
        return "Arming";
    }
    match mode {
        0 => "Disarmed",
        1 => "Day",
        2 => "Night",
        3 => "Away",
        4 => "Vacation",
        5 => "DayInstant",
        6 => "NightDelayed",
        _ => "Unknown",
    }
}

/// Decoded switch state byte: 0 off, 1 fully on, 100+n a dim level of n%.
fn switch_level(state: u8) -> u8 {
    match state {
        0 => 0,
        1 => 100,
        101..=200 => state - 100,
        _ => 0,
    }
}

pub struct OmniDispatcher<'a> {
    pub model: &'a mut DeviceModel,
    pub store: &'a mut dyn FieldStore,
}

impl AsyncSink for OmniDispatcher<'_> {
    fn on_async(&mut self, message: &Message) {
        if let Err(e) = self.apply(message) {
            warn!(error = %e, msg_type = message.msg_type, "failed to apply notification");
        }
    }
}

impl<'a> OmniDispatcher<'a> {
    pub fn new(model: &'a mut DeviceModel, store: &'a mut dyn FieldStore) -> Self {
        Self { model, store }
    }

    /// Apply one decoded message to the model.
    pub fn apply(&mut self, message: &Message) -> Result<()> {
        match message.msg_type {
            msg::EXT_OBJ_STATUS_REPLY => self.apply_ext_status(&message.data),
            msg::OTHER_NOTIFICATIONS => {
                self.apply_other_notifications(&message.data);
                Ok(())
            }
            other => {
                debug!(msg_type = other, "ignoring notification type");
                Ok(())
            }
        }
    }

    fn apply_ext_status(&mut self, data: &[u8]) -> Result<()> {
        let (Some(&obj_byte), Some(&record_len)) = (data.first(), data.get(1)) else {
            debug!("short extended status report");
            return Ok(());
        };
        let Some(obj) = ObjType::from_u8(obj_byte) else {
            debug!(obj = obj_byte, "extended status for unknown object type");
            return Ok(());
        };
        let record_len = record_len as usize;
        if record_len < 3 || record_len != obj.status_record_len() {
            debug!(obj = obj_byte, record_len, "unexpected status record length");
            return Ok(());
        }
        let Some(kind) = obj.unit_kind() else {
            return Ok(());
        };

        for record in data[2..].chunks_exact(record_len) {
            let id = u16::from_be_bytes([record[0], record[1]]);
            if !self.model.item_in_range(kind, id) {
                warn!(kind = kind.as_str(), id, "status for out-of-range item, skipping");
                continue;
            }
            if self.model.get(kind, id).is_none() {
                debug!(kind = kind.as_str(), id, "status for unconfigured item");
                continue;
            }
            match obj {
                ObjType::Zone => self.apply_zone(id, record[2], record[3])?,
                ObjType::Unit => self.apply_switch(id, record[2])?,
                ObjType::Area => {
                    self.apply_area(id, record[2], u16::from_be_bytes([record[3], record[4]]))?
                }
                ObjType::Thermostat => self.apply_thermostat(id, &record[2..])?,
                ObjType::AuxSensor => self.apply_sensor(id, record[2])?,
                ObjType::Lock => self.apply_lock(id, record[2] != 0)?,
                ObjType::Button | ObjType::Code => {}
            }
            mark_unit_fresh(self.model, self.store, kind, id, Instant::now());
        }
        Ok(())
    }

    /// Store a field value; on change, queue the event (if any) and report
    /// whether it changed.
    fn put(
        &mut self,
        fields: &[crate::field::FieldId],
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

    fn apply_zone(&mut self, id: u16, status_byte: u8, analog: u8) -> Result<()> {
        let condition = status_byte & 0x03;
        let latched_alarm = (status_byte >> 2) & 0x03;
        let bypassed = status_byte & 0x10 != 0;
        let armed = status_byte & 0x20 != 0;
        let in_alarm = latched_alarm != 0;

        let fields = {
            let unit = self.model.get_mut(UnitKind::Zone, id).ok_or_else(missing)?;
            unit.data = UnitData::Zone {
                area: match unit.data {
                    UnitData::Zone { area, .. } => area,
                    _ => 0,
                },
                condition,
                analog,
                bypassed,
                armed,
                in_alarm,
            };
            unit.fields.clone()
        };

        self.put(
            &fields,
            ZONE_F_CONDITION,
            FieldValue::Str(zone_condition_str(condition).into()),
            Some(HostEvent::Motion { unit_id: id, active: condition == 1 }),
        )?;
        self.put(
            &fields,
            ZONE_F_ARMED,
            FieldValue::Bool(armed),
            Some(HostEvent::ZoneArmChange { zone_id: id, armed }),
        )?;
        self.put(
            &fields,
            ZONE_F_ALARM,
            FieldValue::Bool(in_alarm),
            Some(HostEvent::ZoneAlarm { zone_id: id, in_alarm }),
        )?;
        self.put(&fields, ZONE_F_ANALOG, FieldValue::Card(analog as u32), None)?;
        self.put(&fields, ZONE_F_BYPASSED, FieldValue::Bool(bypassed), None)?;
        Ok(())
    }

    fn apply_switch(&mut self, id: u16, state: u8) -> Result<()> {
        let level = switch_level(state);
        let fields = {
            let unit = self.model.get_mut(UnitKind::Switch, id).ok_or_else(missing)?;
            unit.data = UnitData::Switch { level, on: level > 0 };
            unit.fields.clone()
        };
        self.put(&fields, SWITCH_F_ON, FieldValue::Bool(level > 0), None)?;
        self.put(
            &fields,
            SWITCH_F_LEVEL,
            FieldValue::Card(level as u32),
            Some(HostEvent::LoadChange { unit_id: id, level }),
        )?;
        Ok(())
    }

    fn apply_area(&mut self, id: u16, mode: u8, alarm_bits: u16) -> Result<()> {
        let fields = {
            let unit = self.model.get_mut(UnitKind::Area, id).ok_or_else(missing)?;
            unit.data = UnitData::Area { arm_mode: mode, alarm_bits };
            unit.fields.clone()
        };
        let settled = arm_mode_is_settled(mode);
        let mode_changed = self.put(
            &fields,
            AREA_F_ARM_MODE,
            FieldValue::Str(arm_mode_name(mode).into()),
            settled.then_some(HostEvent::AreaArmChange { area_id: id, mode }),
        )?;
        self.put(&fields, AREA_F_ALARM_BITS, FieldValue::Card(alarm_bits as u32), None)?;

        // A settled mode propagates arm state to the area's zones. Bypassed
        // zones keep their state.
        if settled && mode_changed {
            self.propagate_area_arm(id, arm_mode_target(mode) != 0)?;
        }
        Ok(())
    }

    fn propagate_area_arm(&mut self, area_id: u16, armed: bool) -> Result<()> {
        let zone_ids: Vec<u16> = self
            .model
            .units_of(UnitKind::Zone)
            .filter(|u| matches!(u.data, UnitData::Zone { area, bypassed, .. } if area == area_id && !bypassed))
            .map(|u| u.id)
            .collect();
        for zone_id in zone_ids {
            let fields = {
                let unit = self.model.get_mut(UnitKind::Zone, zone_id).ok_or_else(missing)?;
                if let UnitData::Zone { armed: ref mut a, .. } = unit.data {
                    *a = armed;
                }
                unit.fields.clone()
            };
            self.put(
                &fields,
                ZONE_F_ARMED,
                FieldValue::Bool(armed),
                Some(HostEvent::ZoneArmChange { zone_id, armed }),
            )?;
        }
        Ok(())
    }

    fn apply_thermostat(&mut self, id: u16, body: &[u8]) -> Result<()> {
        // comm, temp, heat, cool, mode, fan, hold
        if body.len() < 7 {
            return Ok(());
        }
        if body[0] != 0 {
            debug!(id, "thermostat not communicating, skipping values");
            return Ok(());
        }
        let temp = omni_temp_to_half_c(body[1]);
        let heat = omni_temp_to_half_c(body[2]);
        let cool = omni_temp_to_half_c(body[3]);
        let (mode, fan_on, hold) = (body[4], body[5] != 0, body[6] != 0);

        let fields = {
            let unit = self.model.get_mut(UnitKind::Thermostat, id).ok_or_else(missing)?;
            unit.data = UnitData::Thermostat {
                temp,
                heat_setpoint: heat,
                cool_setpoint: cool,
                mode,
                fan_on,
                hold,
            };
            unit.fields.clone()
        };
        let ev = HostEvent::ThermoChange {
            unit_id: id,
            temp,
            heat_setpoint: heat,
            cool_setpoint: cool,
        };
        let mut changed = self.put(&fields, THERMO_F_TEMP, FieldValue::Int(temp as i32), None)?;
        changed |= self.put(&fields, THERMO_F_HEAT, FieldValue::Int(heat as i32), None)?;
        changed |= self.put(&fields, THERMO_F_COOL, FieldValue::Int(cool as i32), None)?;
        self.put(&fields, THERMO_F_MODE, FieldValue::Card(mode as u32), None)?;
        self.put(&fields, THERMO_F_FAN, FieldValue::Bool(fan_on), None)?;
        self.put(&fields, THERMO_F_HOLD, FieldValue::Bool(hold), None)?;
        if changed {
            self.store.queue_event_trigger(ev);
        }
        Ok(())
    }

    fn apply_sensor(&mut self, id: u16, value: u8) -> Result<()> {
        let reading = omni_temp_to_half_c(value);
        let fields = {
            let unit = self.model.get_mut(UnitKind::Sensor, id).ok_or_else(missing)?;
            unit.data = UnitData::Sensor { value: reading, active: value != 0 };
            unit.fields.clone()
        };
        self.put(&fields, SENSOR_F_VALUE, FieldValue::Int(reading as i32), None)?;
        self.put(&fields, SENSOR_F_ACTIVE, FieldValue::Bool(value != 0), None)?;
        Ok(())
    }

    fn apply_lock(&mut self, id: u16, locked: bool) -> Result<()> {
        let fields = {
            let unit = self.model.get_mut(UnitKind::Lock, id).ok_or_else(missing)?;
            unit.data = UnitData::Lock { locked };
            unit.fields.clone()
        };
        self.put(
            &fields,
            LOCK_F_LOCKED,
            FieldValue::Bool(locked),
            Some(HostEvent::LockStatus { unit_id: id, locked }),
        )?;
        Ok(())
    }

    /// "Other notification" records are u16 values whose top nibble selects
    /// the sub-category; the rest identifies the source.
    fn apply_other_notifications(&mut self, data: &[u8]) {
        for record in data.chunks_exact(2) {
            let value = u16::from_be_bytes([record[0], record[1]]);
            let source = value & 0x0FFF;
            let kind = match value >> 12 {
                0 => UserActionKind::ButtonPress,
                1 => UserActionKind::SecurityArming,
                2 => UserActionKind::X10Command,
                3 => UserActionKind::UpbLink,
                other => {
                    debug!(category = other, "unknown notification category");
                    continue;
                }
            };
            self.store
                .queue_event_trigger(HostEvent::UserAction { kind, source, param: 0 });
        }
    }
}

fn missing() -> crate::error::DriverError {
    crate::error::DriverError::malformed("unit vanished during dispatch")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::register_unit_fields;
    use crate::field::MemoryFieldStore;
    use crate::model::Unit;
    use std::time::Duration;

    fn setup() -> (DeviceModel, MemoryFieldStore) {
        let mut model = DeviceModel::new();
        let mut store = MemoryFieldStore::new();
        model.set_capacity(UnitKind::Zone, 16);
        model.set_capacity(UnitKind::Area, 4);
        model.set_capacity(UnitKind::Switch, 16);

        for (id, name, area, bypassed) in
            [(1, "FrontDoor", 1, false), (2, "BackDoor", 1, true), (3, "Garage", 2, false)]
        {
            let mut u = Unit::new(UnitKind::Zone, id, name);
            u.poll_period = Duration::from_secs(60);
            u.data = UnitData::Zone {
                area,
                condition: 0,
                analog: 0,
                bypassed,
                armed: false,
                in_alarm: false,
            };
            register_unit_fields(&mut store, &mut u).unwrap();
            model.add(u).unwrap();
        }
        let mut area = Unit::new(UnitKind::Area, 1, "Main");
        register_unit_fields(&mut store, &mut area).unwrap();
        model.add(area).unwrap();
        let mut lamp = Unit::new(UnitKind::Switch, 4, "Lamp");
        register_unit_fields(&mut store, &mut lamp).unwrap();
        model.add(lamp).unwrap();
        (model, store)
    }

    fn zone_status(records: &[(u16, u8, u8)]) -> Message {
        let mut data = vec![ObjType::Zone as u8, 4];
        for (id, cond, analog) in records {
            data.extend_from_slice(&id.to_be_bytes());
            data.push(*cond);
            data.push(*analog);
        }
        Message::new(msg::EXT_OBJ_STATUS_REPLY, data)
    }

    fn area_status(id: u16, mode: u8) -> Message {
        let mut data = vec![ObjType::Area as u8, 5];
        data.extend_from_slice(&id.to_be_bytes());
        data.push(mode);
        data.extend_from_slice(&0u16.to_be_bytes());
        Message::new(msg::EXT_OBJ_STATUS_REPLY, data)
    }

    #[test]
    fn settled_arm_propagates_to_zones_skipping_bypassed() {
        let (mut model, mut store) = setup();
        let mut d = OmniDispatcher::new(&mut model, &mut store);
        // Away (3) is settled
        d.apply(&area_status(1, 3)).unwrap();

        let events = store.take_events();
        assert!(events.contains(&HostEvent::AreaArmChange { area_id: 1, mode: 3 }));
        assert!(events.contains(&HostEvent::ZoneArmChange { zone_id: 1, armed: true }));
        // zone 2 is bypassed, zone 3 belongs to area 2
        assert!(!events.iter().any(
            |e| matches!(e, HostEvent::ZoneArmChange { zone_id, .. } if *zone_id != 1)
        ));
    }

    #[test]
    fn transitional_arm_mode_does_not_propagate() {
        let (mut model, mut store) = setup();
        let mut d = OmniDispatcher::new(&mut model, &mut store);
        // Away while the exit delay runs (3 + 8)
        d.apply(&area_status(1, 11)).unwrap();
        let events = store.take_events();
        assert!(!events.iter().any(|e| matches!(e, HostEvent::ZoneArmChange { .. })));
        assert!(!events.iter().any(|e| matches!(e, HostEvent::AreaArmChange { .. })));
    }

    #[test]
    fn redelivered_report_is_idempotent() {
        let (mut model, mut store) = setup();
        {
            let mut d = OmniDispatcher::new(&mut model, &mut store);
            // zone 1 not ready with alarm memory
            d.apply(&zone_status(&[(1, 0b0000_0101, 17)])).unwrap();
        }
        let first = store.take_events();
        assert!(first.contains(&HostEvent::ZoneAlarm { zone_id: 1, in_alarm: true }));

        let mut d = OmniDispatcher::new(&mut model, &mut store);
        d.apply(&zone_status(&[(1, 0b0000_0101, 17)])).unwrap();
        assert!(store.take_events().is_empty());
    }

    #[test]
    fn out_of_range_item_skipped() {
        let (mut model, mut store) = setup();
        let mut d = OmniDispatcher::new(&mut model, &mut store);
        d.apply(&zone_status(&[(40, 1, 0), (0, 1, 0)])).unwrap();
        assert!(store.take_events().is_empty());
    }

    #[test]
    fn switch_level_decode_and_event() {
        let (mut model, mut store) = setup();
        {
            let mut d = OmniDispatcher::new(&mut model, &mut store);
            let mut data = vec![ObjType::Unit as u8, 5];
            data.extend_from_slice(&4u16.to_be_bytes());
            data.push(150); // dim level 50
            data.extend_from_slice(&[0, 0]);
            d.apply(&Message::new(msg::EXT_OBJ_STATUS_REPLY, data)).unwrap();
        }
        assert!(store
            .take_events()
            .contains(&HostEvent::LoadChange { unit_id: 4, level: 50 }));
        assert!(matches!(
            model.get(UnitKind::Switch, 4).unwrap().data,
            UnitData::Switch { level: 50, on: true }
        ));
    }

    #[test]
    fn other_notifications_decode() {
        let (mut model, mut store) = setup();
        let mut d = OmniDispatcher::new(&mut model, &mut store);
        // button 3 press, security arming at keypad 1
        let data = vec![0x00, 0x03, 0x10, 0x01];
        d.apply(&Message::new(msg::OTHER_NOTIFICATIONS, data)).unwrap();
        let events = store.take_events();
        assert_eq!(
            events,
            vec![
                HostEvent::UserAction { kind: UserActionKind::ButtonPress, source: 3, param: 0 },
                HostEvent::UserAction { kind: UserActionKind::SecurityArming, source: 1, param: 0 },
            ]
        );
    }

    #[test]
    fn switch_state_byte_decoding() {
        assert_eq!(switch_level(0), 0);
        assert_eq!(switch_level(1), 100);
        assert_eq!(switch_level(101), 1);
        assert_eq!(switch_level(200), 100);
    }
}

// MIT License - Copyright (c) 2026 Peter Wright

//! Omni panel driver.
//!
//! Owns the connection end to end: connect and handshake, read the panel's
//! object capacities and properties into the device model, enable
//! unsolicited notifications, then alternate between servicing asyncs and
//! batch status polls. Commands from the host run on the same task.

use std::collections::HashSet;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::command::{HostCommand, SetpointKind};
use crate::config::OmniConfig;
use crate::error::{DriverError, Result};
use crate::event::HostEvent;
use crate::field::{FieldId, FieldStore, FieldValue};
use crate::model::{DeviceModel, Unit, UnitCaps, UnitData, UnitKind, UnitStatus};
use crate::poll::{mark_stale_units, PollPlanner};
use crate::transport::{connect_tcp, TcpTransport, Transport};

use crate::bind::{self, register_unit_fields};

use super::codec::OmniCodec;
use super::dispatch::OmniDispatcher;
use super::engine::{Expect, NullSink, OmniEngine};
use super::protocol::{self, cmd, msg, Message, ObjType};
use super::session;

/// Object types enumerated from the panel, in enumeration order.
const ENUMERATED: [ObjType; 6] = [
    ObjType::Zone,
    ObjType::Unit,
    ObjType::Area,
    ObjType::Thermostat,
    ObjType::AuxSensor,
    ObjType::Lock,
];

pub struct OmniDriver<T> {
    config: OmniConfig,
    engine: OmniEngine<T>,
    model: DeviceModel,
    planner: PollPlanner,
}

impl OmniDriver<TcpTransport> {
    /// Connect, handshake and build the device model.
    pub async fn connect(config: OmniConfig, store: &mut dyn FieldStore) -> Result<Self> {
        let mut transport = connect_tcp(&config.host, config.port).await?;
        let mut codec = OmniCodec::new(config.tolerate_swapped_crc);
        session::establish(&mut transport, &mut codec, &config).await?;
        let mut driver = Self::from_parts(transport, codec, config);
        driver.initialise(store).await?;
        Ok(driver)
    }
}

impl<T: Transport> OmniDriver<T> {
    /// Assemble from an established transport and keyed codec.
    pub fn from_parts(transport: T, codec: OmniCodec, config: OmniConfig) -> Self {
        let engine = OmniEngine::new(transport, codec, config.timings.clone());
        Self { config, engine, model: DeviceModel::new(), planner: PollPlanner::new() }
    }

    pub fn model(&self) -> &DeviceModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut DeviceModel {
        &mut self.model
    }

    /// Read system info and capacities, enumerate objects, enable
    /// notifications. Asyncs are not dispatched until the model is built.
    pub async fn initialise(&mut self, store: &mut dyn FieldStore) -> Result<()> {
        let info = self
            .engine
            .send_and_wait(
                &protocol::sys_info_req(),
                &Expect::reply(msg::SYS_INFO_REPLY),
                &mut NullSink,
            )
            .await?;
        if info.data.len() >= 4 {
            info!(
                model = info.data[0],
                firmware = format!("{}.{}", info.data[1], info.data[2]),
                "connected to panel"
            );
        }

        let status = self
            .engine
            .send_and_wait(
                &protocol::sys_status_req(),
                &Expect::reply(msg::SYS_STATUS_REPLY),
                &mut NullSink,
            )
            .await?;
        // battery reading trails the date/time block
        if let Some(&battery) = status.data.get(13) {
            debug!(battery, "panel system status");
        }

        for obj in ENUMERATED {
            let capacity = self.read_capacity(obj).await?;
            if let Some(kind) = obj.unit_kind() {
                self.model.set_capacity(kind, capacity);
            }
            debug!(obj = obj as u8, capacity, "object capacity");
        }

        self.enumerate(store).await?;

        self.engine
            .send_and_wait(&protocol::enable_notifications(true), &Expect::ack(), &mut NullSink)
            .await?;
        store.queue_event_trigger(HostEvent::Connected);
        info!(units = self.model.len(), "panel model ready");
        Ok(())
    }

    async fn read_capacity(&mut self, obj: ObjType) -> Result<u16> {
        let reply = self
            .engine
            .send_and_wait(
                &protocol::obj_capacity_req(obj),
                &Expect::reply(msg::OBJ_CAP_REPLY).for_obj(obj as u8),
                &mut NullSink,
            )
            .await?;
        reply
            .u16_at(1)
            .ok_or_else(|| DriverError::malformed("short capacity reply"))
    }

    /// Walk every named object on the panel and build units for them.
    async fn enumerate(&mut self, store: &mut dyn FieldStore) -> Result<()> {
        for obj in ENUMERATED {
            let Some(kind) = obj.unit_kind() else { continue };
            for id in 1..=self.model.capacity(kind) {
                let reply = self
                    .engine
                    .send_and_wait(
                        &protocol::obj_properties_req(obj, id),
                        &Expect::reply(msg::OBJ_PROP_REPLY)
                            .or(msg::END_OF_DATA)
                            .for_obj(obj as u8),
                        &mut NullSink,
                    )
                    .await?;
                // END_OF_DATA: id not in use
                if reply.msg_type != msg::OBJ_PROP_REPLY {
                    continue;
                }
                if let Some(unit) = build_unit(kind, id, &reply, &self.config) {
                    self.adopt_unit(unit, store)?;
                }
            }
        }
        Ok(())
    }

    /// Install a freshly enumerated unit, or refresh an existing one after
    /// a rescan. Field binding failure leaves the unit present but Failed.
    fn adopt_unit(&mut self, mut unit: Unit, store: &mut dyn FieldStore) -> Result<()> {
        let kind = unit.kind();
        if let Some(existing) = self.model.get_mut(kind, unit.id) {
            if existing.name == unit.name {
                existing.status = UnitStatus::Ready;
                return Ok(());
            }
            // replaced under the same id: rebind under the new name
            debug!(kind = kind.as_str(), id = unit.id, "unit replaced, rebinding");
            self.model.remove(kind, unit.id);
        }
        if let Err(e) = register_unit_fields(store, &mut unit) {
            warn!(kind = kind.as_str(), id = unit.id, error = %e, "field binding failed");
            unit.status = UnitStatus::Failed;
        } else if let Some(&status_field) = unit.fields.first() {
            if let Err(e) = store.store(status_field, FieldValue::Str("Ready".into()), true) {
                warn!(kind = kind.as_str(), id = unit.id, error = %e, "status field update failed");
            }
        }
        self.model.add(unit)
    }

    /// Drop the model back to Missing and enumerate again. Units that
    /// reappear return to Ready; the rest stay Missing and are not polled.
    pub async fn rescan(&mut self, store: &mut dyn FieldStore) -> Result<()> {
        info!("rescanning panel objects");
        self.model.prepare_for_rescan();
        for obj in ENUMERATED {
            let capacity = self.read_capacity(obj).await?;
            if let Some(kind) = obj.unit_kind() {
                self.model.set_capacity(kind, capacity);
            }
        }
        self.enumerate(store).await
    }

    /// One service iteration: dispatch pending asyncs, then run a poll
    /// round if due. Connection-fatal errors propagate to the lifecycle.
    pub async fn service(&mut self, store: &mut dyn FieldStore) -> Result<()> {
        {
            let mut sink = OmniDispatcher::new(&mut self.model, store);
            self.engine.drain(&mut sink).await?;
        }
        let now = Instant::now();
        if !self.planner.round_due(now, &self.config.timings) {
            return Ok(());
        }
        let outcome = self.poll_round(store).await;
        mark_stale_units(&mut self.model, store, Instant::now(), &self.config.timings);
        match outcome {
            Ok(()) => self.planner.complete_round(Instant::now(), true, &self.config.timings),
            Err(e) if e.is_connection_fatal() => Err(e),
            Err(e) => {
                warn!(error = %e, "poll round failed");
                self.planner.complete_round(Instant::now(), false, &self.config.timings)
            }
        }
    }

    /// Poll every due unit, batching requests per object type block. A
    /// block with no configured unit is skipped outright.
    async fn poll_round(&mut self, store: &mut dyn FieldStore) -> Result<()> {
        let due = self.model.due_for_poll(Instant::now());
        let mut polled: HashSet<(UnitKind, u16)> = HashSet::new();

        for (kind, id) in due {
            let Some(obj) = ObjType::from_unit_kind(kind) else { continue };
            let block = obj.poll_block_size();
            let from = ((id - 1) / block) * block + 1;
            if !polled.insert((kind, from)) {
                continue;
            }
            let to = (from + block - 1).min(self.model.capacity(kind));
            if !self
                .model
                .units_of(kind)
                .any(|u| u.id >= from && u.id <= to)
            {
                continue;
            }

            let outcome = {
                let (engine, model) = (&mut self.engine, &mut self.model);
                let mut sink = OmniDispatcher::new(model, store);
                engine
                    .send_and_wait(
                        &protocol::ext_status_req(obj, from, to),
                        &Expect::reply(msg::EXT_OBJ_STATUS_REPLY).or(msg::END_OF_DATA).for_obj(obj as u8),
                        &mut sink,
                    )
                    .await
            };
            // a failed attempt still consumes the block's turn, so a dead
            // block cannot hold the head of the due list
            let now = Instant::now();
            for unit in self.model.iter_mut() {
                if unit.kind() == kind && unit.id >= from && unit.id <= to {
                    unit.last_poll = Some(now);
                }
            }
            let reply = outcome?;
            if reply.msg_type == msg::EXT_OBJ_STATUS_REPLY {
                let mut dispatcher = OmniDispatcher::new(&mut self.model, store);
                dispatcher.apply(&reply)?;
            }
        }
        Ok(())
    }

    /// Execute a host command. Secure commands validate the user code
    /// first; all state changes wait for the panel's ack and then for a
    /// status report confirming the change reached the device. A failure
    /// is charged to the field the command writes.
    pub async fn execute(&mut self, command: &HostCommand, store: &mut dyn FieldStore) -> Result<()> {
        let outcome = self.run_command(command, store).await;
        if outcome.is_err() {
            if let Some(fid) = self.command_target_field(command) {
                store.note_failed_write(fid);
            }
        }
        outcome
    }

    async fn run_command(&mut self, command: &HostCommand, store: &mut dyn FieldStore) -> Result<()> {
        let (request, obj, target) = self.translate(command).await?;
        {
            let mut sink = OmniDispatcher::new(&mut self.model, store);
            self.engine.send_and_wait(&request, &Expect::ack(), &mut sink).await?;
        }
        // second stage: the panel reports the object's new state
        let wait = self.config.timings.transmit_ack_timeout;
        let mut sink = OmniDispatcher::new(&mut self.model, store);
        self.engine
            .wait_for_async(
                move |m| status_mentions(m, obj, target),
                wait,
                &mut sink,
            )
            .await?;
        Ok(())
    }

    /// The bound field a command writes, for the host's per-field
    /// failed-write counters.
    fn command_target_field(&self, command: &HostCommand) -> Option<FieldId> {
        let (kind, name, index) = match command {
            HostCommand::ArmArea { area, .. } => (UnitKind::Area, area, bind::AREA_F_ARM_MODE),
            HostCommand::BypassZone { zone, .. } | HostCommand::RestoreZone { zone, .. } => {
                (UnitKind::Zone, zone, bind::ZONE_F_BYPASSED)
            }
            HostCommand::UnitOn { unit, .. } | HostCommand::UnitOff { unit, .. } => {
                (UnitKind::Switch, unit, bind::SWITCH_F_ON)
            }
            HostCommand::UnitLevel { unit, .. } => (UnitKind::Switch, unit, bind::SWITCH_F_LEVEL),
            HostCommand::SetSetpoint { unit, kind: SetpointKind::Heat, .. } => {
                (UnitKind::Thermostat, unit, bind::THERMO_F_HEAT)
            }
            HostCommand::SetSetpoint { unit, kind: SetpointKind::Cool, .. } => {
                (UnitKind::Thermostat, unit, bind::THERMO_F_COOL)
            }
            HostCommand::LockDoor { unit } | HostCommand::UnlockDoor { unit } => {
                (UnitKind::Lock, unit, bind::LOCK_F_LOCKED)
            }
        };
        self.model
            .lookup_by_name(kind, name)
            .and_then(|u| u.fields.get(index).copied())
    }

    /// Resolve names and build the wire command, running code validation
    /// where the target requires it.
    async fn translate(&mut self, command: &HostCommand) -> Result<(Message, ObjType, u16)> {
        match command {
            HostCommand::ArmArea { area, mode, code } => {
                let id = self.resolve(UnitKind::Area, area)?;
                let user = self.validate_code(id, code).await?;
                Ok((protocol::send_cmd(mode.omni_command(), user, id), ObjType::Area, id))
            }
            HostCommand::BypassZone { zone, code } | HostCommand::RestoreZone { zone, code } => {
                let id = self.resolve(UnitKind::Zone, zone)?;
                let area = match self.model.get(UnitKind::Zone, id).map(|u| &u.data) {
                    Some(UnitData::Zone { area, .. }) => *area,
                    _ => 0,
                };
                let user = self.validate_code(area, code).await?;
                let op = if matches!(command, HostCommand::BypassZone { .. }) {
                    cmd::BYPASS_ZONE
                } else {
                    cmd::RESTORE_ZONE
                };
                Ok((protocol::send_cmd(op, user, id), ObjType::Zone, id))
            }
            HostCommand::UnitOn { unit, delay_secs } | HostCommand::UnitOff { unit, delay_secs } => {
                let id = self.resolve(UnitKind::Switch, unit)?;
                let on = matches!(command, HostCommand::UnitOn { .. });
                let op = if on { cmd::UNIT_ON } else { cmd::UNIT_OFF };
                let delay = (*delay_secs).min(u8::MAX as u32) as u8;
                Ok((protocol::send_cmd(op, delay, id), ObjType::Unit, id))
            }
            HostCommand::UnitLevel { unit, level } => {
                let id = self.resolve(UnitKind::Switch, unit)?;
                Ok((protocol::send_cmd(cmd::UNIT_PERCENT, *level, id), ObjType::Unit, id))
            }
            HostCommand::SetSetpoint { unit, kind, degrees, scale } => {
                let id = self.resolve(UnitKind::Thermostat, unit)?;
                let op = match kind {
                    SetpointKind::Heat => cmd::SET_HEAT_SETPOINT,
                    SetpointKind::Cool => cmd::SET_COOL_SETPOINT,
                };
                let raw = protocol::setpoint_to_omni_temp(*degrees, *scale);
                Ok((protocol::send_cmd(op, raw, id), ObjType::Thermostat, id))
            }
            HostCommand::LockDoor { unit } | HostCommand::UnlockDoor { unit } => {
                let id = self.resolve(UnitKind::Lock, unit)?;
                let op = if matches!(command, HostCommand::LockDoor { .. }) {
                    cmd::LOCK_DOOR
                } else {
                    cmd::UNLOCK_DOOR
                };
                Ok((protocol::send_cmd(op, 0, id), ObjType::Lock, id))
            }
        }
    }

    fn resolve(&self, kind: UnitKind, name: &str) -> Result<u16> {
        self.model
            .lookup_by_name(kind, name)
            .map(|u| u.id)
            .ok_or_else(|| DriverError::unsupported(format!("no {} named '{}'", kind.as_str(), name)))
    }

    /// Check a user code with the panel; returns the user number to attach
    /// to the secured command.
    async fn validate_code(&mut self, area: u16, code: &str) -> Result<u8> {
        let request = protocol::validate_code_req(area.min(255) as u8, code)
            .ok_or_else(|| DriverError::unsupported("code must be four digits"))?;
        let reply = self
            .engine
            .send_and_wait(&request, &Expect::reply(msg::VALIDATE_CODE_REPLY), &mut NullSink)
            .await?;
        // reply: area, user number, authority level (0 = invalid)
        match (reply.data.get(1), reply.data.get(2)) {
            (Some(&user), Some(&authority)) if authority != 0 => Ok(user),
            _ => Err(DriverError::unsupported("code rejected by panel")),
        }
    }

    /// Politely close the session.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.engine.terminate().await
    }
}

/// Whether an extended status report mentions the given object.
fn status_mentions(message: &Message, obj: ObjType, id: u16) -> bool {
    if message.msg_type != msg::EXT_OBJ_STATUS_REPLY {
        return false;
    }
    if message.data.first() != Some(&(obj as u8)) {
        return false;
    }
    let record_len = match message.data.get(1) {
        Some(&l) if l >= 2 => l as usize,
        _ => return false,
    };
    message.data[2..]
        .chunks_exact(record_len)
        .any(|r| u16::from_be_bytes([r[0], r[1]]) == id)
}

/// Build a unit from an object-properties reply:
/// `obj, id, flags, aux, name...`. Flag bit 0 marks the id as in use; the
/// aux byte carries the owning area for zones.
fn build_unit(kind: UnitKind, id: u16, reply: &Message, config: &OmniConfig) -> Option<Unit> {
    let flags = *reply.data.get(3)?;
    if flags & 0x01 == 0 {
        return None;
    }
    let aux = *reply.data.get(4)?;
    let raw_name = &reply.data[5..];
    let end = raw_name.iter().position(|&b| b == 0).unwrap_or(raw_name.len());
    let name = String::from_utf8_lossy(&raw_name[..end]).to_string();
    let fallback = format!("{}{}", kind.as_str(), id);
    let mut unit = Unit::new(kind, id, if name.trim().is_empty() { fallback } else { name });

    unit.caps = match kind {
        UnitKind::Zone => UnitCaps::READABLE | UnitCaps::ASYNC_NOTIFY,
        UnitKind::Switch => UnitCaps::READABLE | UnitCaps::WRITABLE | UnitCaps::ASYNC_NOTIFY,
        UnitKind::Area => UnitCaps::READABLE | UnitCaps::ASYNC_NOTIFY | UnitCaps::SECURE,
        UnitKind::Thermostat => UnitCaps::READABLE | UnitCaps::WRITABLE,
        UnitKind::Lock => UnitCaps::READABLE | UnitCaps::WRITABLE | UnitCaps::SECURE,
        _ => UnitCaps::READABLE,
    };
    unit.poll_period = config.default_poll_period;
    if kind == UnitKind::Zone {
        unit.data = UnitData::Zone {
            area: aux as u16,
            condition: 0,
            analog: 0,
            bypassed: false,
            armed: false,
            in_alarm: false,
        };
    }
    Some(unit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::MemoryFieldStore;
    use crate::model::UnitData;
    use crate::transport::ScriptedTransport;
    use std::time::Duration;

    const KEY: [u8; 16] = [0x42; 16];

    fn keyed_codec() -> OmniCodec {
        let mut c = OmniCodec::new(true);
        c.set_key(&KEY);
        c
    }

    fn fast_config() -> OmniConfig {
        OmniConfig::builder()
            .host("test")
            .key(KEY)
            .timings(crate::config::Timings {
                reply_timeout: Duration::from_millis(20),
                read_slice: Duration::from_millis(2),
                drain_timeout: Duration::from_millis(1),
                async_grace: Duration::from_millis(20),
                min_send_gap: Duration::from_millis(1),
                transmit_ack_timeout: Duration::from_millis(50),
                ..Default::default()
            })
            .build()
    }

    fn frame(seq: u16, message: &Message) -> Vec<u8> {
        keyed_codec().encode_message_with_seq(seq, message).unwrap()
    }

    #[test]
    fn status_report_target_matching() {
        let mut data = vec![ObjType::Unit as u8, 5];
        data.extend_from_slice(&7u16.to_be_bytes());
        data.extend_from_slice(&[1, 0, 0]);
        let m = Message::new(msg::EXT_OBJ_STATUS_REPLY, data);
        assert!(status_mentions(&m, ObjType::Unit, 7));
        assert!(!status_mentions(&m, ObjType::Unit, 8));
        assert!(!status_mentions(&m, ObjType::Zone, 7));
    }

    #[test]
    fn unit_built_from_properties() {
        let mut data = vec![ObjType::Zone as u8, 0, 3, 0x01, 2];
        data.extend_from_slice(b"Front Door\0\0");
        let reply = Message::new(msg::OBJ_PROP_REPLY, data);
        let unit = build_unit(UnitKind::Zone, 3, &reply, &fast_config()).unwrap();
        assert_eq!(unit.name, "Front Door");
        assert!(matches!(unit.data, UnitData::Zone { area: 2, .. }));

        // not-in-use flag yields no unit
        let unused = Message::new(msg::OBJ_PROP_REPLY, vec![ObjType::Zone as u8, 0, 4, 0x00, 0]);
        assert!(build_unit(UnitKind::Zone, 4, &unused, &fast_config()).is_none());
    }

    #[tokio::test]
    async fn command_runs_both_stages() {
        let mut t = ScriptedTransport::new();
        t.release_on_send = true;
        // stage 1: sequenced ack; stage 2: async status for the switch
        let mut status = vec![ObjType::Unit as u8, 5];
        status.extend_from_slice(&4u16.to_be_bytes());
        status.extend_from_slice(&[1, 0, 0]); // fully on
        let mut chunk = frame(1, &Message::bare(msg::ACK));
        chunk.extend(frame(0, &Message::new(msg::EXT_OBJ_STATUS_REPLY, status)));
        t.push_inbound(chunk);

        let mut driver = OmniDriver::from_parts(t, keyed_codec(), fast_config());
        let mut store = MemoryFieldStore::new();
        driver.model_mut().set_capacity(UnitKind::Switch, 16);
        let mut lamp = Unit::new(UnitKind::Switch, 4, "Lamp");
        register_unit_fields(&mut store, &mut lamp).unwrap();
        driver.model_mut().add(lamp).unwrap();

        driver
            .execute(&HostCommand::UnitOn { unit: "Lamp".into(), delay_secs: 0 }, &mut store)
            .await
            .unwrap();

        // the confirming report was dispatched into the model
        assert!(matches!(
            driver.model().get(UnitKind::Switch, 4).unwrap().data,
            UnitData::Switch { level: 100, on: true }
        ));
    }

    /// A silent panel still consumes the block's turn, so the due list
    /// does not keep the same block at its head forever.
    #[tokio::test]
    async fn failed_poll_round_still_advances_schedule() {
        let t = ScriptedTransport::new();
        let mut driver = OmniDriver::from_parts(t, keyed_codec(), fast_config());
        let mut store = MemoryFieldStore::new();
        driver.model_mut().set_capacity(UnitKind::Switch, 16);
        let mut lamp = Unit::new(UnitKind::Switch, 4, "Lamp");
        lamp.poll_period = Duration::from_secs(30);
        register_unit_fields(&mut store, &mut lamp).unwrap();
        driver.model_mut().add(lamp).unwrap();

        driver.service(&mut store).await.unwrap();

        assert!(driver.model().get(UnitKind::Switch, 4).unwrap().last_poll.is_some());
    }

    #[tokio::test]
    async fn failed_command_is_charged_to_target_field() {
        let t = ScriptedTransport::new();
        let mut driver = OmniDriver::from_parts(t, keyed_codec(), fast_config());
        let mut store = MemoryFieldStore::new();
        driver.model_mut().set_capacity(UnitKind::Switch, 16);
        let mut lamp = Unit::new(UnitKind::Switch, 4, "Lamp");
        register_unit_fields(&mut store, &mut lamp).unwrap();
        driver.model_mut().add(lamp).unwrap();
        let on_field = driver.model().get(UnitKind::Switch, 4).unwrap().fields[bind::SWITCH_F_ON];

        let err = driver
            .execute(&HostCommand::UnitOn { unit: "Lamp".into(), delay_secs: 0 }, &mut store)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Timeout { .. }));
        assert_eq!(store.failed_write_count(on_field), 1);
    }

    #[tokio::test]
    async fn command_to_unknown_name_fails_fast() {
        let t = ScriptedTransport::new();
        let mut driver = OmniDriver::from_parts(t, keyed_codec(), fast_config());
        let mut store = MemoryFieldStore::new();
        let err = driver
            .execute(&HostCommand::UnitOn { unit: "Nope".into(), delay_secs: 0 }, &mut store)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Unsupported { .. }));
    }
}

// MIT License - Copyright (c) 2026 Peter Wright

//! Leviton VRCOP driver.
//!
//! Serial Z-Wave bridge: enumerate the network by sweeping existence
//! queries, then service unsolicited node reports and poll one unit per
//! round, cycling through the unit's getter variants. The dongle serialises
//! RF traffic, so polling more than one node per round just queues behind
//! the radio.

use std::time::Instant;

use tracing::{info, warn};

use crate::bind;
use crate::command::{HostCommand, SetpointKind};
use crate::config::VrcopConfig;
use crate::error::{DriverError, Result};
use crate::event::HostEvent;
use crate::field::{FieldId, FieldStore};
use crate::model::{DeviceModel, UnitKind};
use crate::poll::{mark_stale_units, PollPlanner};
use crate::transport::{open_serial, SerialTransport, Transport};

use super::dispatch::VrcopDispatcher;
use super::engine::VrcopEngine;
use super::protocol::{self, getters_for};
use super::scan;

pub struct VrcopDriver<T> {
    config: VrcopConfig,
    engine: VrcopEngine<T>,
    model: DeviceModel,
    planner: PollPlanner,
}

impl VrcopDriver<SerialTransport> {
    /// Open the serial port and enumerate the network.
    pub async fn connect(config: VrcopConfig, store: &mut dyn FieldStore) -> Result<Self> {
        let transport = open_serial(&config.device, config.baud)?;
        let mut driver = Self::from_parts(transport, config);
        driver.initialise(store).await?;
        Ok(driver)
    }
}

impl<T: Transport> VrcopDriver<T> {
    pub fn from_parts(transport: T, config: VrcopConfig) -> Self {
        let engine = VrcopEngine::new(transport, config.timings.clone());
        Self { config, engine, model: DeviceModel::new(), planner: PollPlanner::new() }
    }

    pub fn model(&self) -> &DeviceModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut DeviceModel {
        &mut self.model
    }

    pub async fn initialise(&mut self, store: &mut dyn FieldStore) -> Result<()> {
        scan::enumerate(&mut self.engine, &self.config, &mut self.model, store).await?;
        store.queue_event_trigger(HostEvent::Connected);
        info!(units = self.model.len(), "Z-Wave model ready");
        Ok(())
    }

    /// Sweep the network again; nodes that answer return to Ready, the rest
    /// stay Missing and drop out of the poll schedule.
    pub async fn rescan(&mut self, store: &mut dyn FieldStore) -> Result<()> {
        info!("rescanning Z-Wave network");
        self.model.prepare_for_rescan();
        scan::enumerate(&mut self.engine, &self.config, &mut self.model, store).await
    }

    /// One service iteration: dispatch pending reports, then poll the most
    /// overdue unit if a round is due.
    pub async fn service(&mut self, store: &mut dyn FieldStore) -> Result<()> {
        {
            let mut sink = VrcopDispatcher::new(&mut self.model, store);
            self.engine.drain(&mut sink).await?;
        }
        let now = Instant::now();
        if !self.planner.round_due(now, &self.config.timings) {
            return Ok(());
        }
        let outcome = self.poll_one(store).await;
        mark_stale_units(&mut self.model, store, Instant::now(), &self.config.timings);
        match outcome {
            Ok(()) => self.planner.complete_round(Instant::now(), true, &self.config.timings),
            Err(e) if e.is_connection_fatal() => Err(e),
            Err(e) => {
                warn!(error = %e, "poll failed");
                self.planner.complete_round(Instant::now(), false, &self.config.timings)
            }
        }
    }

    /// Poll the single most overdue unit, advancing its getter cursor so
    /// successive rounds cover all of its readable values. The report
    /// itself arrives as an unsolicited line and flows through dispatch.
    async fn poll_one(&mut self, store: &mut dyn FieldStore) -> Result<()> {
        let Some(&(kind, id)) = self.model.due_for_poll(Instant::now()).first() else {
            return Ok(());
        };
        let getters = getters_for(kind);
        if getters.is_empty() {
            return Ok(());
        }
        let cursor = self
            .model
            .get(kind, id)
            .map(|u| u.poll_cursor as usize % getters.len())
            .unwrap_or(0);
        let line = getters[cursor].line(id);

        let outcome = {
            let (engine, model) = (&mut self.engine, &mut self.model);
            let mut sink = VrcopDispatcher::new(model, store);
            engine.send_and_ack(&line, &mut sink).await
        };
        // the attempt consumes the unit's turn either way, so a dead node
        // cannot hold the head of the due list
        if let Some(unit) = self.model.get_mut(kind, id) {
            unit.last_poll = Some(Instant::now());
            unit.poll_cursor = unit.poll_cursor.wrapping_add(1);
        }
        outcome
    }

    /// Execute a host command with the two-stage acknowledgement. A failure
    /// after name resolution is charged to the field the command writes.
    pub async fn execute(&mut self, command: &HostCommand, store: &mut dyn FieldStore) -> Result<()> {
        let line = self.translate(command)?;
        let outcome = {
            let (engine, model) = (&mut self.engine, &mut self.model);
            let mut sink = VrcopDispatcher::new(model, store);
            engine.send_command(&line, &mut sink).await
        };
        if outcome.is_err() {
            if let Some(fid) = self.command_target_field(command) {
                store.note_failed_write(fid);
            }
        }
        outcome
    }

    /// The bound field a command writes, for the host's per-field
    /// failed-write counters.
    fn command_target_field(&self, command: &HostCommand) -> Option<FieldId> {
        let (kind, name, index) = match command {
            HostCommand::UnitOn { unit, .. } | HostCommand::UnitOff { unit, .. } => {
                (UnitKind::Switch, unit, bind::SWITCH_F_ON)
            }
            HostCommand::UnitLevel { unit, .. } => (UnitKind::Switch, unit, bind::SWITCH_F_LEVEL),
            HostCommand::LockDoor { unit } | HostCommand::UnlockDoor { unit } => {
                (UnitKind::Lock, unit, bind::LOCK_F_LOCKED)
            }
            HostCommand::SetSetpoint { unit, kind: SetpointKind::Heat, .. } => {
                (UnitKind::Thermostat, unit, bind::THERMO_F_HEAT)
            }
            HostCommand::SetSetpoint { unit, kind: SetpointKind::Cool, .. } => {
                (UnitKind::Thermostat, unit, bind::THERMO_F_COOL)
            }
            _ => return None,
        };
        self.model
            .lookup_by_name(kind, name)
            .and_then(|u| u.fields.get(index).copied())
    }

    fn translate(&self, command: &HostCommand) -> Result<String> {
        match command {
            HostCommand::UnitOn { unit, .. } => {
                Ok(protocol::switch_on(self.resolve(UnitKind::Switch, unit)?))
            }
            HostCommand::UnitOff { unit, .. } => {
                Ok(protocol::switch_off(self.resolve(UnitKind::Switch, unit)?))
            }
            HostCommand::UnitLevel { unit, level } => {
                // the radio's dim range tops out at 99
                let node = self.resolve(UnitKind::Switch, unit)?;
                Ok(protocol::switch_level(node, (*level).min(99)))
            }
            HostCommand::LockDoor { unit } => {
                Ok(protocol::lock_set(self.resolve(UnitKind::Lock, unit)?, true))
            }
            HostCommand::UnlockDoor { unit } => {
                Ok(protocol::lock_set(self.resolve(UnitKind::Lock, unit)?, false))
            }
            HostCommand::SetSetpoint { unit, kind, degrees, scale } => {
                let node = self.resolve(UnitKind::Thermostat, unit)?;
                let half_c = match scale {
                    crate::command::TempScale::Celsius => degrees * 2,
                    crate::command::TempScale::Fahrenheit => protocol::f_to_half_c(*degrees),
                };
                Ok(protocol::setpoint_set(node, kind.vrcop_selector(), half_c))
            }
            HostCommand::ArmArea { .. }
            | HostCommand::BypassZone { .. }
            | HostCommand::RestoreZone { .. } => {
                Err(DriverError::unsupported("security commands need the panel driver"))
            }
        }
    }

    fn resolve(&self, kind: UnitKind, name: &str) -> Result<u16> {
        self.model
            .lookup_by_name(kind, name)
            .map(|u| u.id)
            .ok_or_else(|| DriverError::unsupported(format!("no {} named '{}'", kind.as_str(), name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::register_unit_fields;
    use crate::config::Timings;
    use crate::field::MemoryFieldStore;
    use crate::model::{Unit, UnitCaps, UnitData};
    use crate::transport::ScriptedTransport;
    use std::time::Duration;

    fn fast_config() -> VrcopConfig {
        VrcopConfig::builder()
            .device("test")
            .timings(Timings {
                reply_timeout: Duration::from_millis(20),
                read_slice: Duration::from_millis(2),
                drain_timeout: Duration::from_millis(1),
                async_grace: Duration::from_millis(20),
                min_send_gap: Duration::from_millis(1),
                transmit_ack_timeout: Duration::from_millis(30),
                poll_round_gap: Duration::ZERO,
                ..Timings::default()
            })
            .build()
    }

    fn driver_with_switch(
        t: ScriptedTransport,
        store: &mut MemoryFieldStore,
    ) -> VrcopDriver<ScriptedTransport> {
        let mut driver = VrcopDriver::from_parts(t, fast_config());
        driver.model_mut().set_capacity(UnitKind::Switch, 232);
        let mut lamp = Unit::new(UnitKind::Switch, 5, "Lamp");
        lamp.caps = UnitCaps::READABLE | UnitCaps::WRITABLE;
        lamp.poll_period = Duration::from_secs(30);
        register_unit_fields(store, &mut lamp).unwrap();
        driver.model_mut().add(lamp).unwrap();
        driver
    }

    #[tokio::test]
    async fn poll_sends_getter_and_advances_cursor() {
        let mut t = ScriptedTransport::new();
        t.release_on_send = true;
        t.push_inbound(b"<E000\r".to_vec());
        let mut store = MemoryFieldStore::new();
        let mut driver = driver_with_switch(t, &mut store);

        driver.service(&mut store).await.unwrap();

        let unit = driver.model().get(UnitKind::Switch, 5).unwrap();
        assert_eq!(unit.poll_cursor, 1);
        assert!(unit.last_poll.is_some());
    }

    #[tokio::test]
    async fn command_round_trip_updates_on_report() {
        let mut t = ScriptedTransport::new();
        t.release_on_send = true;
        // ack, then the node's own report, then the transmit ack
        t.push_inbound(b"<E000\r<N5:32,3,255\r<X000\r".to_vec());
        let mut store = MemoryFieldStore::new();
        let mut driver = driver_with_switch(t, &mut store);

        driver
            .execute(&HostCommand::UnitOn { unit: "Lamp".into(), delay_secs: 0 }, &mut store)
            .await
            .unwrap();

        assert!(matches!(
            driver.model().get(UnitKind::Switch, 5).unwrap().data,
            UnitData::Switch { level: 100, on: true }
        ));
    }

    /// A node that never answers still spends its turn, so successive
    /// rounds move on to the other due units instead of retrying it.
    #[tokio::test]
    async fn failed_poll_still_advances_schedule() {
        let t = ScriptedTransport::new(); // silent
        let mut store = MemoryFieldStore::new();
        let mut driver = driver_with_switch(t, &mut store);
        let mut sconce = Unit::new(UnitKind::Switch, 2, "Sconce");
        sconce.caps = UnitCaps::READABLE | UnitCaps::WRITABLE;
        sconce.poll_period = Duration::from_secs(30);
        register_unit_fields(&mut store, &mut sconce).unwrap();
        driver.model_mut().add(sconce).unwrap();

        driver.service(&mut store).await.unwrap();
        driver.service(&mut store).await.unwrap();

        let polled: Vec<u16> = driver
            .model()
            .units_of(UnitKind::Switch)
            .filter(|u| u.last_poll.is_some())
            .map(|u| u.id)
            .collect();
        assert_eq!(polled, vec![2, 5]);
    }

    #[tokio::test]
    async fn failed_command_is_charged_to_target_field() {
        let t = ScriptedTransport::new(); // no ack ever comes
        let mut store = MemoryFieldStore::new();
        let mut driver = driver_with_switch(t, &mut store);
        let on_field = driver.model().get(UnitKind::Switch, 5).unwrap().fields[crate::bind::SWITCH_F_ON];

        let err = driver
            .execute(&HostCommand::UnitOn { unit: "Lamp".into(), delay_secs: 0 }, &mut store)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Timeout { .. }));
        assert_eq!(store.failed_write_count(on_field), 1);
    }

    #[tokio::test]
    async fn security_commands_are_unsupported() {
        let t = ScriptedTransport::new();
        let mut store = MemoryFieldStore::new();
        let mut driver = driver_with_switch(t, &mut store);
        let err = driver
            .execute(
                &HostCommand::ArmArea { area: "Main".into(), mode: crate::command::ArmMode::Away, code: "1234".into() },
                &mut store,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Unsupported { .. }));
    }
}

// MIT License - Copyright (c) 2026 Peter Wright

use crate::model::{UnitKind, UnitStatus};

/// Events raised toward the host.
///
/// Only emitted when a stored field value actually changed (the field store
/// reports `changed == true`), so re-delivering an identical status report
/// never produces a duplicate event.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// Connection to the device established and the model is ready.
    Connected,
    /// Connection lost; the host lifecycle should reconnect.
    ConnectionLost,
    /// A load (switch/dimmer) changed level.
    LoadChange { unit_id: u16, level: u8 },
    /// A motion/binary sensor tripped or restored.
    Motion { unit_id: u16, active: bool },
    /// A security zone went into or out of alarm.
    ZoneAlarm { zone_id: u16, in_alarm: bool },
    /// A zone's arm state changed (including synthesized area propagation).
    ZoneArmChange { zone_id: u16, armed: bool },
    /// An area reached a settled arm state.
    AreaArmChange { area_id: u16, mode: u8 },
    /// A door lock reported locked/unlocked.
    LockStatus { unit_id: u16, locked: bool },
    /// A user action at the device (button press, keypad code, X-10/UPB link).
    UserAction { kind: UserActionKind, source: u16, param: u16 },
    /// A unit changed lifecycle status (Ready/Error/Missing/Failed).
    UnitStatusChange { kind: UnitKind, unit_id: u16, status: UnitStatus },
    /// Thermostat reading or setpoint changed.
    ThermoChange { unit_id: u16, temp: i16, heat_setpoint: i16, cool_setpoint: i16 },
}

/// Sub-taxonomy for the grab-bag "other notifications" category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserActionKind {
    ButtonPress,
    SecurityArming,
    X10Command,
    UpbLink,
    SceneActivate,
}

/// Type alias for the broadcast sender.
pub type EventSender = tokio::sync::broadcast::Sender<HostEvent>;

/// Type alias for the broadcast receiver.
pub type EventReceiver = tokio::sync::broadcast::Receiver<HostEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}

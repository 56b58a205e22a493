// MIT License - Copyright (c) 2026 Peter Wright

//! Drivers for two home-automation field devices: the HAI Omni family of
//! security/automation panels (encrypted session over TCP) and the Leviton
//! VRCOP Z-Wave serial bridge.
//!
//! Both drivers share one architecture: a single task owns the connection
//! and runs a request/reply engine that interleaves unsolicited device
//! notifications with command replies, a dispatcher that turns decoded
//! frames into typed field updates and change-gated events, and a poll
//! scheduler that refreshes the most overdue unit first and degrades units
//! that stop answering. Device state is published through the [`field`]
//! host-bridge contract; the bundled `homelink2mqtt` binary implements it
//! over MQTT.

pub mod bind;
pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod field;
pub mod model;
pub mod omni;
pub mod poll;
pub mod transport;
pub mod vrcop;

pub use command::HostCommand;
pub use config::{OmniConfig, Timings, VrcopConfig};
pub use error::{DeviceErrorCode, DriverError, Result};
pub use event::{EventReceiver, EventSender, HostEvent};
pub use field::{FieldDef, FieldId, FieldKind, FieldStore, FieldValue, MemoryFieldStore};
pub use model::{DeviceModel, Unit, UnitCaps, UnitKind, UnitStatus};
pub use omni::OmniDriver;
pub use vrcop::VrcopDriver;

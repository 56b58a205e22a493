// MIT License - Copyright (c) 2026 Peter Wright

//! Host field bridge contract.
//!
//! The host framework exposes device state as named, typed fields. The
//! drivers never implement that store; they call through this trait. The
//! bundled MQTT bridge and the tests provide concrete stores.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{DriverError, Result};
use crate::event::HostEvent;

/// Opaque handle to a registered field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub u32);

/// Typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    /// Unsigned cardinal (levels, counts, raw status bytes).
    Card(u32),
    /// Signed integer (temperatures, setpoints).
    Int(i32),
    Str(String),
    StrList(Vec<String>),
}

/// Field kind discriminant used at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Card,
    Int,
    Str,
    StrList,
}

/// Definition of a field to register with the host.
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// Full field name, e.g. `Zone.FrontDoor.Armed`.
    pub name: String,
    pub kind: FieldKind,
    pub writable: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind, writable: bool) -> Self {
        Self { name: name.into(), kind, writable }
    }
}

/// The host's field store.
///
/// `store` returns whether the value actually changed; callers gate event
/// emission on that so identical re-deliveries stay silent.
pub trait FieldStore: Send {
    /// Register a batch of fields, returning one id per definition in order.
    fn register_fields(&mut self, defs: &[FieldDef]) -> Result<Vec<FieldId>>;

    /// Store a value. Returns `true` when the stored value differs from the
    /// previous one. `send_if_changed` requests the host forward the change
    /// to interested parties.
    fn store(&mut self, id: FieldId, value: FieldValue, send_if_changed: bool) -> Result<bool>;

    /// Emit an event trigger to the host.
    fn queue_event_trigger(&mut self, event: HostEvent);

    /// Record a failed field write for the host's per-field error counters.
    fn note_failed_write(&mut self, id: FieldId) {
        let _ = id;
    }
}

/// In-memory field store. Backs the tests and the MQTT bridge's cache.
#[derive(Debug, Default)]
pub struct MemoryFieldStore {
    next_id: u32,
    defs: HashMap<FieldId, FieldDef>,
    values: HashMap<FieldId, FieldValue>,
    events: Vec<HostEvent>,
    failed_writes: HashMap<FieldId, u32>,
}

impl MemoryFieldStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, id: FieldId) -> Option<&FieldValue> {
        self.values.get(&id)
    }

    pub fn def(&self, id: FieldId) -> Option<&FieldDef> {
        self.defs.get(&id)
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<FieldId> {
        self.defs
            .iter()
            .find(|(_, def)| def.name == name)
            .map(|(id, _)| *id)
    }

    /// Events emitted so far, oldest first.
    pub fn events(&self) -> &[HostEvent] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<HostEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn failed_write_count(&self, id: FieldId) -> u32 {
        self.failed_writes.get(&id).copied().unwrap_or(0)
    }
}

impl FieldStore for MemoryFieldStore {
    fn register_fields(&mut self, defs: &[FieldDef]) -> Result<Vec<FieldId>> {
        let mut ids = Vec::with_capacity(defs.len());
        for def in defs {
            if self.lookup_by_name(&def.name).is_some() {
                return Err(DriverError::DuplicateUnit {
                    details: format!("field name already registered: {}", def.name),
                });
            }
            let id = FieldId(self.next_id);
            self.next_id += 1;
            self.defs.insert(id, def.clone());
            ids.push(id);
        }
        Ok(ids)
    }

    fn store(&mut self, id: FieldId, value: FieldValue, _send_if_changed: bool) -> Result<bool> {
        if !self.defs.contains_key(&id) {
            return Err(DriverError::unsupported(format!("unknown field id {:?}", id)));
        }
        let changed = self.values.get(&id) != Some(&value);
        if changed {
            debug!(?id, ?value, "field changed");
            self.values.insert(id, value);
        }
        Ok(changed)
    }

    fn queue_event_trigger(&mut self, event: HostEvent) {
        self.events.push(event);
    }

    fn note_failed_write(&mut self, id: FieldId) {
        *self.failed_writes.entry(id).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_rejects_duplicate_names() {
        let mut store = MemoryFieldStore::new();
        let defs = vec![FieldDef::new("Zone.1.Armed", FieldKind::Bool, false)];
        store.register_fields(&defs).unwrap();
        assert!(store.register_fields(&defs).is_err());
    }

    #[test]
    fn store_reports_changed_only_on_difference() {
        let mut store = MemoryFieldStore::new();
        let ids = store
            .register_fields(&[FieldDef::new("Unit.1.Level", FieldKind::Card, true)])
            .unwrap();
        assert!(store.store(ids[0], FieldValue::Card(50), true).unwrap());
        assert!(!store.store(ids[0], FieldValue::Card(50), true).unwrap());
        assert!(store.store(ids[0], FieldValue::Card(0), true).unwrap());
    }

    #[test]
    fn store_rejects_unknown_id() {
        let mut store = MemoryFieldStore::new();
        assert!(store.store(FieldId(42), FieldValue::Bool(true), true).is_err());
    }
}

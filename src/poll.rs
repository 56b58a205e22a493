// MIT License - Copyright (c) 2026 Peter Wright

//! Shared poll-round planning.
//!
//! The per-driver poll loops differ in how they build requests (the Omni
//! batches by device type, the VRCOP polls one unit per round), but share
//! the round gate, the most-overdue-first due list from the device model,
//! the staleness pass, and the consecutive-failure accounting.

use std::time::Instant;

use tracing::{debug, warn};

use crate::config::Timings;
use crate::error::{DriverError, Result};
use crate::event::HostEvent;
use crate::field::{FieldStore, FieldValue};
use crate::model::{DeviceModel, UnitStatus};

/// Poll round state for one connection.
#[derive(Debug)]
pub struct PollPlanner {
    last_round: Option<Instant>,
    consecutive_failures: u32,
}

impl PollPlanner {
    pub fn new() -> Self {
        Self { last_round: None, consecutive_failures: 0 }
    }

    /// Whether the minimum inter-round interval has elapsed.
    pub fn round_due(&self, now: Instant, timings: &Timings) -> bool {
        match self.last_round {
            Some(t) => now.duration_since(t) >= timings.poll_round_gap,
            None => true,
        }
    }

    /// Record the outcome of a round. The round boundary always advances,
    /// even after a failure, so a broken unit cannot stall the schedule.
    /// Too many consecutive failures surface as a lost connection.
    pub fn complete_round(&mut self, now: Instant, ok: bool, timings: &Timings) -> Result<()> {
        self.last_round = Some(now);
        if ok {
            self.consecutive_failures = 0;
            return Ok(());
        }
        self.consecutive_failures += 1;
        warn!(failures = self.consecutive_failures, "poll round failed");
        if self.consecutive_failures >= timings.max_failed_rounds {
            return Err(DriverError::Disconnected);
        }
        Ok(())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

impl Default for PollPlanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Transition units stale past `stale_multiple` x their own poll period to
/// Error, updating their status field (by convention the first bound field)
/// and raising a status-change event.
pub fn mark_stale_units(
    model: &mut DeviceModel,
    store: &mut dyn FieldStore,
    now: Instant,
    timings: &Timings,
) {
    let mut transitions = Vec::new();
    for unit in model.iter_mut() {
        if unit.status != UnitStatus::Ready {
            continue;
        }
        if unit.is_stale(now, timings.stale_multiple) {
            debug!(kind = unit.kind().as_str(), id = unit.id, "unit stale, marking Error");
            unit.status = UnitStatus::Error;
            transitions.push((unit.kind(), unit.id, unit.fields.first().copied()));
        }
    }
    for (kind, id, status_field) in transitions {
        if let Some(fid) = status_field {
            if let Err(e) = store.store(fid, FieldValue::Str("Error".into()), true) {
                warn!(?fid, error = %e, "status field update failed");
            }
        }
        store.queue_event_trigger(HostEvent::UnitStatusChange {
            kind,
            unit_id: id,
            status: UnitStatus::Error,
        });
    }
}

/// Restore a unit to Ready when a fresh value arrives after an Error.
pub fn mark_unit_fresh(model: &mut DeviceModel, store: &mut dyn FieldStore, kind: crate::model::UnitKind, id: u16, now: Instant) {
    if let Some(unit) = model.get_mut(kind, id) {
        unit.last_value = Some(now);
        if unit.status == UnitStatus::Error {
            unit.status = UnitStatus::Ready;
            if let Some(fid) = unit.fields.first().copied() {
                if let Err(e) = store.store(fid, FieldValue::Str("Ready".into()), true) {
                    warn!(?fid, error = %e, "status field update failed");
                }
            }
            store.queue_event_trigger(HostEvent::UnitStatusChange {
                kind,
                unit_id: id,
                status: UnitStatus::Ready,
            });
        }
    }
}

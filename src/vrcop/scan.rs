// MIT License - Copyright (c) 2026 Peter Wright

//! VRCOP network enumeration.
//!
//! The dongle has no bulk topology dump, so discovery is a per-id,
//! per-class sweep of existence queries. Node reports are not dispatched
//! while the sweep runs; the model is not ready for them until binding has
//! finished. Re-running the sweep after `prepare_for_rescan` reconciles:
//! nodes that answer again return to Ready, the rest stay Missing.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bind::register_unit_fields;
use crate::config::VrcopConfig;
use crate::error::Result;
use crate::field::{FieldStore, FieldValue};
use crate::model::{DeviceModel, Unit, UnitCaps, UnitStatus};
use crate::transport::Transport;

use super::engine::VrcopEngine;
use super::protocol::{exists_query, scan_classes};

pub async fn enumerate<T: Transport>(
    engine: &mut VrcopEngine<T>,
    config: &VrcopConfig,
    model: &mut DeviceModel,
    store: &mut dyn FieldStore,
) -> Result<()> {
    info!(max_node = config.max_node_id, "scanning Z-Wave network");
    let mut found_count = 0usize;

    for sc in scan_classes() {
        model.set_capacity(sc.kind, config.max_node_id);
        for id in 1..=config.max_node_id {
            let reported = engine
                .query_exists(&exists_query(id, sc.class), config.scan_reply_timeout)
                .await?;
            if reported == 0 {
                continue;
            }
            if reported != id {
                // the dongle answered for a different node than asked
                warn!(queried = id, reported, class = sc.class, "topology error in scan reply");
                continue;
            }

            if let Some(existing) = model.get_mut(sc.kind, id) {
                // seen before (earlier class or a previous scan)
                if existing.status == UnitStatus::Missing {
                    debug!(kind = sc.kind.as_str(), id, "node reappeared");
                    existing.status = UnitStatus::Ready;
                    if existing.fields.is_empty() {
                        if let Err(e) = register_unit_fields(store, existing) {
                            warn!(kind = sc.kind.as_str(), id, error = %e, "field rebinding failed");
                            existing.status = UnitStatus::Failed;
                        }
                    }
                }
                existing.caps |= sc.caps;
                continue;
            }

            // the id may belong to a unit of another kind: an earlier class
            // this sweep claimed it (first match wins), or the node changed
            // class since the last sweep and left a Missing husk behind
            let other = model
                .iter()
                .find(|u| u.id == id && u.kind() != sc.kind)
                .map(|u| (u.kind(), u.status));
            if let Some((old_kind, status)) = other {
                if status == UnitStatus::Missing {
                    debug!(old = old_kind.as_str(), new = sc.kind.as_str(), id, "node changed class");
                    model.remove(old_kind, id);
                } else {
                    if let Some(u) = model.get_mut(old_kind, id) {
                        u.caps |= sc.caps;
                    }
                    continue;
                }
            }

            let mut unit = Unit::new(sc.kind, id, format!("{}{}", sc.kind.as_str(), id));
            unit.caps = sc.caps;
            unit.poll_period = if sc.caps.contains(UnitCaps::BATTERY) || sc.getters.is_empty() {
                Duration::ZERO
            } else {
                config.default_poll_period
            };
            if let Err(e) = register_unit_fields(store, &mut unit) {
                warn!(kind = sc.kind.as_str(), id, error = %e, "field binding failed");
                unit.status = UnitStatus::Failed;
            } else if let Some(&status_field) = unit.fields.first() {
                if let Err(e) = store.store(status_field, FieldValue::Str("Ready".into()), true) {
                    warn!(kind = sc.kind.as_str(), id, error = %e, "status field update failed");
                }
            }
            debug!(kind = sc.kind.as_str(), id, "node found");
            model.add(unit)?;
            found_count += 1;
        }
    }

    // unconfirmed nodes stay Missing and lose their field bindings
    for unit in model.iter_mut() {
        if unit.status == UnitStatus::Missing && !unit.fields.is_empty() {
            debug!(kind = unit.kind().as_str(), id = unit.id, "node gone, dropping fields");
            unit.fields.clear();
        }
    }

    info!(found = found_count, total = model.len(), "scan complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timings;
    use crate::field::MemoryFieldStore;
    use crate::model::UnitKind;
    use crate::transport::ScriptedTransport;

    fn fast_config() -> VrcopConfig {
        VrcopConfig::builder()
            .device("test")
            .max_node_id(3)
            .scan_reply_timeout(Duration::from_millis(5))
            .timings(Timings {
                read_slice: Duration::from_millis(1),
                min_send_gap: Duration::from_millis(1),
                ..Timings::default()
            })
            .build()
    }

    /// Scripted sweep: node 2 is a multilevel switch, everything else
    /// silent. Six classes x three ids = eighteen queries.
    #[tokio::test]
    async fn scan_builds_units_from_replies() {
        let mut t = ScriptedTransport::new();
        t.release_on_send = true;
        // first class probed is the multilevel switch
        t.push_inbound(b"<F0\r".to_vec());
        t.push_inbound(b"<F2\r".to_vec());
        // all later queries answered absent
        for _ in 0..16 {
            t.push_inbound(b"<F0\r".to_vec());
        }
        let mut engine = VrcopEngine::new(t, fast_config().timings.clone());
        let mut model = DeviceModel::new();
        let mut store = MemoryFieldStore::new();

        enumerate(&mut engine, &fast_config(), &mut model, &mut store).await.unwrap();

        assert_eq!(model.len(), 1);
        let unit = model.get(UnitKind::Switch, 2).unwrap();
        assert_eq!(unit.name, "Switch2");
        assert!(unit.caps.contains(UnitCaps::WRITABLE));
        assert_eq!(unit.fields.len(), 3);
    }

    #[tokio::test]
    async fn mismatched_reply_id_is_topology_error() {
        let mut t = ScriptedTransport::new();
        t.release_on_send = true;
        t.push_inbound(b"<F9\r".to_vec()); // answer for the wrong node
        for _ in 0..17 {
            t.push_inbound(b"<F0\r".to_vec());
        }
        let mut engine = VrcopEngine::new(t, fast_config().timings.clone());
        let mut model = DeviceModel::new();
        let mut store = MemoryFieldStore::new();
        enumerate(&mut engine, &fast_config(), &mut model, &mut store).await.unwrap();
        assert!(model.is_empty());
    }

    /// A node that never answers the second sweep stays Missing and its
    /// field bindings are dropped.
    #[tokio::test]
    async fn rescan_strips_fields_from_vanished_nodes() {
        let mut model = DeviceModel::new();
        let mut store = MemoryFieldStore::new();

        let mut first = ScriptedTransport::new();
        first.release_on_send = true;
        first.push_inbound(b"<F0\r".to_vec());
        first.push_inbound(b"<F2\r".to_vec());
        for _ in 0..16 {
            first.push_inbound(b"<F0\r".to_vec());
        }
        let mut engine = VrcopEngine::new(first, fast_config().timings.clone());
        enumerate(&mut engine, &fast_config(), &mut model, &mut store).await.unwrap();
        assert!(!model.get(UnitKind::Switch, 2).unwrap().fields.is_empty());

        model.prepare_for_rescan();
        let mut second = ScriptedTransport::new();
        second.release_on_send = true;
        for _ in 0..18 {
            second.push_inbound(b"<F0\r".to_vec());
        }
        let mut engine = VrcopEngine::new(second, fast_config().timings.clone());
        enumerate(&mut engine, &fast_config(), &mut model, &mut store).await.unwrap();

        let unit = model.get(UnitKind::Switch, 2).unwrap();
        assert_eq!(unit.status, UnitStatus::Missing);
        assert!(unit.fields.is_empty());
    }

    /// A node that answers under a different class after a rescan replaces
    /// the old unit instead of leaving a Missing duplicate behind.
    #[tokio::test]
    async fn rescan_replaces_node_that_changed_class() {
        let mut model = DeviceModel::new();
        let mut store = MemoryFieldStore::new();

        // node 2 answers the multilevel switch class
        let mut first = ScriptedTransport::new();
        first.release_on_send = true;
        first.push_inbound(b"<F0\r".to_vec());
        first.push_inbound(b"<F2\r".to_vec());
        for _ in 0..16 {
            first.push_inbound(b"<F0\r".to_vec());
        }
        let mut engine = VrcopEngine::new(first, fast_config().timings.clone());
        enumerate(&mut engine, &fast_config(), &mut model, &mut store).await.unwrap();

        // after the rescan it answers only the multilevel sensor class
        // (query 14 of 18 in scan order)
        model.prepare_for_rescan();
        let mut second = ScriptedTransport::new();
        second.release_on_send = true;
        for _ in 0..13 {
            second.push_inbound(b"<F0\r".to_vec());
        }
        second.push_inbound(b"<F2\r".to_vec());
        for _ in 0..4 {
            second.push_inbound(b"<F0\r".to_vec());
        }
        let mut engine = VrcopEngine::new(second, fast_config().timings.clone());
        enumerate(&mut engine, &fast_config(), &mut model, &mut store).await.unwrap();

        assert!(model.get(UnitKind::Switch, 2).is_none());
        assert_eq!(model.get(UnitKind::Sensor, 2).unwrap().status, UnitStatus::Ready);
        assert_eq!(model.len(), 1);
    }

    #[tokio::test]
    async fn rescan_restores_reappearing_nodes() {
        let mut model = DeviceModel::new();
        let mut store = MemoryFieldStore::new();

        let mut first = ScriptedTransport::new();
        first.release_on_send = true;
        first.push_inbound(b"<F0\r".to_vec());
        first.push_inbound(b"<F2\r".to_vec());
        for _ in 0..16 {
            first.push_inbound(b"<F0\r".to_vec());
        }
        let mut engine = VrcopEngine::new(first, fast_config().timings.clone());
        enumerate(&mut engine, &fast_config(), &mut model, &mut store).await.unwrap();

        model.prepare_for_rescan();
        assert_eq!(model.get(UnitKind::Switch, 2).unwrap().status, UnitStatus::Missing);

        let mut second = ScriptedTransport::new();
        second.release_on_send = true;
        second.push_inbound(b"<F0\r".to_vec());
        second.push_inbound(b"<F2\r".to_vec());
        for _ in 0..16 {
            second.push_inbound(b"<F0\r".to_vec());
        }
        let mut engine = VrcopEngine::new(second, fast_config().timings.clone());
        enumerate(&mut engine, &fast_config(), &mut model, &mut store).await.unwrap();

        assert_eq!(model.get(UnitKind::Switch, 2).unwrap().status, UnitStatus::Ready);
        assert_eq!(model.len(), 1);
    }
}

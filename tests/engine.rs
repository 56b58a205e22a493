// MIT License - Copyright (c) 2026 Peter Wright

//! End-to-end exercises of the public driver API: a scripted Omni panel on
//! the far side of a duplex pipe, and a scripted VRCOP behind the serial
//! line discipline.

use std::time::{Duration, Instant};

use homelink_bridge::bind::register_unit_fields;
use homelink_bridge::omni::codec::OmniCodec;
use homelink_bridge::omni::engine::{Expect, NullSink, OmniEngine};
use homelink_bridge::omni::protocol::{self, msg, packet, Message, ObjType};
use homelink_bridge::omni::session::{derive_session_key, establish};
use homelink_bridge::transport::{ScriptedTransport, StreamTransport, Transport};
use homelink_bridge::{
    DeviceModel, FieldValue, HostCommand, HostEvent, MemoryFieldStore, OmniConfig, Timings, Unit,
    UnitKind, VrcopConfig, VrcopDriver,
};

const KEY: [u8; 16] = [0x42; 16];
const SESSION_ID: [u8; 5] = [9, 8, 7, 6, 5];

fn fast_timings() -> Timings {
    Timings {
        reply_timeout: Duration::from_millis(500),
        read_slice: Duration::from_millis(10),
        drain_timeout: Duration::from_millis(2),
        async_grace: Duration::from_millis(100),
        min_send_gap: Duration::from_millis(1),
        transmit_ack_timeout: Duration::from_millis(200),
        ..Timings::default()
    }
}

/// Handshake plus one request/reply exchange against a live scripted panel.
/// The panel keeps its own codec with the same pre-shared key; sequences
/// stay in lockstep because each side allocates one per exchange.
#[tokio::test]
async fn omni_handshake_then_request_reply_over_pipe() {
    let (near, far) = tokio::io::duplex(4096);

    let panel = tokio::spawn(async move {
        let mut t = StreamTransport::new(far);
        let mut codec = OmniCodec::new(true);
        let wait = Duration::from_secs(1);

        // new-session request is a bare header
        t.recv_exact(4, wait).await.unwrap();
        let mut ack = vec![0u8, 2];
        ack.extend_from_slice(&SESSION_ID);
        let (_, wire) = codec.encode_session(packet::NEW_SESSION_ACK, &ack);
        t.send(&wire).await.unwrap();

        codec.set_key(&derive_session_key(&KEY, &SESSION_ID));

        // secure-session request: header plus one encrypted block
        t.recv_exact(20, wait).await.unwrap();
        let (_, wire) = codec.encode_session(packet::SECURE_SESSION_ACK, &SESSION_ID);
        t.send(&wire).await.unwrap();

        // capacity request fits a single block
        t.recv_exact(20, wait).await.unwrap();
        let reply = Message::new(msg::OBJ_CAP_REPLY, vec![ObjType::Zone as u8, 0, 16]);
        let (_, wire) = codec.encode_message(&reply).unwrap();
        t.send(&wire).await.unwrap();
    });

    let mut transport = StreamTransport::new(near);
    let mut codec = OmniCodec::new(true);
    let config = OmniConfig::builder()
        .host("test")
        .key(KEY)
        .handshake_timeout(Duration::from_secs(1))
        .build();
    establish(&mut transport, &mut codec, &config).await.unwrap();
    assert!(codec.has_key());

    let mut engine = OmniEngine::new(transport, codec, fast_timings());
    let reply = engine
        .send_and_wait(
            &protocol::obj_capacity_req(ObjType::Zone),
            &Expect::reply(msg::OBJ_CAP_REPLY),
            &mut NullSink,
        )
        .await
        .unwrap();
    assert_eq!(reply.u16_at(1), Some(16));

    panel.await.unwrap();
}

fn vrcop_config() -> VrcopConfig {
    VrcopConfig::builder()
        .device("test")
        .max_node_id(3)
        .scan_reply_timeout(Duration::from_millis(5))
        .default_poll_period(Duration::from_secs(30))
        .timings(fast_timings())
        .build()
}

/// Full VRCOP cycle: sweep the network, then run a named command through
/// both acknowledgement stages and watch the node's own report land in the
/// field store.
#[tokio::test]
async fn vrcop_scan_then_command_round_trip() {
    let mut t = ScriptedTransport::new();
    t.release_on_send = true;
    // sweep: the first probed class is the multilevel switch; node 2 answers
    t.push_inbound(b"<F0\r".to_vec());
    t.push_inbound(b"<F2\r".to_vec());
    for _ in 0..16 {
        t.push_inbound(b"<F0\r".to_vec());
    }
    // command: dongle ack, the node's report, transmission ack
    t.push_inbound(b"<E000\r<N2:38,3,55\r<X000\r".to_vec());

    let mut store = MemoryFieldStore::new();
    let mut driver = VrcopDriver::from_parts(t, vrcop_config());
    driver.initialise(&mut store).await.unwrap();

    assert!(store.events().contains(&HostEvent::Connected));
    assert_eq!(driver.model().len(), 1);

    let command = HostCommand::parse("UnitLevel:Switch2,55").unwrap();
    driver.execute(&command, &mut store).await.unwrap();

    let level = store.lookup_by_name("Switch.Switch2.Level").unwrap();
    assert_eq!(store.value(level), Some(&FieldValue::Card(55)));
    assert!(store.events().contains(&HostEvent::LoadChange { unit_id: 2, level: 55 }));
}

/// A report split across physical lines with the continuation backslash is
/// reassembled before dispatch.
#[tokio::test]
async fn split_report_is_reassembled_and_applied() {
    let mut t = ScriptedTransport::new();
    t.push_inbound(b"<N6:48,3\\\r<N6:255\r".to_vec());

    let mut store = MemoryFieldStore::new();
    let mut driver = VrcopDriver::from_parts(t, vrcop_config());
    driver.model_mut().set_capacity(UnitKind::Sensor, 232);
    let mut sensor = Unit::new(UnitKind::Sensor, 6, "Hall");
    register_unit_fields(&mut store, &mut sensor).unwrap();
    driver.model_mut().add(sensor).unwrap();

    driver.service(&mut store).await.unwrap();

    assert!(store.events().contains(&HostEvent::Motion { unit_id: 6, active: true }));
    let active = store.lookup_by_name("Sensor.Hall.Active").unwrap();
    assert_eq!(store.value(active), Some(&FieldValue::Bool(true)));
}

/// Identical redelivery of a report stores the same values and raises no
/// second event.
#[tokio::test]
async fn redelivered_report_raises_no_second_event() {
    let mut t = ScriptedTransport::new();
    t.push_inbound(b"<N6:48,3,255\r<N6:48,3,255\r".to_vec());

    let mut store = MemoryFieldStore::new();
    let mut driver = VrcopDriver::from_parts(t, vrcop_config());
    driver.model_mut().set_capacity(UnitKind::Sensor, 232);
    let mut sensor = Unit::new(UnitKind::Sensor, 6, "Hall");
    register_unit_fields(&mut store, &mut sensor).unwrap();
    driver.model_mut().add(sensor).unwrap();

    driver.service(&mut store).await.unwrap();

    let motion: Vec<_> = store
        .events()
        .iter()
        .filter(|e| matches!(e, HostEvent::Motion { .. }))
        .collect();
    assert_eq!(motion.len(), 1);
}

/// Poll ordering: never-polled units first, then by how far past due.
#[test]
fn most_overdue_unit_is_scheduled_first() {
    let base = Instant::now();
    let mut model = DeviceModel::new();
    model.set_capacity(UnitKind::Switch, 10);

    let mut recent = Unit::new(UnitKind::Switch, 1, "Recent");
    recent.poll_period = Duration::from_secs(5);
    recent.last_poll = Some(base + Duration::from_secs(10));
    model.add(recent).unwrap();

    let mut overdue = Unit::new(UnitKind::Switch, 2, "Overdue");
    overdue.poll_period = Duration::from_secs(5);
    overdue.last_poll = Some(base + Duration::from_secs(2));
    model.add(overdue).unwrap();

    let mut fresh = Unit::new(UnitKind::Switch, 3, "NeverPolled");
    fresh.poll_period = Duration::from_secs(5);
    model.add(fresh).unwrap();

    let due = model.due_for_poll(base + Duration::from_secs(20));
    assert_eq!(
        due,
        vec![
            (UnitKind::Switch, 3),
            (UnitKind::Switch, 2),
            (UnitKind::Switch, 1),
        ]
    );
}

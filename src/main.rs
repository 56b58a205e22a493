// MIT License - Copyright (c) 2026 Peter Wright
// MQTT bridge

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use serde_json::json;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use homelink_bridge::{
    DriverError, FieldDef, FieldId, FieldStore, FieldValue, HostCommand, HostEvent,
    MemoryFieldStore, OmniConfig, OmniDriver, Timings, VrcopConfig, VrcopDriver,
};

/// Pause between service iterations while the command channel is idle.
const SERVICE_TICK: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "homelink2mqtt")]
#[command(about = "Bridge between HAI Omni / Leviton VRCOP hardware and MQTT")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Config {
    mqtt: MqttToml,
    #[serde(default)]
    omni: Option<OmniToml>,
    #[serde(default)]
    vrcop: Option<VrcopToml>,
}

#[derive(Debug, Deserialize)]
struct MqttToml {
    url: String,
    #[serde(default = "default_client_id")]
    client_id: String,
    #[serde(default = "default_publish_topic")]
    publish_topic: String,
    #[serde(default = "default_subscribe_topic")]
    subscribe_topic: String,
}

fn default_client_id() -> String {
    "homelink-bridge".to_string()
}
fn default_publish_topic() -> String {
    "homelink".to_string()
}
fn default_subscribe_topic() -> String {
    "homelink/cmd".to_string()
}

#[derive(Debug, Deserialize)]
struct OmniToml {
    host: String,
    #[serde(default = "default_omni_port")]
    port: u16,
    /// 32 hex digits, separators optional
    key: String,
    #[serde(default = "default_true")]
    tolerate_swapped_crc: bool,
    #[serde(default = "default_omni_poll")]
    poll_period_secs: u64,
    #[serde(default = "default_reconnect_delay")]
    reconnect_delay_ms: u64,
}

fn default_omni_port() -> u16 {
    4369
}
fn default_true() -> bool {
    true
}
fn default_omni_poll() -> u64 {
    60
}
fn default_reconnect_delay() -> u64 {
    10000
}

#[derive(Debug, Deserialize)]
struct VrcopToml {
    device: String,
    #[serde(default = "default_baud")]
    baud: u32,
    #[serde(default = "default_max_node")]
    max_node_id: u16,
    #[serde(default = "default_vrcop_poll")]
    poll_period_secs: u64,
    #[serde(default = "default_reconnect_delay")]
    reconnect_delay_ms: u64,
}

fn default_baud() -> u32 {
    9600
}
fn default_max_node() -> u16 {
    232
}
fn default_vrcop_poll() -> u64 {
    30
}

fn build_omni_config(toml: &OmniToml) -> Result<OmniConfig> {
    let key = homelink_bridge::config::parse_key(&toml.key)
        .context("omni.key must be 32 hex digits")?;
    Ok(OmniConfig::builder()
        .host(&toml.host)
        .port(toml.port)
        .key(key)
        .tolerate_swapped_crc(toml.tolerate_swapped_crc)
        .default_poll_period(Duration::from_secs(toml.poll_period_secs))
        .timings(Timings::default())
        .build())
}

fn build_vrcop_config(toml: &VrcopToml) -> VrcopConfig {
    VrcopConfig::builder()
        .device(&toml.device)
        .baud(toml.baud)
        .max_node_id(toml.max_node_id)
        .default_poll_period(Duration::from_secs(toml.poll_period_secs))
        .timings(Timings::default())
        .build()
}

// ---------------------------------------------------------------------------
// MQTT field store
// ---------------------------------------------------------------------------

/// Field store that mirrors changed fields and events onto MQTT.
///
/// The drivers call this store synchronously from inside their connection
/// task, so publishes are queued here and flushed through the async client
/// after each driver call returns.
struct MqttFieldStore {
    prefix: String,
    inner: MemoryFieldStore,
    outbound: Vec<(String, String, bool)>,
}

impl MqttFieldStore {
    fn new(prefix: &str) -> Self {
        Self { prefix: prefix.to_string(), inner: MemoryFieldStore::new(), outbound: Vec::new() }
    }

    fn field_value_json(value: &FieldValue) -> serde_json::Value {
        match value {
            FieldValue::Bool(b) => json!(b),
            FieldValue::Card(c) => json!(c),
            FieldValue::Int(i) => json!(i),
            FieldValue::Str(s) => json!(s),
            FieldValue::StrList(l) => json!(l),
        }
    }

    async fn flush(&mut self, client: &AsyncClient) {
        for (topic, payload, retain) in self.outbound.drain(..) {
            if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, retain, payload).await {
                error!("Failed to publish to {topic}: {e}");
            }
        }
    }
}

impl FieldStore for MqttFieldStore {
    fn register_fields(
        &mut self,
        defs: &[FieldDef],
    ) -> homelink_bridge::error::Result<Vec<FieldId>> {
        self.inner.register_fields(defs)
    }

    fn store(
        &mut self,
        id: FieldId,
        value: FieldValue,
        send_if_changed: bool,
    ) -> homelink_bridge::error::Result<bool> {
        let changed = self.inner.store(id, value.clone(), send_if_changed)?;
        if changed && send_if_changed {
            if let Some(def) = self.inner.def(id) {
                let topic = format!("{}/field/{}", self.prefix, def.name);
                let payload = json!({
                    "now": now_epoch_ms(),
                    "value": Self::field_value_json(&value),
                })
                .to_string();
                self.outbound.push((topic, payload, true));
            }
        }
        Ok(changed)
    }

    fn queue_event_trigger(&mut self, event: HostEvent) {
        let topic = format!("{}/event", self.prefix);
        self.outbound.push((topic, event_json(&event).to_string(), false));
        self.inner.queue_event_trigger(event);
    }

    fn note_failed_write(&mut self, id: FieldId) {
        self.inner.note_failed_write(id);
    }
}

fn now_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Flat {now, op, ...} JSON, one object per event.
fn event_json(event: &HostEvent) -> serde_json::Value {
    let now = now_epoch_ms();
    match event {
        HostEvent::Connected => json!({"now": now, "op": "CONNECTED"}),
        HostEvent::ConnectionLost => json!({"now": now, "op": "CONNECTION_LOST"}),
        HostEvent::LoadChange { unit_id, level } => {
            json!({"now": now, "op": "LOAD_CHANGE", "unit": unit_id, "level": level})
        }
        HostEvent::Motion { unit_id, active } => {
            json!({"now": now, "op": "MOTION", "unit": unit_id, "active": active})
        }
        HostEvent::ZoneAlarm { zone_id, in_alarm } => {
            json!({"now": now, "op": "ZONE_ALARM", "zone": zone_id, "alarm": in_alarm})
        }
        HostEvent::ZoneArmChange { zone_id, armed } => {
            json!({"now": now, "op": "ZONE_ARM", "zone": zone_id, "armed": armed})
        }
        HostEvent::AreaArmChange { area_id, mode } => {
            json!({"now": now, "op": "AREA_ARM", "area": area_id, "mode": mode})
        }
        HostEvent::LockStatus { unit_id, locked } => {
            json!({"now": now, "op": "LOCK", "unit": unit_id, "locked": locked})
        }
        HostEvent::UserAction { kind, source, param } => {
            json!({"now": now, "op": "USER_ACTION", "kind": format!("{kind:?}"), "source": source, "param": param})
        }
        HostEvent::UnitStatusChange { kind, unit_id, status } => {
            json!({"now": now, "op": "UNIT_STATUS", "kind": kind.as_str(), "unit": unit_id, "status": format!("{status:?}")})
        }
        HostEvent::ThermoChange { unit_id, temp, heat_setpoint, cool_setpoint } => {
            // temperatures are half-degrees Celsius throughout the drivers
            json!({"now": now, "op": "THERMO", "unit": unit_id, "temp": temp, "heat": heat_setpoint, "cool": cool_setpoint})
        }
    }
}

// ---------------------------------------------------------------------------
// Driver tasks
// ---------------------------------------------------------------------------

/// Execute one command against a driver, logging the outcome. `Unsupported`
/// is quiet: with both drivers running, each command is offered to both and
/// only one of them handles it.
fn log_command_outcome(label: &str, text: &str, result: &homelink_bridge::error::Result<()>) {
    match result {
        Ok(()) => info!("{label}: command '{text}' succeeded"),
        Err(DriverError::Unsupported { details }) => {
            debug!("{label}: command '{text}' not for this driver: {details}");
        }
        Err(e) => error!("{label}: command '{text}' failed: {e}"),
    }
}

/// Consecutive connect failures double the retry delay up to eight times
/// the configured base; a successful connection resets it.
fn next_backoff(current: Duration, base: Duration) -> Duration {
    (current * 2).min(base * 8)
}

async fn run_omni(
    config: OmniConfig,
    reconnect_delay: Duration,
    topic_prefix: String,
    client: AsyncClient,
    mut commands: broadcast::Receiver<String>,
) {
    let mut backoff = reconnect_delay;
    loop {
        // Field registrations live for one connection; a fresh store per
        // attempt keeps rebinding after reconnect free of stale names.
        let mut store = MqttFieldStore::new(&topic_prefix);
        info!("Connecting to Omni panel at {}:{}", config.host, config.port);
        let mut driver = match OmniDriver::connect(config.clone(), &mut store).await {
            Ok(d) => d,
            Err(e) => {
                error!("Omni connect failed: {e}");
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff, reconnect_delay);
                continue;
            }
        };
        backoff = reconnect_delay;
        store.flush(&client).await;
        info!(units = driver.model().len(), "Omni panel connected");

        'session: loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Ok(text) => match HostCommand::parse(&text) {
                        Ok(parsed) => {
                            let result = driver.execute(&parsed, &mut store).await;
                            log_command_outcome("omni", &text, &result);
                            if let Err(e) = result {
                                if e.is_connection_fatal() {
                                    break 'session;
                                }
                            }
                        }
                        Err(e) => warn!("Unparseable command '{text}': {e}"),
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Omni command receiver lagged, dropped {n}");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = tokio::time::sleep(SERVICE_TICK) => {
                    if let Err(e) = driver.service(&mut store).await {
                        if e.is_connection_fatal() {
                            error!("Omni connection lost: {e}");
                            break 'session;
                        }
                        warn!("Omni service error: {e}");
                    }
                }
            }
            store.flush(&client).await;
        }

        store.queue_event_trigger(HostEvent::ConnectionLost);
        store.flush(&client).await;
        if let Err(e) = driver.shutdown().await {
            debug!("Omni shutdown: {e}");
        }
        tokio::time::sleep(reconnect_delay).await;
    }
}

async fn run_vrcop(
    config: VrcopConfig,
    reconnect_delay: Duration,
    topic_prefix: String,
    client: AsyncClient,
    mut commands: broadcast::Receiver<String>,
) {
    let mut backoff = reconnect_delay;
    loop {
        let mut store = MqttFieldStore::new(&topic_prefix);
        info!("Opening VRCOP serial port {}", config.device);
        let mut driver = match VrcopDriver::connect(config.clone(), &mut store).await {
            Ok(d) => d,
            Err(e) => {
                error!("VRCOP connect failed: {e}");
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff, reconnect_delay);
                continue;
            }
        };
        backoff = reconnect_delay;
        store.flush(&client).await;
        info!(units = driver.model().len(), "VRCOP connected");

        'session: loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Ok(text) => match HostCommand::parse(&text) {
                        Ok(parsed) => {
                            let result = driver.execute(&parsed, &mut store).await;
                            log_command_outcome("vrcop", &text, &result);
                            if let Err(e) = result {
                                if e.is_connection_fatal() {
                                    break 'session;
                                }
                            }
                        }
                        Err(e) => warn!("Unparseable command '{text}': {e}"),
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("VRCOP command receiver lagged, dropped {n}");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = tokio::time::sleep(SERVICE_TICK) => {
                    if let Err(e) = driver.service(&mut store).await {
                        if e.is_connection_fatal() {
                            error!("VRCOP connection lost: {e}");
                            break 'session;
                        }
                        warn!("VRCOP service error: {e}");
                    }
                }
            }
            store.flush(&client).await;
        }

        store.queue_event_trigger(HostEvent::ConnectionLost);
        store.flush(&client).await;
        tokio::time::sleep(reconnect_delay).await;
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or
    // RUST_LOG=homelink_bridge=trace). Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();

    let config_text =
        std::fs::read_to_string(&cli.config).context("Failed to read config file")?;
    let config: Config = toml::from_str(&config_text).context("Failed to parse config file")?;

    if config.omni.is_none() && config.vrcop.is_none() {
        anyhow::bail!("config enables neither [omni] nor [vrcop]");
    }

    let (mqtt_host, mqtt_port) = parse_mqtt_url(&config.mqtt.url)?;
    let mut mqtt_opts = MqttOptions::new(&config.mqtt.client_id, mqtt_host, mqtt_port);
    mqtt_opts.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqtt_opts, 256);

    client
        .subscribe(&config.mqtt.subscribe_topic, QoS::AtLeastOnce)
        .await
        .context("Failed to subscribe to MQTT topic")?;
    info!("MQTT: subscribed to {}", config.mqtt.subscribe_topic);

    // Inbound command fan-out: every payload on the subscribe topic is
    // offered to every running driver.
    let (command_tx, _) = broadcast::channel::<String>(64);

    let mut handles = Vec::new();

    if let Some(omni_toml) = &config.omni {
        let omni_config = build_omni_config(omni_toml)?;
        let reconnect = Duration::from_millis(omni_toml.reconnect_delay_ms);
        let prefix = format!("{}/omni", config.mqtt.publish_topic);
        handles.push(tokio::spawn(run_omni(
            omni_config,
            reconnect,
            prefix,
            client.clone(),
            command_tx.subscribe(),
        )));
    }

    if let Some(vrcop_toml) = &config.vrcop {
        let vrcop_config = build_vrcop_config(vrcop_toml);
        let reconnect = Duration::from_millis(vrcop_toml.reconnect_delay_ms);
        let prefix = format!("{}/vrcop", config.mqtt.publish_topic);
        handles.push(tokio::spawn(run_vrcop(
            vrcop_config,
            reconnect,
            prefix,
            client.clone(),
            command_tx.subscribe(),
        )));
    }

    // MQTT event loop: receives command payloads, re-subscribes on reconnect
    let sub_topic = config.mqtt.subscribe_topic.clone();
    let client_sub = client.clone();
    let command_fanout = command_tx.clone();
    let mqtt_handle = tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    // rumqttc does not auto-resubscribe after a broker
                    // restart; without this we silently stop receiving
                    // commands.
                    info!("MQTT: connected, subscribing to {sub_topic}");
                    if let Err(e) = client_sub.subscribe(&sub_topic, QoS::AtLeastOnce).await {
                        error!("Failed to subscribe to {sub_topic}: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(msg))) => {
                    if msg.topic == sub_topic {
                        let payload = String::from_utf8_lossy(&msg.payload).into_owned();
                        info!("MQTT command received: {payload}");
                        let _ = command_fanout.send(payload);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT event loop error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    info!("Bridge running. SIGINT/SIGTERM to stop.");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
    }

    mqtt_handle.abort();
    for handle in handles {
        handle.abort();
    }

    info!("Shutdown complete");
    Ok(())
}

/// Parse an MQTT URL like "mqtt://host:port" into (host, port).
fn parse_mqtt_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);
    let (host, port_str) = stripped
        .rsplit_once(':')
        .context("MQTT URL must be in format mqtt://host:port")?;
    let port: u16 = port_str.parse().context("Invalid MQTT port number")?;
    Ok((host.to_string(), port))
}

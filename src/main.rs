// MIT License - Copyright (c) 2026 Peter Wright
// MQTT bridge

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, warn};

use bluebolt_cv2::{
    BlueBoltDevice, DeviceConfig, DeviceEvent, DeviceModel, DeviceMonitor, OutletCommand,
    StatusReading,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "bluebolt2mqtt")]
#[command(about = "Bridge between BlueBOLT CV2 power conditioners and MQTT")]
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
    devices: Vec<DeviceToml>,
}

#[derive(Debug, Clone, Deserialize)]
struct DeviceToml {
    /// Topic segment and log label for this device
    name: String,
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    /// MAC address of the CV2 card; used as the authentication token
    mac: String,
    /// Expected model name (e.g. "M4320-PRO"). Only checked against what the
    /// card reports.
    #[serde(default)]
    model: Option<String>,
    #[serde(default = "default_scan_interval")]
    scan_interval_secs: u64,
    #[serde(default = "default_timeout")]
    timeout_ms: u64,
    #[serde(default = "default_retries")]
    retries: u32,
    #[serde(default = "default_reconnect_delay")]
    reconnect_delay_secs: u64,
    #[serde(default, deserialize_with = "deserialize_outlet_names")]
    outlet_names: HashMap<u8, String>,
}

fn deserialize_outlet_names<'de, D>(deserializer: D) -> Result<HashMap<u8, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let string_map: HashMap<String, String> = HashMap::deserialize(deserializer)?;
    string_map
        .into_iter()
        .map(|(k, v)| {
            k.parse::<u8>()
                .map(|id| (id, v))
                .map_err(|_| serde::de::Error::custom(format!("invalid outlet ID: {k}")))
        })
        .collect()
}

fn default_port() -> u16 {
    bluebolt_cv2::constants::DEFAULT_PORT
}
fn default_scan_interval() -> u64 {
    bluebolt_cv2::constants::DEFAULT_SCAN_INTERVAL.as_secs()
}
fn default_timeout() -> u64 {
    bluebolt_cv2::constants::DEFAULT_TIMEOUT.as_millis() as u64
}
fn default_retries() -> u32 {
    bluebolt_cv2::constants::DEFAULT_RETRIES
}
fn default_reconnect_delay() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
struct MqttToml {
    url: String,
    #[serde(default = "default_client_id")]
    client_id: String,
    #[serde(default = "default_topic_prefix")]
    topic_prefix: String,
}

fn default_client_id() -> String {
    "bluebolt-bridge".to_string()
}
fn default_topic_prefix() -> String {
    "bluebolt".to_string()
}

fn load_config(path: &str) -> Result<Config> {
    let text = std::fs::read_to_string(path).context("Failed to read config file")?;
    let config: Config = toml::from_str(&text).context("Failed to parse config file")?;

    let mut seen = std::collections::HashSet::new();
    for device in &config.devices {
        anyhow::ensure!(
            seen.insert(device.name.as_str()),
            "Duplicate device name: {}",
            device.name
        );
        anyhow::ensure!(
            device.scan_interval_secs > 0,
            "scan_interval_secs must be positive for device {}",
            device.name
        );
        // Reject bad hosts and MACs up front rather than inside the device task
        build_device_config(device)
            .with_context(|| format!("Invalid config for device {}", device.name))?;
        if let Some(model) = &device.model {
            anyhow::ensure!(
                DeviceModel::from_name(model).is_some(),
                "Unknown model {model} for device {}",
                device.name
            );
        }
    }
    Ok(config)
}

fn build_device_config(toml: &DeviceToml) -> Result<DeviceConfig> {
    Ok(DeviceConfig::builder()
        .host(&toml.host)
        .port(toml.port)
        .mac(&toml.mac)
        .timeout(Duration::from_millis(toml.timeout_ms))
        .retries(toml.retries)
        .scan_interval(Duration::from_secs(toml.scan_interval_secs))
        .build()?)
}

// ---------------------------------------------------------------------------
// MQTT JSON types
// ---------------------------------------------------------------------------

// Published messages share the {now, op, ...} flat structure

#[derive(Serialize)]
struct MqttState {
    now: u64,
    op: String,
    device: MqttDeviceInfo,
    sensors: BTreeMap<&'static str, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    power_condition: Option<i64>,
    outlets: Vec<MqttOutletState>,
}

#[derive(Serialize)]
struct MqttDeviceInfo {
    model: String,
    manufacturer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    firmware: Option<String>,
}

#[derive(Serialize)]
struct MqttOutletState {
    id: u8,
    name: String,
    on: bool,
}

// CMD_ACK response
#[derive(Serialize)]
struct MqttCmdAck {
    now: u64,
    op: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    src: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct MqttUnavailable {
    now: u64,
    op: String,
    reason: String,
}

// Inbound command (subscribed)
#[derive(Deserialize)]
struct MqttCommand {
    op: String,
    #[serde(default)]
    outlet: Option<u8>,
    #[serde(default)]
    on: Option<bool>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn now_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

struct DeviceTopics {
    state: String,
    availability: String,
    cmd: String,
    event: String,
}

impl DeviceTopics {
    fn new(prefix: &str, name: &str) -> Self {
        let base = format!("{}/{}", prefix.trim_end_matches('/'), name);
        Self {
            state: format!("{base}/state"),
            availability: format!("{base}/availability"),
            cmd: format!("{base}/cmd"),
            event: format!("{base}/event"),
        }
    }
}

/// A connected device as seen by the command handler.
struct DeviceContext {
    name: String,
    topics: DeviceTopics,
    outlet_names: HashMap<u8, String>,
    monitor: Arc<DeviceMonitor>,
}

/// Connected devices keyed by command topic.
type Registry = Arc<RwLock<HashMap<String, Arc<DeviceContext>>>>;

fn outlet_label(id: u8, model: DeviceModel, overrides: &HashMap<u8, String>) -> String {
    if let Some(name) = overrides.get(&id) {
        return name.clone();
    }
    model.switch_label(id)
}

async fn publish_json(client: &AsyncClient, topic: &str, payload: &impl Serialize, retain: bool) {
    match serde_json::to_string(payload) {
        Ok(json) => {
            if let Err(e) = client.publish(topic, QoS::AtLeastOnce, retain, json).await {
                error!("Failed to publish to {topic}: {e}");
            }
        }
        Err(e) => error!("Failed to serialize MQTT payload: {e}"),
    }
}

async fn publish_availability(client: &AsyncClient, topic: &str, online: bool) {
    let payload = if online { "online" } else { "offline" };
    if let Err(e) = client.publish(topic, QoS::AtLeastOnce, true, payload).await {
        error!("Failed to publish to {topic}: {e}");
    }
}

async fn publish_cmd_ack(
    client: &AsyncClient,
    topic: &str,
    success: bool,
    src: Option<serde_json::Value>,
) {
    let msg = MqttCmdAck {
        now: now_epoch_ms(),
        op: "CMD_ACK".to_string(),
        success,
        src,
    };
    publish_json(client, topic, &msg, false).await;
}

async fn publish_unavailable(client: &AsyncClient, topic: &str, reason: String) {
    let msg = MqttUnavailable {
        now: now_epoch_ms(),
        op: "UNAVAILABLE".to_string(),
        reason,
    };
    publish_json(client, topic, &msg, false).await;
}

fn build_state(ctx: &DeviceContext, reading: &StatusReading) -> MqttState {
    let info = ctx.monitor.device().info();
    MqttState {
        now: now_epoch_ms(),
        op: "STATE".to_string(),
        device: MqttDeviceInfo {
            model: info.model.name().to_string(),
            manufacturer: info.manufacturer().to_string(),
            firmware: info.firmware.clone(),
        },
        sensors: reading
            .sensors()
            .map(|(field, value)| (field.key(), value))
            .collect(),
        power_condition: reading.power_condition,
        outlets: reading
            .outlets()
            .map(|(id, on)| MqttOutletState {
                id,
                name: outlet_label(id, reading.model, &ctx.outlet_names),
                on,
            })
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// Device event → MQTT
// ---------------------------------------------------------------------------

async fn handle_device_event(event: DeviceEvent, client: &AsyncClient, ctx: &DeviceContext) {
    match event {
        DeviceEvent::StatusUpdated(reading) => {
            let state = build_state(ctx, &reading);
            publish_json(client, &ctx.topics.state, &state, true).await;
        }

        DeviceEvent::Available => {
            info!("{}: online", ctx.name);
            publish_availability(client, &ctx.topics.availability, true).await;
        }

        DeviceEvent::Unavailable { reason } => {
            warn!("{}: offline ({reason})", ctx.name);
            publish_availability(client, &ctx.topics.availability, false).await;
            publish_unavailable(client, &ctx.topics.event, reason).await;
        }

        DeviceEvent::OutletChanged { index, on } => {
            let model = ctx.monitor.device().model();
            info!(
                "{}: {} turned {}",
                ctx.name,
                outlet_label(index, model, &ctx.outlet_names),
                if on { "on" } else { "off" }
            );
        }

        DeviceEvent::OutletCommandSent { index, on } => {
            debug!("{}: outlet {index} -> {on} acknowledged", ctx.name);
        }

        DeviceEvent::Stopped { reason, .. } => {
            info!("{}: monitor stopped ({reason})", ctx.name);
            publish_availability(client, &ctx.topics.availability, false).await;
        }
    }
}

// ---------------------------------------------------------------------------
// MQTT command handler
// ---------------------------------------------------------------------------

async fn handle_command(payload_str: &str, cmd: MqttCommand, client: &AsyncClient, ctx: &DeviceContext) {
    // Parse the raw payload as a JSON value for the CMD_ACK src field
    let src_json = serde_json::from_str::<serde_json::Value>(payload_str).ok();
    let topic = &ctx.topics.event;

    match cmd.op.as_str() {
        "PING" => {
            info!("{}: Command: PING", ctx.name);
            publish_cmd_ack(client, topic, true, src_json).await;
        }

        "REFRESH" => {
            debug!("{}: Command: REFRESH", ctx.name);
            let success = match ctx.monitor.refresh().await {
                Ok(reading) => reading.is_some(),
                Err(e) => {
                    error!("{}: REFRESH failed: {e}", ctx.name);
                    false
                }
            };
            publish_cmd_ack(client, topic, success, src_json).await;
        }

        "SET_OUTLET" => {
            let (Some(outlet), Some(on)) = (cmd.outlet, cmd.on) else {
                warn!("{}: SET_OUTLET: missing outlet or on", ctx.name);
                publish_cmd_ack(client, topic, false, src_json).await;
                return;
            };
            info!("{}: Command: SET_OUTLET {outlet} {on}", ctx.name);
            let success = match ctx.monitor.set_outlet(OutletCommand::new(outlet, on)).await {
                Ok(()) => true,
                Err(e) => {
                    error!("{}: SET_OUTLET {outlet} failed: {e}", ctx.name);
                    false
                }
            };
            publish_cmd_ack(client, topic, success, src_json).await;
        }

        other => {
            warn!("{}: Unknown command: {other}", ctx.name);
            publish_cmd_ack(client, topic, false, src_json).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Device task
// ---------------------------------------------------------------------------

/// Connect to one device and poll it until shutdown or a fatal error.
///
/// Transient connect failures are retried every `reconnect_delay_secs`.
async fn run_device(
    device_toml: DeviceToml,
    prefix: String,
    client: AsyncClient,
    registry: Registry,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = device_toml.name.clone();
    let topics = DeviceTopics::new(&prefix, &name);
    let config = match build_device_config(&device_toml) {
        Ok(config) => config,
        Err(e) => {
            error!("{name}: {e:#}");
            return;
        }
    };
    let reconnect_delay = Duration::from_secs(device_toml.reconnect_delay_secs);

    let device = loop {
        tokio::select! {
            result = BlueBoltDevice::connect(config.clone()) => match result {
                Ok(device) => break device,
                Err(e) if e.is_fatal() => {
                    error!("{name}: giving up: {e}");
                    publish_availability(&client, &topics.availability, false).await;
                    return;
                }
                Err(e) => {
                    warn!("{name}: connect failed: {e}. Retrying in {}s", reconnect_delay.as_secs());
                    publish_availability(&client, &topics.availability, false).await;
                }
            },
            _ = shutdown.changed() => return,
        }
        tokio::select! {
            _ = sleep(reconnect_delay) => {}
            _ = shutdown.changed() => return,
        }
    };

    if let Some(expected) = device_toml.model.as_deref().and_then(DeviceModel::from_name)
        && expected != device.model()
    {
        warn!("{name}: configured as {expected} but the card reports {}", device.model());
    }
    info!("{name}: connected to {}", device.model());

    let monitor = Arc::new(DeviceMonitor::new(device));
    let ctx = Arc::new(DeviceContext {
        name: name.clone(),
        topics,
        outlet_names: device_toml.outlet_names,
        monitor: Arc::clone(&monitor),
    });

    let mut rx = monitor.subscribe();
    let ctx_events = Arc::clone(&ctx);
    let client_events = client.clone();
    let event_handle = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let stopped = matches!(event, DeviceEvent::Stopped { .. });
                    handle_device_event(event, &client_events, &ctx_events).await;
                    if stopped {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("{}: event receiver lagged, missed {n} events", ctx_events.name);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    registry
        .write()
        .await
        .insert(ctx.topics.cmd.clone(), Arc::clone(&ctx));

    if let Err(e) = monitor.run(shutdown).await {
        error!("{name}: stopped after fatal error: {e}");
    }

    registry.write().await.remove(&ctx.topics.cmd);
    let _ = event_handle.await;
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or RUST_LOG=bluebolt_cv2=trace).
    // Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;
    let (mut mqtt_host, mut mqtt_port) = parse_mqtt_url(&config.mqtt.url)?;

    if config.devices.is_empty() {
        warn!("No [[devices]] configured");
    }

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        let prefix = config.mqtt.topic_prefix.clone();
        let cmd_topics: Vec<String> = config
            .devices
            .iter()
            .map(|d| DeviceTopics::new(&prefix, &d.name).cmd)
            .collect();

        // Set up MQTT
        let mut mqtt_opts = MqttOptions::new(&config.mqtt.client_id, &mqtt_host, mqtt_port);
        mqtt_opts.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(mqtt_opts, 256);

        let registry: Registry = Arc::new(RwLock::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // One task per device
        let device_handles: Vec<JoinHandle<()>> = config
            .devices
            .iter()
            .map(|d| {
                tokio::spawn(run_device(
                    d.clone(),
                    prefix.clone(),
                    client.clone(),
                    Arc::clone(&registry),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        // MQTT event loop (receives messages, dispatches commands)
        let client_cmds = client.clone();
        let registry_cmds = Arc::clone(&registry);
        let mqtt_handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // rumqttc does not resubscribe after a broker reconnect
                        for topic in &cmd_topics {
                            info!("MQTT: connected, subscribing to {topic}");
                            if let Err(e) = client_cmds.subscribe(topic, QoS::AtLeastOnce).await {
                                error!("Failed to subscribe to {topic}: {e}");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(msg))) => {
                        let Some(ctx) = registry_cmds.read().await.get(&msg.topic).cloned() else {
                            if cmd_topics.contains(&msg.topic) {
                                warn!("Command on {} before the device connected", msg.topic);
                            }
                            continue;
                        };
                        let payload = String::from_utf8_lossy(&msg.payload).into_owned();
                        match serde_json::from_str::<MqttCommand>(&payload) {
                            Ok(cmd) => {
                                info!("{}: MQTT command received: {payload}", ctx.name);
                                // Outlet commands can take several timeouts; keep polling MQTT
                                let client = client_cmds.clone();
                                tokio::spawn(async move {
                                    handle_command(&payload, cmd, &client, &ctx).await;
                                });
                            }
                            Err(e) => {
                                warn!("{}: Failed to parse MQTT command: {e}", ctx.name);
                            }
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT event loop error: {e}");
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        // Wait for a signal
        info!(
            "MQTT bridge running for {} device(s). Send SIGHUP to restart, SIGINT/SIGTERM to stop.",
            config.devices.len()
        );
        let restart = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                false
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                false
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading config and restarting connections...");
                true
            }
        };

        // Stop device tasks; each publishes "offline" on the way out
        let _ = shutdown_tx.send(true);
        for handle in device_handles {
            if timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("Device task did not stop in time");
            }
        }

        // Flush queued publishes, then close the MQTT session
        if let Err(e) = client.disconnect().await {
            warn!("Error disconnecting from MQTT: {e}");
        }
        if timeout(Duration::from_secs(5), mqtt_handle).await.is_err() {
            warn!("MQTT event loop did not stop in time");
        }

        if !restart {
            break;
        }

        // Reload config from disk; keep previous config on failure
        info!("Reloading config from {}", cli.config);
        match load_config(&cli.config) {
            Ok(new_config) => match parse_mqtt_url(&new_config.mqtt.url) {
                Ok((new_host, new_port)) => {
                    config = new_config;
                    mqtt_host = new_host;
                    mqtt_port = new_port;
                    info!("Config reloaded successfully");
                }
                Err(e) => warn!("Invalid MQTT URL in new config, keeping previous: {e}"),
            },
            Err(e) => warn!("Failed to reload config, keeping previous: {e:#}"),
        }

        info!("Reconnecting...");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mqtt_url() {
        assert_eq!(
            parse_mqtt_url("mqtt://broker.local:1883").unwrap(),
            ("broker.local".to_string(), 1883)
        );
        assert_eq!(
            parse_mqtt_url("tcp://10.0.0.2:8883").unwrap(),
            ("10.0.0.2".to_string(), 8883)
        );
        assert!(parse_mqtt_url("mqtt://broker.local").is_err());
        assert!(parse_mqtt_url("mqtt://broker.local:http").is_err());
    }

    #[test]
    fn test_device_defaults_and_outlet_names() {
        let config: Config = toml::from_str(
            r#"
            [mqtt]
            url = "mqtt://localhost:1883"

            [[devices]]
            name = "rack"
            host = "192.168.0.162"
            mac = "10:65:a3:1b:2c:3d"

            [devices.outlet_names]
            1 = "Amplifier"
            8 = "Projector"
            "#,
        )
        .unwrap();

        assert_eq!(config.mqtt.client_id, "bluebolt-bridge");
        assert_eq!(config.mqtt.topic_prefix, "bluebolt");
        let device = &config.devices[0];
        assert_eq!(device.port, 57010);
        assert_eq!(device.scan_interval_secs, 30);
        assert_eq!(device.timeout_ms, 5000);
        assert_eq!(device.retries, 2);
        assert_eq!(device.outlet_names.get(&8).map(String::as_str), Some("Projector"));

        let built = build_device_config(device).unwrap();
        assert_eq!(built.attempts(), 3);
        assert_eq!(built.token.redacted(), "1065a3XXXXXX");
    }

    #[test]
    fn test_invalid_outlet_name_key() {
        let result = toml::from_str::<Config>(
            r#"
            [mqtt]
            url = "mqtt://localhost:1883"

            [[devices]]
            name = "rack"
            host = "192.168.0.162"
            mac = "1065a31b2c3d"

            [devices.outlet_names]
            first = "Amplifier"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_topics() {
        let topics = DeviceTopics::new("bluebolt/", "rack");
        assert_eq!(topics.state, "bluebolt/rack/state");
        assert_eq!(topics.availability, "bluebolt/rack/availability");
        assert_eq!(topics.cmd, "bluebolt/rack/cmd");
        assert_eq!(topics.event, "bluebolt/rack/event");
    }

    #[test]
    fn test_outlet_label() {
        let mut names = HashMap::new();
        names.insert(2, "Subwoofer".to_string());
        assert_eq!(outlet_label(2, DeviceModel::M4315Pro, &names), "Subwoofer");
        assert_eq!(outlet_label(3, DeviceModel::M4315Pro, &names), "Outlet 3");
        assert_eq!(outlet_label(3, DeviceModel::F1500Ups, &names), "Outlet Bank 3");
    }
}

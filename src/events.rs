//! Alert feed: subscribe to camera events over MQTT, classify them as
//! motion/tamper, raise the [`AlertSignal`] and send a rate-limited
//! snapshot photo to the operator.
//!
//! Payloads are JSON. Two shapes are understood:
//! - `{"items": [{"name": "...", "value": "..."}]}`: ONVIF `SimpleItem` pairs
//!   forwarded by an event relay;
//! - `{"type": "new", "after": {...}}`: a Frigate tracked-object event.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::alert::AlertSignal;
use crate::config::AlertSettings;
use crate::delivery::{Delivery, SnapshotSource};
use crate::notify::{RateLimiter, ReportKind};

const CLIENT_ID: &str = "camcourier";
const RECONNECT_DELAY: Duration = Duration::from_secs(10);
const KEEP_ALIVE: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventRules {
    pub motion_enabled: bool,
    pub tamper_enabled: bool,
}

impl EventRules {
    pub fn from_settings(settings: &AlertSettings) -> Self {
        Self {
            motion_enabled: settings.motion_enabled,
            tamper_enabled: settings.tamper_enabled,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AlertKinds {
    pub motion: bool,
    pub tamper: bool,
}

impl AlertKinds {
    pub fn any(&self) -> bool {
        self.motion || self.tamper
    }

    pub fn caption(&self) -> String {
        let mut kinds = Vec::new();
        if self.motion {
            kinds.push("Motion");
        }
        if self.tamper {
            kinds.push("Tamper");
        }
        format!("ONVIF Alert: {}", kinds.join(", "))
    }
}

#[derive(Debug, Deserialize, Default)]
struct EventPayload {
    #[serde(default)]
    items: Vec<SimpleItem>,
    #[serde(rename = "type")]
    event_type: Option<String>,
    after: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct SimpleItem {
    #[serde(alias = "Name")]
    name: String,
    #[serde(alias = "Value", default)]
    value: String,
}

/// Only the literal string `true` counts.
fn is_true(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

/// Classify ONVIF `SimpleItem` name/value pairs.
pub fn classify_items<'a, I>(items: I, rules: EventRules) -> AlertKinds
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let items: Vec<(String, &str)> = items
        .into_iter()
        .map(|(n, v)| (n.trim().to_ascii_lowercase(), v.trim()))
        .filter(|(n, _)| !n.is_empty())
        .collect();
    let mut kinds = AlertKinds::default();
    for (name, value) in &items {
        if rules.motion_enabled && name.contains("motion") && is_true(value) {
            kinds.motion = true;
        }
        if rules.tamper_enabled && name.contains("tamper") && is_true(value) {
            kinds.tamper = true;
        }
    }
    if rules.motion_enabled && !kinds.motion {
        let has_input = items.iter().any(|(name, value)| {
            name == "inputtoken"
                || name == "input_token"
                || value.to_ascii_lowercase().contains("digit_input")
        });
        let logical_true = items
            .iter()
            .any(|(name, value)| name == "logicalstate" && is_true(value));
        kinds.motion = has_input && logical_true;
    }
    kinds
}

pub fn classify_payload(payload: &[u8], rules: EventRules) -> Result<AlertKinds> {
    let event: EventPayload =
        serde_json::from_slice(payload).context("decode event payload")?;
    let mut kinds = classify_items(
        event
            .items
            .iter()
            .map(|item| (item.name.as_str(), item.value.as_str())),
        rules,
    );
    let is_new_object = event.event_type.as_deref() == Some("new") && event.after.is_some();
    if rules.motion_enabled && is_new_object {
        kinds.motion = true;
    }
    Ok(kinds)
}

/// Reacts to classified events. Independent of the transport so it can be
/// driven directly in tests.
pub struct AlertHandler<D, S> {
    signal: Arc<AlertSignal>,
    rules: EventRules,
    delivery: D,
    snapshot: S,
    limiter: RateLimiter,
}

impl<D: Delivery, S: SnapshotSource> AlertHandler<D, S> {
    pub fn new(
        signal: Arc<AlertSignal>,
        rules: EventRules,
        delivery: D,
        snapshot: S,
        photo_cooldown: Duration,
    ) -> Self {
        Self {
            signal,
            rules,
            delivery,
            snapshot,
            limiter: RateLimiter::new(photo_cooldown),
        }
    }

    pub fn handle_payload(&self, payload: &[u8]) -> Result<AlertKinds> {
        let kinds = classify_payload(payload, self.rules)?;
        if kinds.any() {
            self.on_alert(kinds);
        }
        Ok(kinds)
    }

    fn on_alert(&self, kinds: AlertKinds) {
        if self.signal.raise() {
            log::info!("{} -> recording triggered", kinds.caption());
        } else {
            log::debug!("{} while an alert is already pending", kinds.caption());
        }
        if !self.limiter.allow(ReportKind::Photo) {
            return;
        }
        let caption = kinds.caption();
        let sent = self
            .snapshot
            .snapshot()
            .and_then(|image| self.delivery.send_image(&image, "alert.jpg", &caption));
        match sent {
            Ok(()) => log::info!("sent alert photo: {}", caption),
            Err(e) => log::warn!("alert photo failed: {:#}", e),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// `host:port`, optionally prefixed with `mqtt://` or `mqtts://`.
pub fn parse_broker_addr(addr: &str) -> Result<BrokerEndpoint> {
    let mut use_tls = false;
    let mut rest = addr.trim();
    if let Some((scheme, tail)) = rest.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        rest = tail;
    }
    let (host, port) = match rest.strip_prefix('[') {
        Some(v6) => {
            let (host, tail) = v6
                .split_once(']')
                .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
            (host, port)
        }
        None => rest
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?,
    };
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok(BrokerEndpoint {
        host: host.to_string(),
        port,
        use_tls,
    })
}

fn connect(endpoint: &BrokerEndpoint, settings: &AlertSettings) -> (Client, Connection) {
    let mut options = MqttOptions::new(CLIENT_ID, &endpoint.host, endpoint.port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_start(true);
    if let Some(user) = settings.mqtt_username.as_deref() {
        options.set_credentials(user, settings.mqtt_password.clone().unwrap_or_default());
    }
    if endpoint.use_tls {
        options.set_transport(rumqttc::Transport::tls_with_default_config());
    }
    Client::new(options, 10)
}

/// Subscribe and handle events forever, reconnecting after errors.
pub fn run_mqtt<D: Delivery, S: SnapshotSource>(
    settings: &AlertSettings,
    handler: &AlertHandler<D, S>,
) -> Result<()> {
    let endpoint = parse_broker_addr(&settings.mqtt_broker_addr)?;
    log::info!(
        "alert feed: {}:{} topic {} (TLS: {}, auth: {})",
        endpoint.host,
        endpoint.port,
        settings.mqtt_topic,
        endpoint.use_tls,
        settings.mqtt_username.is_some()
    );
    loop {
        let (client, mut connection) = connect(&endpoint, settings);
        if let Err(e) = client.subscribe(settings.mqtt_topic.as_str(), QoS::AtMostOnce) {
            log::error!("MQTT subscribe failed: {}. Reconnecting...", e);
            std::thread::sleep(RECONNECT_DELAY);
            continue;
        }
        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    if let Err(e) = handler.handle_payload(&publish.payload) {
                        log::warn!("skipping event: {:#}", e);
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    log::info!("subscribed to {}", settings.mqtt_topic);
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("MQTT connection error: {}. Reconnecting...", e);
                    break;
                }
            }
        }
        std::thread::sleep(RECONNECT_DELAY);
    }
}

use crate::config::MqttConfig;
use crate::error::AppError;
use crate::models::{BillingMessage, BillingSnapshot};
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

// MQTT v5 API surface only
use rumqttc::v5 as mqtt5;
use rumqttc::Transport;

pub type MqttOptions = mqtt5::MqttOptions;
pub type AsyncClient = mqtt5::AsyncClient;
pub type EventLoop = mqtt5::EventLoop;
pub type V5Publish = mqtt5::mqttbytes::v5::Publish;
pub type QoS = mqtt5::mqttbytes::QoS;

/// Filter matching every power reading of one home.
pub fn reading_filter(home_id: &str) -> String {
    format!("home/{home_id}/device/+/power")
}

pub fn billing_topic(home_id: &str) -> String {
    format!("home/{home_id}/billing/today_cost")
}

pub const READING_FILTER: &str = "home/+/device/+/power";

/// Split `home/{home_id}/device/{category}/power` into its two variables.
pub fn parse_reading_topic(topic: &str) -> Option<(&str, &str)> {
    if !topic_matches(READING_FILTER, topic) {
        return None;
    }
    let mut parts = topic.split('/');
    let home = parts.nth(1)?;
    let category = parts.nth(1)?;
    if home.is_empty() || category.is_empty() {
        return None;
    }
    Some((home, category))
}

/// MQTT wildcard match of `topic` against `filter` (`+` one level, `#` the rest).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let fseg: Vec<&str> = filter.split('/').collect();
    let tseg: Vec<&str> = topic.split('/').collect();
    for (i, f) in fseg.iter().enumerate() {
        match *f {
            "#" => return true,
            "+" => {
                if i >= tseg.len() {
                    return false;
                }
            }
            _ => {
                if i >= tseg.len() || *f != tseg[i] {
                    return false;
                }
            }
        }
    }
    fseg.len() == tseg.len()
}

pub fn build_options(cfg: &MqttConfig) -> MqttOptions {
    let client_id = format!("billing-engine-{}", Uuid::new_v4());
    let mut opts = MqttOptions::new(client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.unwrap_or(30)));
    opts.set_clean_start(cfg.clean_session.unwrap_or(true));
    if let (Some(u), Some(p)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(u.clone(), p.clone());
    }
    if cfg.port == 8883 {
        opts.set_transport(Transport::tls_with_default_config());
    }
    opts
}

pub fn new(options: MqttOptions) -> (AsyncClient, EventLoop) {
    mqtt5::AsyncClient::new(options, 50)
}

pub fn qos(v: u8) -> QoS {
    match v {
        2 => QoS::ExactlyOnce,
        0 => QoS::AtMostOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Queue one subscription per home without waiting on the event loop.
/// Called on every ConnAck, since a clean-start reconnect drops them.
pub fn subscribe_homes(client: &AsyncClient, homes: &[String], qos: QoS) -> Result<(), AppError> {
    for home in homes {
        client
            .try_subscribe(reading_filter(home), qos)
            .map_err(|e| AppError::Mqtt(e.to_string()))?;
    }
    Ok(())
}

/// Events the ingest loop acts on.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    /// The broker accepted a (re)connection
    Connected,
    Publish(V5Publish),
}

pub fn inbound(event: mqtt5::Event) -> Option<Inbound> {
    match event {
        mqtt5::Event::Incoming(mqtt5::Incoming::ConnAck(_)) => Some(Inbound::Connected),
        mqtt5::Event::Incoming(mqtt5::Incoming::Publish(p)) => Some(Inbound::Publish(p)),
        _ => None,
    }
}

pub async fn next_inbound(eventloop: &mut EventLoop) -> Result<Inbound, AppError> {
    loop {
        match eventloop.poll().await {
            Ok(event) => {
                if let Some(inbound) = inbound(event) {
                    return Ok(inbound);
                }
            }
            Err(e) => return Err(AppError::Mqtt(e.to_string())),
        }
    }
}

/// Outbound channel for computed snapshots. Delivery is best-effort.
#[async_trait]
pub trait SnapshotTransport: Send + Sync {
    async fn publish(&self, snapshot: &BillingSnapshot) -> Result<(), AppError>;
}

pub struct MqttTransport {
    client: AsyncClient,
    qos: QoS,
}

impl MqttTransport {
    pub fn new(client: AsyncClient, qos: QoS) -> Self {
        Self { client, qos }
    }
}

#[async_trait]
impl SnapshotTransport for MqttTransport {
    async fn publish(&self, snapshot: &BillingSnapshot) -> Result<(), AppError> {
        let payload = serde_json::to_vec(&BillingMessage::from(snapshot))?;
        // try_publish never waits on a congested event loop
        self.client
            .try_publish(billing_topic(&snapshot.home_id), self.qos, false, payload)
            .map_err(|e| AppError::Mqtt(e.to_string()))
    }
}

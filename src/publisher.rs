//! Discovery events and their delivery to the event bus.
//!
//! Every discovery is wrapped in a CloudEvents 1.0 JSON envelope and sent to a
//! single exchange with routing key `<verb>.<entity>` derived from the event
//! type (`discovery.service.discovered` -> `discovered.service`). Delivery is
//! at-most-once: a failed publish is reported to the caller and never retried.
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::BusSettings;
use crate::error::PublishError;
use crate::types::{now_rfc3339, ProbeOutcome, Protocol};

pub const CLOUDEVENTS_SPEC_VERSION: &str = "1.0";
pub const MESSAGE_CONTENT_TYPE: &str = "application/cloudevents+json";
const DATA_CONTENT_TYPE: &str = "application/json";
const EVENT_DOMAIN: &str = "discovery";
const VERB_DISCOVERED: &str = "discovered";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerDiscovered {
    pub server_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub ip_addresses: Vec<Ipv4Addr>,
    pub open_ports: Vec<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServiceDiscovered {
    pub service_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub protocol: Protocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
}

/// The closed set of things this collector can report.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum DiscoveryData {
    Server(ServerDiscovered),
    Service(ServiceDiscovered),
}

impl DiscoveryData {
    pub fn service(outcome: &ProbeOutcome) -> Self {
        DiscoveryData::Service(ServiceDiscovered {
            service_id: service_id(outcome.ip, outcome.port, outcome.protocol),
            server_id: Some(server_id(outcome.ip)),
            ip: outcome.ip,
            port: outcome.port,
            protocol: outcome.protocol,
            service: outcome.service.clone(),
            version: outcome.version.clone(),
            banner: outcome.banner.clone(),
        })
    }

    pub fn server(ip: Ipv4Addr, open_ports: Vec<u16>) -> Self {
        DiscoveryData::Server(ServerDiscovered {
            server_id: server_id(ip),
            hostname: None,
            ip_addresses: vec![ip],
            open_ports,
            os: None,
        })
    }

    pub fn entity(&self) -> &'static str {
        match self {
            DiscoveryData::Server(_) => "server",
            DiscoveryData::Service(_) => "service",
        }
    }

    pub fn event_type(&self) -> String {
        format!("{EVENT_DOMAIN}.{}.{VERB_DISCOVERED}", self.entity())
    }
}

/// Stable across scans so consumers can deduplicate.
pub fn server_id(ip: Ipv4Addr) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("ip://{ip}").as_bytes()).to_string()
}

pub fn service_id(ip: Ipv4Addr, port: u16, protocol: Protocol) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("{protocol}://{ip}:{port}").as_bytes()).to_string()
}

/// CloudEvents envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DiscoveryEvent {
    #[serde(rename = "specversion")]
    pub spec_version: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub id: String,
    pub time: String,
    #[serde(rename = "datacontenttype")]
    pub content_type: String,
    pub data: DiscoveryData,
}

impl DiscoveryEvent {
    pub fn routing_key(&self) -> Option<String> {
        routing_key(&self.event_type)
    }
}

/// `<domain>.<entity>.<verb>` -> `<verb>.<entity>`.
pub fn routing_key(event_type: &str) -> Option<String> {
    let mut parts = event_type.split('.');
    let (_domain, entity, verb) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || entity.is_empty() || verb.is_empty() {
        return None;
    }
    Some(format!("{verb}.{entity}"))
}

/// One message as handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message_id: String,
    pub content_type: &'static str,
    pub body: String,
}

/// Publish seam. Implementations must be safe to call from many workers at once.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, message: &BusMessage) -> Result<(), PublishError>;
}

/// Wraps discoveries into events and hands them to the bus.
pub struct Publisher {
    bus: Arc<dyn EventBus>,
    exchange: String,
    source: String,
}

impl Publisher {
    pub fn new(bus: Arc<dyn EventBus>, exchange: impl Into<String>, source: impl Into<String>) -> Self {
        Self { bus, exchange: exchange.into(), source: source.into() }
    }

    /// Fresh envelope with a new unique id.
    pub fn envelope(&self, data: DiscoveryData) -> DiscoveryEvent {
        DiscoveryEvent {
            spec_version: CLOUDEVENTS_SPEC_VERSION.to_string(),
            event_type: data.event_type(),
            source: self.source.clone(),
            id: Uuid::new_v4().to_string(),
            time: now_rfc3339(),
            content_type: DATA_CONTENT_TYPE.to_string(),
            data,
        }
    }

    /// Emit exactly one event for `data`. Returns the event only once the bus accepted it.
    pub async fn publish(&self, data: DiscoveryData) -> Result<DiscoveryEvent, PublishError> {
        let event = self.envelope(data);
        let routing_key = event
            .routing_key()
            .ok_or_else(|| PublishError::RoutingKey(event.event_type.clone()))?;
        let message = BusMessage {
            exchange: self.exchange.clone(),
            routing_key,
            message_id: event.id.clone(),
            content_type: MESSAGE_CONTENT_TYPE,
            body: serde_json::to_string(&event)?,
        };
        self.bus.publish(&message).await?;
        debug!(id = %event.id, routing_key = %message.routing_key, "event published");
        Ok(event)
    }
}

/// Publishes through the RabbitMQ management HTTP API
/// (`POST /api/exchanges/{vhost}/{exchange}/publish`).
pub struct HttpEventBus {
    client: reqwest::Client,
    base_url: reqwest::Url,
    vhost: String,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Serialize)]
struct PublishBody<'a> {
    properties: PublishProperties<'a>,
    routing_key: &'a str,
    payload: &'a str,
    payload_encoding: &'static str,
}

#[derive(Serialize)]
struct PublishProperties<'a> {
    message_id: &'a str,
    content_type: &'a str,
    delivery_mode: u8,
}

#[derive(Deserialize)]
struct PublishReply {
    routed: bool,
}

impl HttpEventBus {
    pub fn new(base_url: &str, settings: &BusSettings) -> Result<Self, PublishError> {
        let base_url = reqwest::Url::parse(base_url)
            .map_err(|e| PublishError::Transport(format!("invalid bus url {base_url}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            vhost: settings.vhost.clone(),
            username: settings.username.clone(),
            password: settings.password.clone(),
        })
    }

    fn publish_url(&self, exchange: &str) -> Result<reqwest::Url, PublishError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| PublishError::Transport(format!("bus url {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(["api", "exchanges", self.vhost.as_str(), exchange, "publish"]);
        Ok(url)
    }
}

#[async_trait]
impl EventBus for HttpEventBus {
    async fn publish(&self, message: &BusMessage) -> Result<(), PublishError> {
        let url = self.publish_url(&message.exchange)?;
        let body = PublishBody {
            properties: PublishProperties {
                message_id: &message.message_id,
                content_type: message.content_type,
                delivery_mode: 2,
            },
            routing_key: &message.routing_key,
            payload: &message.body,
            payload_encoding: "string",
        };

        let mut req = self.client.post(url).json(&body);
        if let Some(user) = &self.username {
            req = req.basic_auth(user, self.password.as_deref());
        }
        let resp = req
            .send()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PublishError::Rejected { status: status.as_u16(), body });
        }
        let reply: PublishReply = resp
            .json()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        if !reply.routed {
            return Err(PublishError::Unrouted {
                exchange: message.exchange.clone(),
                message_id: message.message_id.clone(),
            });
        }
        Ok(())
    }
}

/// Logs events instead of sending them; used when no broker is configured.
#[derive(Debug, Default)]
pub struct LogEventBus;

#[async_trait]
impl EventBus for LogEventBus {
    async fn publish(&self, message: &BusMessage) -> Result<(), PublishError> {
        info!(
            exchange = %message.exchange,
            routing_key = %message.routing_key,
            message_id = %message.message_id,
            body = %message.body,
            "discovery event"
        );
        Ok(())
    }
}

/// Records published messages in memory. Optionally accepts only the first
/// `n` publishes and rejects the rest, to stand in for a broker outage.
#[derive(Debug, Default)]
pub struct MemoryEventBus {
    messages: Mutex<Vec<BusMessage>>,
    accept_limit: Option<usize>,
    attempts: AtomicUsize,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every publish.
    pub fn failing() -> Self {
        Self::failing_after(0)
    }

    pub fn failing_after(accepted: usize) -> Self {
        Self { accept_limit: Some(accepted), ..Self::default() }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> Vec<BusMessage> {
        self.messages.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn events(&self) -> Vec<DiscoveryEvent> {
        self.messages()
            .iter()
            .filter_map(|m| serde_json::from_str(&m.body).ok())
            .collect()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, message: &BusMessage) -> Result<(), PublishError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.accept_limit.is_some_and(|limit| attempt >= limit) {
            return Err(PublishError::Transport("simulated broker outage".into()));
        }
        self.messages
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(message.clone());
        Ok(())
    }
}

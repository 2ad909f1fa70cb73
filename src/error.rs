use thiserror::Error;

/// A subnet or exclusion entry that could not be turned into an IPv4 range.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("malformed CIDR `{input}`: {reason}")]
    Malformed { input: String, reason: String },
    #[error("IPv6 range `{0}` cannot be enumerated")]
    Ipv6Unsupported(String),
}

/// Failure to hand a discovery event to the event bus.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("event type `{0}` has no routing key")]
    RoutingKey(String),
    #[error("event bus transport error: {0}")]
    Transport(String),
    #[error("event bus rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("message {message_id} was not routed by exchange `{exchange}`")]
    Unrouted { exchange: String, message_id: String },
}

/// Failure to deliver a progress or completion callback.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("callback transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("callback endpoint answered {status}")]
    Status { status: u16 },
}

/// Why a scan could not be started.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StartError {
    #[error("scan {active_scan_id} is already running")]
    Conflict { active_scan_id: String },
    #[error("invalid scan request: {0}")]
    Invalid(String),
}

/// Why a stop request was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StopError {
    #[error("no scan is running")]
    NotRunning,
    #[error("scan {requested} is not the active scan ({active})")]
    UnknownScan { requested: String, active: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load .env file: {0}")]
    EnvFile(#[from] dotenvy::Error),
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid settings: {0}")]
    Invalid(String),
}

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use ::time::{format_description::well_known, OffsetDateTime};

/// A scan request as it arrives at the control surface.
///
/// The `mode` tag decides the path at parse time: `legacy` scans with the
/// process-level defaults and reports nothing back, `autonomous` carries a
/// full [`ScanConfiguration`] including callback coordinates.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ScanRequest {
    Legacy,
    Autonomous(ScanConfiguration),
}

impl ScanRequest {
    pub fn scan_id(&self) -> Option<&str> {
        match self {
            ScanRequest::Legacy => None,
            ScanRequest::Autonomous(cfg) => Some(cfg.scan_id.as_str()),
        }
    }
}

/// Per-request job description for an autonomous scan.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ScanConfiguration {
    pub scan_id: String,
    pub subnets: Vec<String>,
    #[serde(default)]
    pub exclude_subnets: Vec<String>,
    #[serde(default)]
    pub port_ranges: Vec<String>,
    #[serde(default)]
    pub common_ports: Vec<u16>,
    #[serde(default)]
    pub rate_limit_pps: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_concurrent_hosts: Option<usize>,
    #[serde(default)]
    pub dead_host_threshold: Option<u32>,
    pub progress_url: String,
    pub complete_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// Classification of a single connection attempt.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Open,
    Closed,
    Filtered,
}

/// One open address:port, created by a worker and handed straight to the publisher.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub protocol: Protocol,
    pub open: bool,
    pub service: Option<String>,
    pub version: Option<String>,
    pub banner: Option<String>,
}

/// Scan phase reported in progress callbacks.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Initializing,
    Scanning,
    Finalizing,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanProgress {
    pub scan_id: String,
    pub collector: String,
    pub sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<ScanPhase>,
    pub progress: u8,
    pub discovery_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Completed,
    Failed,
    Timeout,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanCompletion {
    pub scan_id: String,
    pub collector: String,
    pub status: CompletionStatus,
    pub discovery_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: String,
}

/// Counters of one subnet pass, as seen when the pass ended.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SubnetReport {
    pub subnet: String,
    pub enumerated: u64,
    pub excluded: u64,
    pub admitted: u64,
    pub probed: u64,
    pub open_ports: u64,
    pub published: u64,
    pub publish_failures: u64,
    /// Cancellation ended the pass before every address was excluded or fully probed.
    #[serde(default)]
    pub interrupted: bool,
}

impl SubnetReport {
    /// Open ports were found but not a single one reached the bus.
    pub fn total_publish_failure(&self) -> bool {
        self.open_ports > 0 && self.published == 0 && self.publish_failures > 0
    }
}

/// Outcome of a whole scan run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanSummary {
    pub scan_id: String,
    pub status: CompletionStatus,
    pub stopped: bool,
    pub discovery_count: u64,
    pub error_message: Option<String>,
    pub subnets: Vec<SubnetReport>,
    pub invalid_subnets: Vec<String>,
    pub started_at: String,
    pub finished_at: String,
}

impl ScanSummary {
    pub fn open_ports(&self) -> u64 {
        self.subnets.iter().map(|s| s.open_ports).sum()
    }

    pub fn probed(&self) -> u64 {
        self.subnets.iter().map(|s| s.probed).sum()
    }
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

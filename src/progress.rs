use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::CallbackSettings;
use crate::error::CallbackError;
use crate::types::{now_rfc3339, CompletionStatus, ScanCompletion, ScanPhase, ScanProgress};

pub const API_KEY_HEADER: &str = "X-Internal-API-Key";

/// Where an autonomous scan reports back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackEndpoints {
    pub progress_url: String,
    pub complete_url: String,
    pub api_key: Option<String>,
}

/// Per-scan progress telemetry.
///
/// Sequence numbers start at 1 and are handed out by atomic increment, so the
/// numbers sent for a scan are gap-free and strictly increasing. The discovery
/// counter only moves on a confirmed publish. Progress posts are best-effort;
/// the completion notice is sent once, with a bounded number of attempts.
#[derive(Debug)]
pub struct ProgressReporter {
    scan_id: String,
    collector: String,
    transport: Option<Transport>,
    sequence: AtomicU64,
    discoveries: AtomicU64,
    completed: AtomicBool,
    // Pairs a sequence number with the discovery count read right after it, so
    // later sequence numbers never carry smaller counts. Held for no I/O.
    snapshot: Mutex<()>,
}

#[derive(Debug)]
struct Transport {
    client: Client,
    endpoints: CallbackEndpoints,
    completion_attempts: u32,
    retry_backoff: Duration,
}

impl ProgressReporter {
    pub fn new(
        scan_id: impl Into<String>,
        collector: impl Into<String>,
        endpoints: CallbackEndpoints,
        settings: &CallbackSettings,
    ) -> Result<Self, CallbackError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .build()?;
        let transport = Transport {
            client,
            endpoints,
            completion_attempts: settings.completion_attempts.max(1),
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
        };
        Ok(Self::with_transport(scan_id.into(), collector.into(), Some(transport)))
    }

    /// Counts discoveries but never calls out; used by legacy scans.
    pub fn disabled(scan_id: impl Into<String>, collector: impl Into<String>) -> Self {
        Self::with_transport(scan_id.into(), collector.into(), None)
    }

    fn with_transport(scan_id: String, collector: String, transport: Option<Transport>) -> Self {
        Self {
            scan_id,
            collector,
            transport,
            sequence: AtomicU64::new(0),
            discoveries: AtomicU64::new(0),
            completed: AtomicBool::new(false),
            snapshot: Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.transport.is_some()
    }

    /// Record one confirmed publish; returns the new count.
    pub fn record_discovery(&self) -> u64 {
        self.discoveries.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn discovery_count(&self) -> u64 {
        self.discoveries.load(Ordering::SeqCst)
    }

    /// Last sequence number handed out (0 before the first report).
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Build the next progress payload, consuming one sequence number.
    pub fn next_progress(&self, phase: Option<ScanPhase>, progress: u8, message: Option<String>) -> ScanProgress {
        let (sequence, discovery_count) = {
            let _guard = self.snapshot.lock().unwrap_or_else(|p| p.into_inner());
            let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            (seq, self.discoveries.load(Ordering::SeqCst))
        };
        ScanProgress {
            scan_id: self.scan_id.clone(),
            collector: self.collector.clone(),
            sequence,
            phase,
            progress: progress.min(100),
            discovery_count,
            message,
            timestamp: now_rfc3339(),
        }
    }

    /// Post a progress report. Failures are logged and swallowed.
    pub async fn report_progress(&self, phase: Option<ScanPhase>, progress: u8, message: Option<String>) {
        let Some(transport) = &self.transport else {
            return;
        };
        if self.is_completed() {
            debug!(scan_id = %self.scan_id, "progress after completion dropped");
            return;
        }
        let payload = self.next_progress(phase, progress, message);
        match transport.post(&transport.endpoints.progress_url, &payload).await {
            Ok(()) => debug!(scan_id = %self.scan_id, sequence = payload.sequence, progress = payload.progress, "progress reported"),
            Err(e) => warn!(scan_id = %self.scan_id, sequence = payload.sequence, error = %e, "progress callback failed"),
        }
    }

    /// Send the terminal report. Only the first call sends anything; returns
    /// whether the completion was delivered.
    pub async fn report_complete(&self, status: CompletionStatus, error_message: Option<String>) -> bool {
        if self.completed.swap(true, Ordering::SeqCst) {
            warn!(scan_id = %self.scan_id, "completion already reported");
            return false;
        }
        let Some(transport) = &self.transport else {
            return false;
        };
        let payload = ScanCompletion {
            scan_id: self.scan_id.clone(),
            collector: self.collector.clone(),
            status,
            discovery_count: self.discovery_count(),
            error_message,
            timestamp: now_rfc3339(),
        };

        for attempt in 1..=transport.completion_attempts {
            match transport.post(&transport.endpoints.complete_url, &payload).await {
                Ok(()) => {
                    info!(
                        scan_id = %self.scan_id,
                        status = ?payload.status,
                        discovery_count = payload.discovery_count,
                        "completion reported"
                    );
                    return true;
                }
                Err(e) => {
                    warn!(scan_id = %self.scan_id, attempt, error = %e, "completion callback failed");
                    if attempt < transport.completion_attempts {
                        tokio::time::sleep(transport.retry_backoff * attempt).await;
                    }
                }
            }
        }
        warn!(scan_id = %self.scan_id, "giving up on completion callback");
        false
    }
}

impl Transport {
    async fn post<T: Serialize>(&self, url: &str, body: &T) -> Result<(), CallbackError> {
        let mut req = self.client.post(url).json(body);
        if let Some(key) = &self.endpoints.api_key {
            req = req.header(API_KEY_HEADER, key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CallbackError::Status { status: status.as_u16() });
        }
        Ok(())
    }
}

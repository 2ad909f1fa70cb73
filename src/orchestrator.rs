//! The single-scan state holder behind the control surface.
//!
//! `Idle -> Running -> {Completed, Failed, Stopped} -> Idle`. The terminal
//! state is kept as `last_state` and the orchestrator drops back to `Idle`,
//! the only state a scan starts from; starting while running is a conflict and
//! leaves the running scan untouched. Every autonomous scan ends with exactly one
//! completion callback, whatever the cause of termination.
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde::Serialize;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{StartError, StopError};
use crate::governor::RateGovernor;
use crate::netdetect;
use crate::ports;
use crate::probe::Prober;
use crate::progress::{CallbackEndpoints, ProgressReporter};
use crate::publisher::Publisher;
use crate::scanner::{self, ScanContext, ScanCounters};
use crate::targets::{self, Exclusions};
use crate::types::{now_rfc3339, CompletionStatus, ScanPhase, ScanRequest, ScanSummary, SubnetReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    Running,
    Completed,
    Failed,
    Stopped,
}

/// Why a running scan was cancelled; decides the completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Operator asked for it; reported as `failed`.
    Requested,
    /// The caller's wall-clock budget ran out; reported as `timeout`.
    Deadline,
}

/// Fully resolved inputs of one scan, whichever request shape it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPlan {
    pub scan_id: String,
    pub subnets: Vec<String>,
    pub exclude_subnets: Vec<String>,
    pub ports: Vec<u16>,
    pub rate_limit_pps: u32,
    pub timeout: Duration,
    pub concurrency: usize,
    pub dead_host_threshold: u32,
    pub emit_server_events: bool,
    pub callbacks: Option<CallbackEndpoints>,
}

impl ScanPlan {
    pub fn resolve(request: ScanRequest, settings: &Settings) -> Result<Self, StartError> {
        let defaults = &settings.scan;
        match request {
            ScanRequest::Legacy => {
                let subnets = if defaults.subnets.is_empty() {
                    match netdetect::detect_local_cidrs() {
                        Ok(nets) => nets.into_iter().map(|n| n.to_string()).collect(),
                        Err(e) => {
                            warn!(error = %e, "failed to detect local networks");
                            Vec::new()
                        }
                    }
                } else {
                    defaults.subnets.clone()
                };
                let ports = defaults
                    .resolve_ports()
                    .map_err(|e| StartError::Invalid(format!("{e:#}")))?;
                Ok(Self {
                    scan_id: format!("legacy-{}", Uuid::new_v4()),
                    subnets,
                    exclude_subnets: defaults.exclude_subnets.clone(),
                    ports,
                    rate_limit_pps: defaults.rate_limit_pps,
                    timeout: Duration::from_millis(defaults.timeout_ms),
                    concurrency: defaults.max_concurrent_hosts,
                    dead_host_threshold: defaults.dead_host_threshold,
                    emit_server_events: defaults.emit_server_events,
                    callbacks: None,
                })
            }
            ScanRequest::Autonomous(cfg) => {
                if cfg.scan_id.trim().is_empty() {
                    return Err(StartError::Invalid("scan_id must not be empty".into()));
                }
                for (name, url) in [("progress_url", &cfg.progress_url), ("complete_url", &cfg.complete_url)] {
                    reqwest::Url::parse(url)
                        .map_err(|e| StartError::Invalid(format!("{name} `{url}` is not a valid URL: {e}")))?;
                }
                let ports = ports::resolve_ports(&cfg.port_ranges, &cfg.common_ports)
                    .map_err(|e| StartError::Invalid(format!("{e:#}")))?;
                Ok(Self {
                    scan_id: cfg.scan_id,
                    subnets: cfg.subnets,
                    exclude_subnets: cfg.exclude_subnets,
                    ports,
                    rate_limit_pps: cfg.rate_limit_pps.unwrap_or(defaults.rate_limit_pps),
                    timeout: Duration::from_millis(cfg.timeout_ms.unwrap_or(defaults.timeout_ms).max(1)),
                    concurrency: cfg
                        .max_concurrent_hosts
                        .filter(|c| *c > 0)
                        .unwrap_or(defaults.max_concurrent_hosts),
                    dead_host_threshold: cfg.dead_host_threshold.unwrap_or(defaults.dead_host_threshold),
                    emit_server_events: defaults.emit_server_events,
                    callbacks: Some(CallbackEndpoints {
                        progress_url: cfg.progress_url,
                        complete_url: cfg.complete_url,
                        api_key: cfg.api_key.or_else(|| settings.callbacks.api_key.clone()),
                    }),
                })
            }
        }
    }
}

/// Point-in-time view for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// `idle` or `running`.
    pub state: &'static str,
    pub scan_id: Option<String>,
    pub addresses_total: u64,
    pub addresses_done: u64,
    pub open_ports: u64,
    pub discovery_count: u64,
    pub last_state: ScanState,
    pub last_scan: Option<ScanSummary>,
}

/// Returned by a successful start. Dropping it detaches the scan.
#[derive(Debug)]
pub struct ScanHandle {
    scan_id: String,
    task: JoinHandle<ScanSummary>,
}

impl ScanHandle {
    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    /// Wait for the scan to finish, completion callback included.
    pub async fn wait(self) -> Result<ScanSummary, JoinError> {
        self.task.await
    }
}

struct ActiveScan {
    scan_id: String,
    cancel: CancellationToken,
    stop_reason: Arc<OnceLock<StopReason>>,
    counters: ScanCounters,
    reporter: Arc<ProgressReporter>,
    addresses_total: u64,
}

struct Inner {
    state: ScanState,
    last_state: ScanState,
    active: Option<ActiveScan>,
    last: Option<ScanSummary>,
}

pub struct ScanOrchestrator {
    settings: Arc<Settings>,
    prober: Arc<dyn Prober>,
    publisher: Arc<Publisher>,
    inner: Mutex<Inner>,
}

impl ScanOrchestrator {
    pub fn new(settings: Arc<Settings>, prober: Arc<dyn Prober>, publisher: Arc<Publisher>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            prober,
            publisher,
            inner: Mutex::new(Inner { state: ScanState::Idle, last_state: ScanState::Idle, active: None, last: None }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Begin a scan in the background and return immediately.
    pub fn start(self: &Arc<Self>, request: ScanRequest) -> Result<ScanHandle, StartError> {
        // Check and claim under one lock so two concurrent starts cannot both win.
        let mut inner = self.lock();
        if let Some(active) = &inner.active {
            warn!(requested = ?request.scan_id(), active = %active.scan_id, "scan already running, start rejected");
            return Err(StartError::Conflict { active_scan_id: active.scan_id.clone() });
        }
        debug_assert_eq!(inner.state, ScanState::Idle);

        let plan = ScanPlan::resolve(request, &self.settings)?;
        let collector = self.settings.collector.name.clone();
        let reporter = match &plan.callbacks {
            Some(endpoints) => ProgressReporter::new(&plan.scan_id, collector, endpoints.clone(), &self.settings.callbacks)
                .map_err(|e| StartError::Invalid(format!("callback client: {e}")))?,
            None => ProgressReporter::disabled(&plan.scan_id, collector),
        };
        let reporter = Arc::new(reporter);
        let (nets, _) = targets::parse_subnets(&plan.subnets);
        let addresses_total = nets.iter().map(targets::address_count).sum();

        let cancel = CancellationToken::new();
        let stop_reason = Arc::new(OnceLock::new());
        let counters = ScanCounters::new();
        inner.state = ScanState::Running;
        inner.active = Some(ActiveScan {
            scan_id: plan.scan_id.clone(),
            cancel: cancel.clone(),
            stop_reason: stop_reason.clone(),
            counters: counters.clone(),
            reporter: reporter.clone(),
            addresses_total,
        });
        drop(inner);

        let scan_id = plan.scan_id.clone();
        info!(
            scan_id = %scan_id,
            subnets = plan.subnets.len(),
            ports = plan.ports.len(),
            rate_limit_pps = plan.rate_limit_pps,
            autonomous = plan.callbacks.is_some(),
            "scan started"
        );

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let summary = this
                .run(plan, reporter, cancel, stop_reason, counters, addresses_total)
                .await;
            this.finish(&summary);
            summary
        });

        Ok(ScanHandle { scan_id, task })
    }

    /// Cancel the active scan. `scan_id`, when given, must name it.
    /// Returns the id of the scan being stopped.
    pub fn stop(&self, scan_id: Option<&str>, reason: StopReason) -> Result<String, StopError> {
        let inner = self.lock();
        let active = inner.active.as_ref().ok_or(StopError::NotRunning)?;
        if let Some(requested) = scan_id {
            if requested != active.scan_id {
                return Err(StopError::UnknownScan {
                    requested: requested.to_string(),
                    active: active.scan_id.clone(),
                });
            }
        }
        let _ = active.stop_reason.set(reason);
        active.cancel.cancel();
        info!(scan_id = %active.scan_id, ?reason, "scan stop requested");
        Ok(active.scan_id.clone())
    }

    pub fn status(&self) -> StatusReport {
        let inner = self.lock();
        match &inner.active {
            Some(active) => StatusReport {
                state: "running",
                scan_id: Some(active.scan_id.clone()),
                addresses_total: active.addresses_total,
                addresses_done: active.counters.addresses_done.load(std::sync::atomic::Ordering::Relaxed),
                open_ports: active.counters.open_ports.load(std::sync::atomic::Ordering::Relaxed),
                discovery_count: active.reporter.discovery_count(),
                last_state: inner.last_state,
                last_scan: inner.last.clone(),
            },
            None => StatusReport {
                state: "idle",
                scan_id: None,
                addresses_total: 0,
                addresses_done: 0,
                open_ports: 0,
                discovery_count: 0,
                last_state: inner.last_state,
                last_scan: inner.last.clone(),
            },
        }
    }

    pub fn state(&self) -> ScanState {
        self.lock().state
    }

    /// State the previous scan ended in; `Idle` before any scan finished.
    pub fn last_state(&self) -> ScanState {
        self.lock().last_state
    }

    fn finish(&self, summary: &ScanSummary) {
        let mut inner = self.lock();
        inner.last_state = if summary.stopped {
            ScanState::Stopped
        } else if summary.status == CompletionStatus::Completed {
            ScanState::Completed
        } else {
            ScanState::Failed
        };
        inner.state = ScanState::Idle;
        inner.active = None;
        inner.last = Some(summary.clone());
    }

    async fn run(
        &self,
        plan: ScanPlan,
        reporter: Arc<ProgressReporter>,
        cancel: CancellationToken,
        stop_reason: Arc<OnceLock<StopReason>>,
        counters: ScanCounters,
        addresses_total: u64,
    ) -> ScanSummary {
        let started_at = now_rfc3339();
        let (nets, errors) = targets::parse_subnets(&plan.subnets);
        let invalid_subnets: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        for e in &errors {
            warn!(scan_id = %plan.scan_id, error = %e, "skipping subnet");
        }

        reporter
            .report_progress(
                Some(ScanPhase::Initializing),
                0,
                Some(format!("{} subnets, {} ports per address", nets.len(), plan.ports.len())),
            )
            .await;

        if nets.is_empty() {
            let message = "no valid subnets in scan request".to_string();
            error!(scan_id = %plan.scan_id, "{message}");
            reporter.report_complete(CompletionStatus::Failed, Some(message.clone())).await;
            return ScanSummary {
                scan_id: plan.scan_id,
                status: CompletionStatus::Failed,
                stopped: false,
                discovery_count: reporter.discovery_count(),
                error_message: Some(message),
                subnets: Vec::new(),
                invalid_subnets,
                started_at,
                finished_at: now_rfc3339(),
            };
        }

        let ctx = Arc::new(ScanContext {
            scan_id: plan.scan_id.clone(),
            ports: plan.ports.clone(),
            timeout: plan.timeout,
            concurrency: plan.concurrency,
            dead_host_threshold: plan.dead_host_threshold,
            emit_server_events: plan.emit_server_events,
            exclusions: Exclusions::parse(&plan.exclude_subnets),
            governor: Arc::new(RateGovernor::new(Some(plan.rate_limit_pps))),
            prober: self.prober.clone(),
            publisher: self.publisher.clone(),
            reporter: reporter.clone(),
            counters: counters.clone(),
            cancel: cancel.clone(),
        });

        let ticker_stop = CancellationToken::new();
        let ticker = reporter.is_enabled().then(|| {
            tokio::spawn(progress_ticker(
                reporter.clone(),
                counters.clone(),
                addresses_total,
                Duration::from_millis(self.settings.callbacks.progress_interval_ms.max(100)),
                ticker_stop.clone(),
            ))
        });

        let mut set = JoinSet::new();
        for (idx, net) in nets.into_iter().enumerate() {
            let ctx = ctx.clone();
            set.spawn(async move { (idx, scanner::scan_subnet(ctx, net).await) });
        }
        let mut reports: Vec<(usize, SubnetReport)> = Vec::new();
        while let Some(res) = set.join_next().await {
            match res {
                Ok(r) => reports.push(r),
                Err(e) => error!(scan_id = %plan.scan_id, error = %e, "subnet pass panicked"),
            }
        }
        reports.sort_by_key(|(idx, _)| *idx);
        let subnets: Vec<SubnetReport> = reports.into_iter().map(|(_, r)| r).collect();

        ticker_stop.cancel();
        if let Some(t) = ticker {
            let _ = t.await;
        }

        // A stop that lands after every pass already finished changes nothing.
        let stopped = subnets.iter().any(|s| s.interrupted);
        let (status, error_message) = if stopped {
            match stop_reason.get() {
                Some(StopReason::Deadline) => (CompletionStatus::Timeout, Some("scan deadline exceeded".to_string())),
                _ => (CompletionStatus::Failed, Some("scan stopped before completion".to_string())),
            }
        } else {
            (CompletionStatus::Completed, None)
        };

        let probed: u64 = subnets.iter().map(|s| s.probed).sum();
        let open: u64 = subnets.iter().map(|s| s.open_ports).sum();
        if !stopped {
            reporter
                .report_progress(
                    Some(ScanPhase::Finalizing),
                    100,
                    Some(format!("{probed} hosts probed, {open} open ports")),
                )
                .await;
        }
        reporter.report_complete(status, error_message.clone()).await;

        let summary = ScanSummary {
            scan_id: plan.scan_id,
            status,
            stopped,
            discovery_count: reporter.discovery_count(),
            error_message,
            subnets,
            invalid_subnets,
            started_at,
            finished_at: now_rfc3339(),
        };
        info!(
            scan_id = %summary.scan_id,
            status = ?summary.status,
            probed,
            open_ports = open,
            discovery_count = summary.discovery_count,
            "scan finished"
        );
        summary
    }
}

async fn progress_ticker(
    reporter: Arc<ProgressReporter>,
    counters: ScanCounters,
    addresses_total: u64,
    period: Duration,
    stop: CancellationToken,
) {
    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = tick.tick() => {
                let done = counters.addresses_done.load(std::sync::atomic::Ordering::Relaxed);
                let probed = counters.probed.load(std::sync::atomic::Ordering::Relaxed);
                let open = counters.open_ports.load(std::sync::atomic::Ordering::Relaxed);
                reporter
                    .report_progress(
                        Some(ScanPhase::Scanning),
                        percent(done, addresses_total),
                        Some(format!("{probed} hosts probed, {open} open ports")),
                    )
                    .await;
            }
        }
    }
}

/// Capped at 99 so that 100 only ever comes with the final report.
fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done.saturating_mul(100) / total).min(99)) as u8
}

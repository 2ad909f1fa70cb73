#![allow(dead_code)]

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, http::HeaderMap, http::StatusCode, routing::post, Json, Router};
use serde_json::Value;
use tracing_subscriber::fmt::MakeWriter;

use net_discovery_rs::config::Settings;
use net_discovery_rs::orchestrator::ScanOrchestrator;
use net_discovery_rs::probe::{PortProbe, Prober};
use net_discovery_rs::publisher::{MemoryEventBus, Publisher};
use net_discovery_rs::types::{PortState, ScanConfiguration};

/// Prober that reports the scripted addresses as open and everything else as closed.
pub struct ScriptedProber {
    open: HashSet<SocketAddr>,
    delay: Duration,
    probed: Mutex<Vec<SocketAddr>>,
}

impl ScriptedProber {
    pub fn new(open: &[&str]) -> Self {
        Self::with_delay(open, Duration::ZERO)
    }

    pub fn with_delay(open: &[&str], delay: Duration) -> Self {
        Self {
            open: open.iter().map(|s| s.parse().expect("socket addr")).collect(),
            delay,
            probed: Mutex::new(Vec::new()),
        }
    }

    pub fn probed(&self) -> Vec<SocketAddr> {
        self.probed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, addr: SocketAddr, _timeout: Duration) -> PortProbe {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.probed.lock().unwrap().push(addr);
        if self.open.contains(&addr) {
            PortProbe { state: PortState::Open, banner: None, latency_ms: 1 }
        } else {
            PortProbe::closed()
        }
    }
}

#[derive(Clone, Default)]
struct ReceiverState {
    progress: Arc<Mutex<Vec<Value>>>,
    complete: Arc<Mutex<Vec<Value>>>,
    api_keys: Arc<Mutex<Vec<Option<String>>>>,
    complete_failures_left: Arc<AtomicUsize>,
}

/// Orchestrator-side endpoint recording progress and completion callbacks.
pub struct CallbackReceiver {
    pub base: String,
    state: ReceiverState,
}

impl CallbackReceiver {
    pub async fn start() -> Self {
        Self::start_failing_completions(0).await
    }

    /// Answers 503 to the first `n` completion posts.
    pub async fn start_failing_completions(n: usize) -> Self {
        let state = ReceiverState {
            complete_failures_left: Arc::new(AtomicUsize::new(n)),
            ..Default::default()
        };
        let app = Router::new()
            .route("/progress", post(on_progress))
            .route("/complete", post(on_complete))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { base: format!("http://{addr}"), state }
    }

    pub fn progress_url(&self) -> String {
        format!("{}/progress", self.base)
    }

    pub fn complete_url(&self) -> String {
        format!("{}/complete", self.base)
    }

    pub fn progress(&self) -> Vec<Value> {
        self.state.progress.lock().unwrap().clone()
    }

    pub fn completions(&self) -> Vec<Value> {
        self.state.complete.lock().unwrap().clone()
    }

    pub fn api_keys(&self) -> Vec<Option<String>> {
        self.state.api_keys.lock().unwrap().clone()
    }
}

async fn on_progress(State(st): State<ReceiverState>, headers: HeaderMap, Json(body): Json<Value>) -> StatusCode {
    record_key(&st, &headers);
    st.progress.lock().unwrap().push(body);
    StatusCode::OK
}

async fn on_complete(State(st): State<ReceiverState>, headers: HeaderMap, Json(body): Json<Value>) -> StatusCode {
    record_key(&st, &headers);
    let left = st.complete_failures_left.load(Ordering::SeqCst);
    if left > 0 {
        st.complete_failures_left.store(left - 1, Ordering::SeqCst);
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    st.complete.lock().unwrap().push(body);
    StatusCode::OK
}

fn record_key(st: &ReceiverState, headers: &HeaderMap) {
    let key = headers
        .get("x-internal-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    st.api_keys.lock().unwrap().push(key);
}

/// Settings tuned for fast tests.
pub fn test_settings() -> Settings {
    let mut s = Settings::default();
    s.scan.rate_limit_pps = 10_000;
    s.scan.timeout_ms = 50;
    s.scan.max_concurrent_hosts = 4;
    s.callbacks.request_timeout_ms = 2_000;
    s.callbacks.progress_interval_ms = 100;
    s.callbacks.retry_backoff_ms = 10;
    s
}

pub fn orchestrator(
    settings: Settings,
    prober: Arc<dyn Prober>,
    bus: Arc<MemoryEventBus>,
) -> Arc<ScanOrchestrator> {
    let publisher = Arc::new(Publisher::new(bus, settings.bus.exchange.clone(), settings.collector.source.clone()));
    ScanOrchestrator::new(Arc::new(settings), prober, publisher)
}

pub fn scan_config(scan_id: &str, subnets: &[&str], receiver: &CallbackReceiver) -> ScanConfiguration {
    ScanConfiguration {
        scan_id: scan_id.into(),
        subnets: subnets.iter().map(|s| s.to_string()).collect(),
        exclude_subnets: vec![],
        port_ranges: vec![],
        common_ports: vec![22],
        rate_limit_pps: Some(10_000),
        timeout_ms: Some(50),
        max_concurrent_hosts: Some(4),
        dead_host_threshold: None,
        progress_url: receiver.progress_url(),
        complete_url: receiver.complete_url(),
        api_key: Some("test-key".into()),
    }
}

/// In-memory log sink for asserting on emitted events.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    /// Scoped subscriber writing plain-text WARN and above into this sink.
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
        tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish()
    }

    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock().unwrap())
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.lines().into_iter().filter(|l| l.contains(" ERROR ")).collect()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

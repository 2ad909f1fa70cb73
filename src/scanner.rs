//! One subnet pass: a feeder walks the subnet into a bounded channel and a
//! fixed pool of workers probes what it admits. Every connection attempt takes
//! a token from the scan's rate governor first.
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::governor::RateGovernor;
use crate::probe::{classify_service, Prober};
use crate::progress::ProgressReporter;
use crate::publisher::{DiscoveryData, Publisher};
use crate::targets::{address_count, Exclusions, SubnetEnumerator};
use crate::types::{PortState, ProbeOutcome, Protocol, SubnetReport};

pub const DEFAULT_CONCURRENCY: usize = 100;
const MAX_CONCURRENCY: usize = 5_000;

/// Scan-wide counters read by the progress ticker and the status surface.
#[derive(Clone, Debug, Default)]
pub struct ScanCounters {
    pub addresses_done: Arc<AtomicU64>,
    pub probed: Arc<AtomicU64>,
    pub open_ports: Arc<AtomicU64>,
}

impl ScanCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Everything the passes of one scan share. Built once per scan.
pub struct ScanContext {
    pub scan_id: String,
    pub ports: Vec<u16>,
    pub timeout: Duration,
    pub concurrency: usize,
    pub dead_host_threshold: u32,
    pub emit_server_events: bool,
    pub exclusions: Exclusions,
    pub governor: Arc<RateGovernor>,
    pub prober: Arc<dyn Prober>,
    pub publisher: Arc<Publisher>,
    pub reporter: Arc<ProgressReporter>,
    pub counters: ScanCounters,
    pub cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct SubnetCounters {
    subnet: String,
    enumerated: AtomicU64,
    excluded: AtomicU64,
    admitted: AtomicU64,
    probed: AtomicU64,
    open_ports: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
    cut_short: AtomicBool,
}

impl SubnetCounters {
    fn report(&self, total: u64) -> SubnetReport {
        let excluded = self.excluded.load(Ordering::SeqCst);
        let probed = self.probed.load(Ordering::SeqCst);
        SubnetReport {
            subnet: self.subnet.clone(),
            enumerated: self.enumerated.load(Ordering::SeqCst),
            excluded,
            admitted: self.admitted.load(Ordering::SeqCst),
            probed,
            open_ports: self.open_ports.load(Ordering::SeqCst),
            published: self.published.load(Ordering::SeqCst),
            publish_failures: self.publish_failures.load(Ordering::SeqCst),
            interrupted: self.cut_short.load(Ordering::SeqCst) || excluded + probed < total,
        }
    }
}

/// Enumerate and probe one subnet. Never fails: per-target and publish errors
/// are absorbed into the returned counters.
pub async fn scan_subnet(ctx: Arc<ScanContext>, net: Ipv4Net) -> SubnetReport {
    let stats = Arc::new(SubnetCounters { subnet: net.to_string(), ..Default::default() });
    let workers = ctx.concurrency.clamp(1, MAX_CONCURRENCY);
    let (tx, rx) = mpsc::channel::<Ipv4Addr>(workers);
    let rx = Arc::new(Mutex::new(rx));

    info!(scan_id = %ctx.scan_id, subnet = %net, workers, "subnet pass started");

    let feeder = tokio::spawn(feed(ctx.clone(), net, tx, stats.clone()));
    let mut set = JoinSet::new();
    for _ in 0..workers {
        set.spawn(worker(ctx.clone(), rx.clone(), stats.clone()));
    }
    // Once every worker is gone the receiver drops and a blocked feeder unblocks.
    drop(rx);

    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            warn!(scan_id = %ctx.scan_id, subnet = %net, error = %e, "worker task failed");
        }
    }
    if let Err(e) = feeder.await {
        warn!(scan_id = %ctx.scan_id, subnet = %net, error = %e, "feeder task failed");
    }

    let report = stats.report(address_count(&net));
    if report.total_publish_failure() {
        error!(
            scan_id = %ctx.scan_id,
            subnet = %net,
            open_ports = report.open_ports,
            publish_failures = report.publish_failures,
            "every publish failed for subnet; discoveries were found but none reached the event bus"
        );
    }
    info!(
        scan_id = %ctx.scan_id,
        subnet = %net,
        enumerated = report.enumerated,
        excluded = report.excluded,
        probed = report.probed,
        open_ports = report.open_ports,
        published = report.published,
        "subnet pass finished"
    );
    report
}

async fn feed(ctx: Arc<ScanContext>, net: Ipv4Net, tx: mpsc::Sender<Ipv4Addr>, stats: Arc<SubnetCounters>) {
    for ip in SubnetEnumerator::new(net) {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let n = stats.enumerated.fetch_add(1, Ordering::SeqCst) + 1;
        if ctx.exclusions.contains(ip) {
            stats.excluded.fetch_add(1, Ordering::SeqCst);
            ctx.counters.addresses_done.fetch_add(1, Ordering::SeqCst);
            if n % 4096 == 0 {
                tokio::task::yield_now().await;
            }
            continue;
        }

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            sent = tx.send(ip) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    debug!(scan_id = %ctx.scan_id, subnet = %net, "feeder done");
    // Dropping `tx` closes the channel; workers drain what is queued and exit.
}

async fn worker(ctx: Arc<ScanContext>, rx: Arc<Mutex<mpsc::Receiver<Ipv4Addr>>>, stats: Arc<SubnetCounters>) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => None,
                ip = rx.recv() => ip,
            }
        };
        let Some(ip) = next else {
            break;
        };

        // An accepted target is always released; cancellation only skips its untried ports.
        stats.admitted.fetch_add(1, Ordering::SeqCst);
        if !probe_target(&ctx, &stats, ip).await {
            stats.cut_short.store(true, Ordering::SeqCst);
        }
        stats.probed.fetch_add(1, Ordering::SeqCst);
        ctx.counters.probed.fetch_add(1, Ordering::SeqCst);
        ctx.counters.addresses_done.fetch_add(1, Ordering::SeqCst);
    }
}

/// Probe every configured port of `ip`, one governor token per attempt.
/// Returns false when cancellation cut the host short.
async fn probe_target(ctx: &ScanContext, stats: &SubnetCounters, ip: Ipv4Addr) -> bool {
    let mut open_ports = Vec::new();
    let mut answered = false;
    let mut silent = 0u32;
    let mut finished = true;

    for &port in &ctx.ports {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                debug!(scan_id = %ctx.scan_id, %ip, port, "cancelled, skipping remaining ports");
                finished = false;
                break;
            }
            _ = ctx.governor.acquire() => {}
        }
        let probe = ctx.prober.probe(SocketAddr::from((ip, port)), ctx.timeout).await;
        match probe.state {
            PortState::Open => {
                answered = true;
                stats.open_ports.fetch_add(1, Ordering::SeqCst);
                ctx.counters.open_ports.fetch_add(1, Ordering::SeqCst);
                let (service, version) = classify_service(port, probe.banner.as_deref());
                let outcome = ProbeOutcome {
                    ip,
                    port,
                    protocol: Protocol::Tcp,
                    open: true,
                    service,
                    version,
                    banner: probe.banner,
                };
                debug!(scan_id = %ctx.scan_id, %ip, port, latency_ms = probe.latency_ms, "open port");
                publish(ctx, stats, DiscoveryData::service(&outcome)).await;
                open_ports.push(port);
            }
            PortState::Closed => answered = true,
            PortState::Filtered => {
                if !answered {
                    silent += 1;
                    if ctx.dead_host_threshold > 0 && silent >= ctx.dead_host_threshold {
                        debug!(scan_id = %ctx.scan_id, %ip, silent, "host looks dead, skipping remaining ports");
                        break;
                    }
                }
            }
        }
    }

    if ctx.emit_server_events && !open_ports.is_empty() {
        publish(ctx, stats, DiscoveryData::server(ip, open_ports)).await;
    }
    finished
}

async fn publish(ctx: &ScanContext, stats: &SubnetCounters, data: DiscoveryData) {
    match ctx.publisher.publish(data).await {
        Ok(_) => {
            stats.published.fetch_add(1, Ordering::SeqCst);
            ctx.reporter.record_discovery();
        }
        Err(e) => {
            stats.publish_failures.fetch_add(1, Ordering::SeqCst);
            warn!(scan_id = %ctx.scan_id, subnet = %stats.subnet, error = %e, "publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::PortProbe;
    use crate::publisher::MemoryEventBus;
    use async_trait::async_trait;
    use std::collections::HashSet;

    struct ScriptedProber {
        open: HashSet<SocketAddr>,
        seen: std::sync::Mutex<Vec<SocketAddr>>,
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, addr: SocketAddr, _timeout: Duration) -> PortProbe {
            self.seen.lock().unwrap().push(addr);
            if self.open.contains(&addr) {
                PortProbe { state: PortState::Open, banner: None, latency_ms: 1 }
            } else {
                PortProbe::filtered()
            }
        }
    }

    fn context(prober: Arc<ScriptedProber>, bus: Arc<MemoryEventBus>, ports: Vec<u16>, threshold: u32) -> Arc<ScanContext> {
        context_with_governor(prober, bus, ports, threshold, RateGovernor::new(Some(10_000)))
    }

    fn context_with_governor(
        prober: Arc<ScriptedProber>,
        bus: Arc<MemoryEventBus>,
        ports: Vec<u16>,
        threshold: u32,
        governor: RateGovernor,
    ) -> Arc<ScanContext> {
        Arc::new(ScanContext {
            scan_id: "unit".into(),
            ports,
            timeout: Duration::from_millis(10),
            concurrency: 3,
            dead_host_threshold: threshold,
            emit_server_events: true,
            exclusions: Exclusions::parse(&["10.0.0.3/32"]),
            governor: Arc::new(governor),
            prober,
            publisher: Arc::new(Publisher::new(bus, "discovery", "test")),
            reporter: Arc::new(ProgressReporter::disabled("unit", "test")),
            counters: ScanCounters::new(),
            cancel: CancellationToken::new(),
        })
    }

    #[tokio::test]
    async fn publishes_services_and_server_summary() {
        let open: SocketAddr = "10.0.0.2:80".parse().unwrap();
        let prober = Arc::new(ScriptedProber { open: HashSet::from([open]), seen: Default::default() });
        let bus = Arc::new(MemoryEventBus::new());
        let ctx = context(prober.clone(), bus.clone(), vec![22, 80], 0);

        let report = scan_subnet(ctx.clone(), "10.0.0.0/30".parse().unwrap()).await;

        assert_eq!(report.enumerated, 4);
        assert_eq!(report.excluded, 1);
        assert_eq!(report.probed, 3);
        assert_eq!(report.open_ports, 1);
        assert_eq!(report.published, 2);
        let keys: Vec<String> = bus.messages().into_iter().map(|m| m.routing_key).collect();
        assert!(keys.contains(&"discovered.service".to_string()));
        assert!(keys.contains(&"discovered.server".to_string()));
        assert_eq!(ctx.reporter.discovery_count(), 2);
        assert!(prober.seen.lock().unwrap().iter().all(|a| a.ip().to_string() != "10.0.0.3"));
    }

    #[tokio::test]
    async fn silent_hosts_are_abandoned() {
        let prober = Arc::new(ScriptedProber { open: HashSet::new(), seen: Default::default() });
        let bus = Arc::new(MemoryEventBus::new());
        let ctx = context(prober.clone(), bus, vec![1, 2, 3, 4, 5], 2);

        let report = scan_subnet(ctx, "10.0.1.0/31".parse().unwrap()).await;

        assert_eq!(report.probed, 2);
        // Two hosts, two attempts each before giving up.
        assert_eq!(prober.seen.lock().unwrap().len(), 4);
    }

    fn silent_prober() -> Arc<ScriptedProber> {
        Arc::new(ScriptedProber { open: HashSet::new(), seen: Default::default() })
    }

    #[tokio::test(start_paused = true)]
    async fn every_port_attempt_takes_a_token() {
        let prober = silent_prober();
        let ports: Vec<u16> = (1..=20).collect();
        let ctx = context_with_governor(prober.clone(), Arc::new(MemoryEventBus::new()), ports, 0, RateGovernor::with_burst(10, 1));

        let start = tokio::time::Instant::now();
        let report = scan_subnet(ctx, "10.0.2.1/32".parse().unwrap()).await;
        let elapsed = start.elapsed();

        assert_eq!(prober.seen.lock().unwrap().len(), 20);
        assert!(!report.interrupted);
        // One free token, then 19 more at 10 per second.
        assert!(elapsed >= Duration::from_millis(1_850), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_pass_marks_report_interrupted() {
        let prober = silent_prober();
        let ctx = context_with_governor(prober.clone(), Arc::new(MemoryEventBus::new()), vec![1, 2, 3, 4, 5], 0, RateGovernor::with_burst(10, 1));

        let pass = tokio::spawn(scan_subnet(ctx.clone(), "10.0.3.0/30".parse().unwrap()));
        tokio::time::sleep(Duration::from_millis(250)).await;
        ctx.cancel.cancel();
        let report = pass.await.unwrap();

        assert!(report.interrupted);
        assert!(prober.seen.lock().unwrap().len() < 15);
        assert_eq!(report.admitted, report.probed);
    }

    #[tokio::test]
    async fn cancel_after_pass_end_is_not_an_interruption() {
        let prober = silent_prober();
        let ctx = context(prober, Arc::new(MemoryEventBus::new()), vec![22], 0);

        let report = scan_subnet(ctx.clone(), "10.0.4.0/30".parse().unwrap()).await;
        ctx.cancel.cancel();

        assert!(!report.interrupted);
        assert_eq!(report.excluded + report.probed, 4);
    }
}

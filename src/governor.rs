use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Admission rate used when a scan does not configure one.
pub const DEFAULT_RATE_PPS: u32 = 100;

/// Token bucket bounding the connection attempts per second of one scan.
///
/// One instance is built per scan and shared by every worker of every subnet
/// pass; each attempt (one address:port) takes one token, so the configured
/// rate is an aggregate, independent of worker or subnet count.
/// The lock only guards the bucket arithmetic; waiting happens outside it.
#[derive(Debug)]
pub struct RateGovernor {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateGovernor {
    /// `None` or zero falls back to [`DEFAULT_RATE_PPS`]; the governor is never unbounded.
    /// Burst capacity is a tenth of a second worth of tokens (at least one).
    pub fn new(rate_pps: Option<u32>) -> Self {
        let rate = effective_rate(rate_pps);
        Self::with_burst(rate, (rate / 10).max(1))
    }

    pub fn with_burst(rate_pps: u32, burst: u32) -> Self {
        let rate = f64::from(effective_rate(Some(rate_pps)));
        let burst = f64::from(burst.max(1));
        Self {
            rate,
            burst,
            bucket: Mutex::new(Bucket { tokens: burst, last_refill: Instant::now() }),
        }
    }

    pub fn rate_pps(&self) -> u32 {
        self.rate as u32
    }

    /// Take one token if available, otherwise report how long until one is.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut b = self.bucket.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(b.last_refill).as_secs_f64();
        b.tokens = (b.tokens + elapsed * self.rate).min(self.burst);
        b.last_refill = now;

        if b.tokens >= 1.0 {
            b.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - b.tokens;
            Err(Duration::from_secs_f64(deficit / self.rate).max(Duration::from_millis(1)))
        }
    }

    /// Wait until a token is available. Callers race this against their
    /// cancellation token; dropping the future forfeits nothing.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}

fn effective_rate(rate_pps: Option<u32>) -> u32 {
    match rate_pps {
        Some(r) if r > 0 => r,
        _ => DEFAULT_RATE_PPS,
    }
}

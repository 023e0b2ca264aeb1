//! Shared proxy pool: selection, outcome reporting, health probes.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{ProxyEndpoint, ProxyError, ProxyHealth};

/// Consecutive failures before an endpoint is marked dead.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Per-endpoint state tracked by the pool.
#[derive(Debug)]
struct EndpointEntry {
    endpoint: ProxyEndpoint,
    health: ProxyHealth,
    consecutive_failures: u32,
    last_used_at: Option<Instant>,
    last_success_at: Option<Instant>,
    /// Latency of the last successful probe, if any
    latency_ms: Option<f64>,
}

impl EndpointEntry {
    fn new(endpoint: ProxyEndpoint) -> Self {
        Self {
            endpoint,
            health: ProxyHealth::Untested,
            consecutive_failures: 0,
            last_used_at: None,
            last_success_at: None,
            latency_ms: None,
        }
    }

    fn selectable(&self) -> bool {
        self.health != ProxyHealth::Dead
    }

    /// Selection rank: tier first, then least-recently-used within the tier.
    /// Never-used endpoints sort before any used one.
    fn rank(&self) -> (u8, Option<Instant>) {
        let tier = match self.health {
            ProxyHealth::Healthy => 0,
            ProxyHealth::Untested => 1,
            ProxyHealth::Degraded => 2,
            ProxyHealth::Dead => u8::MAX,
        };
        (tier, self.last_used_at)
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    entries: Vec<EndpointEntry>,
    rotations: u64,
    failures: u64,
}

/// Read-only view of one endpoint's state, for observability.
#[derive(Debug, Clone)]
pub struct EndpointSnapshot {
    pub endpoint: ProxyEndpoint,
    pub health: ProxyHealth,
    pub consecutive_failures: u32,
    pub latency_ms: Option<f64>,
    pub seconds_since_last_use: Option<u64>,
}

/// Pool-level counters.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PoolStats {
    pub pool_size: usize,
    pub healthy: usize,
    pub dead: usize,
    pub rotations: u64,
    pub failures: u64,
}

/// Result of a health probe sweep.
#[derive(Debug, Clone, Copy)]
pub struct ProbeReport {
    pub healthy: usize,
    pub unhealthy: usize,
}

/// Thread-safe pool of egress proxies shared by all sessions.
///
/// Selection policy: prefer Healthy, then Untested, then Degraded; within a
/// tier pick the least-recently-used endpoint. Dead endpoints are excluded
/// from selection but retained so operators can see what died and why.
///
/// All mutation goes through one lock; acquire/report/add/remove are each
/// atomic with respect to one another.
pub struct ProxyPool {
    inner: Mutex<PoolInner>,
    failure_threshold: u32,
}

impl ProxyPool {
    /// Create an empty pool.
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Create a pool from proxy URLs, in order.
    pub fn from_urls<S: AsRef<str>>(urls: &[S], failure_threshold: u32) -> Result<Self, ProxyError> {
        let pool = Self::new(failure_threshold);
        {
            let mut inner = pool.inner.lock();
            for url in urls {
                let endpoint = ProxyEndpoint::parse(url.as_ref())?;
                inner.entries.push(EndpointEntry::new(endpoint));
            }
        }
        info!("proxy pool initialized with {} endpoints", pool.len());
        Ok(pool)
    }

    /// Select a proxy for a new session.
    ///
    /// Stamps `last_used_at` on the winner so repeated calls spread load.
    /// Health is never changed here; only reported outcomes move it.
    pub fn acquire(&self) -> Result<ProxyEndpoint, ProxyError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .iter_mut()
            .filter(|e| e.selectable())
            .min_by_key(|e| e.rank());

        match entry {
            Some(entry) => {
                entry.last_used_at = Some(Instant::now());
                let endpoint = entry.endpoint.clone();
                debug!(proxy = %endpoint, health = ?entry.health, "proxy acquired");
                inner.rotations += 1;
                Ok(endpoint)
            }
            None => {
                warn!("proxy pool exhausted: no endpoint outside Dead");
                Err(ProxyError::PoolExhausted)
            }
        }
    }

    /// Feed a navigation (or probe) outcome back into health tracking.
    ///
    /// Success resets the failure counter and promotes to Healthy. Failure
    /// demotes to Degraded, and to Dead once the consecutive-failure count
    /// reaches the configured threshold. Dead is terminal; outcomes reported
    /// against a dead endpoint are ignored.
    pub fn report_outcome(&self, endpoint: &ProxyEndpoint, success: bool) {
        let mut inner = self.inner.lock();
        let key = endpoint.key();
        let Some(entry) = inner.entries.iter_mut().find(|e| e.endpoint.key() == key) else {
            debug!(proxy = %endpoint, "outcome for unknown endpoint ignored");
            return;
        };

        if entry.health == ProxyHealth::Dead {
            debug!(proxy = %endpoint, "outcome for dead endpoint ignored");
            return;
        }

        if success {
            entry.consecutive_failures = 0;
            entry.health = ProxyHealth::Healthy;
            entry.last_success_at = Some(Instant::now());
        } else {
            entry.consecutive_failures += 1;
            if entry.consecutive_failures >= self.failure_threshold {
                entry.health = ProxyHealth::Dead;
                warn!(
                    proxy = %endpoint,
                    failures = entry.consecutive_failures,
                    "proxy marked dead"
                );
            } else {
                entry.health = ProxyHealth::Degraded;
                debug!(proxy = %endpoint, failures = entry.consecutive_failures, "proxy degraded");
            }
            inner.failures += 1;
        }
    }

    /// Add an endpoint at runtime. Returns false (and leaves the pool
    /// untouched) if an endpoint with the same identity already exists.
    pub fn add(&self, endpoint: ProxyEndpoint) -> bool {
        let mut inner = self.inner.lock();
        if inner.entries.iter().any(|e| e.endpoint.key() == endpoint.key()) {
            warn!(proxy = %endpoint, "duplicate endpoint not added");
            return false;
        }
        info!(proxy = %endpoint, "endpoint added to pool");
        inner.entries.push(EndpointEntry::new(endpoint));
        true
    }

    /// Remove an endpoint at runtime. Returns true if it was present.
    pub fn remove(&self, endpoint: &ProxyEndpoint) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        let key = endpoint.key();
        inner.entries.retain(|e| e.endpoint.key() != key);
        let removed = inner.entries.len() < before;
        if removed {
            info!(proxy = %endpoint, "endpoint removed from pool");
        }
        removed
    }

    /// Total number of endpoints, dead ones included.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Number of endpoints currently marked Healthy.
    pub fn healthy_count(&self) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.health == ProxyHealth::Healthy)
            .count()
    }

    /// Per-endpoint state for observability. Dead endpoints are included.
    pub fn snapshot(&self) -> Vec<EndpointSnapshot> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|e| EndpointSnapshot {
                endpoint: e.endpoint.clone(),
                health: e.health,
                consecutive_failures: e.consecutive_failures,
                latency_ms: e.latency_ms,
                seconds_since_last_use: e.last_used_at.map(|t| t.elapsed().as_secs()),
            })
            .collect()
    }

    /// Pool-level counters.
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            pool_size: inner.entries.len(),
            healthy: inner
                .entries
                .iter()
                .filter(|e| e.health == ProxyHealth::Healthy)
                .count(),
            dead: inner
                .entries
                .iter()
                .filter(|e| e.health == ProxyHealth::Dead)
                .count(),
            rotations: inner.rotations,
            failures: inner.failures,
        }
    }

    /// Probe every non-dead endpoint with an HTTP GET through the proxy and
    /// feed the results through the normal outcome path. Probe latency is
    /// recorded on success.
    ///
    /// Probes run concurrently; the pool lock is not held across any await.
    pub async fn probe_all(&self, check_url: &str, timeout: Duration) -> ProbeReport {
        let targets: Vec<ProxyEndpoint> = {
            let inner = self.inner.lock();
            inner
                .entries
                .iter()
                .filter(|e| e.selectable())
                .map(|e| e.endpoint.clone())
                .collect()
        };

        let probes = targets
            .iter()
            .map(|endpoint| probe_one(endpoint, check_url, timeout));
        let results = futures::future::join_all(probes).await;

        let mut healthy = 0usize;
        let mut unhealthy = 0usize;
        for (endpoint, result) in targets.iter().zip(results) {
            match result {
                Ok(latency_ms) => {
                    self.report_outcome(endpoint, true);
                    self.record_latency(endpoint, latency_ms);
                    healthy += 1;
                }
                Err(reason) => {
                    debug!(proxy = %endpoint, %reason, "probe failed");
                    self.report_outcome(endpoint, false);
                    unhealthy += 1;
                }
            }
        }

        info!(healthy, unhealthy, "proxy health probe complete");
        ProbeReport { healthy, unhealthy }
    }

    fn record_latency(&self, endpoint: &ProxyEndpoint, latency_ms: f64) {
        let mut inner = self.inner.lock();
        let key = endpoint.key();
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.endpoint.key() == key) {
            entry.latency_ms = Some(latency_ms);
        }
    }
}

/// GET `check_url` through one proxy; Ok carries the round-trip latency.
async fn probe_one(
    endpoint: &ProxyEndpoint,
    check_url: &str,
    timeout: Duration,
) -> Result<f64, String> {
    let proxy = reqwest::Proxy::all(endpoint.authenticated_url()).map_err(|e| e.to_string())?;
    let client = reqwest::Client::builder()
        .proxy(proxy)
        .timeout(timeout)
        .build()
        .map_err(|e| e.to_string())?;

    let start = Instant::now();
    let response = client.get(check_url).send().await.map_err(|e| e.to_string())?;
    if response.status().is_success() {
        Ok(start.elapsed().as_secs_f64() * 1000.0)
    } else {
        Err(format!("probe returned HTTP {}", response.status()))
    }
}

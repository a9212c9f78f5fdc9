use crate::types::PortResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

/// Connect timeout applied to every probe unless configured otherwise.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Concurrent connect attempts allowed within one sweep unless configured otherwise.
pub const DEFAULT_MAX_CONCURRENCY: usize = 1000;

const MAX_CONCURRENCY_CEILING: usize = 5_000;

/// Knobs for a range sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeOptions {
    pub timeout: Duration,
    pub max_concurrency: usize,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PROBE_TIMEOUT,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

/// Something that can sweep a port range on a target.
///
/// The scheduler only talks to this trait, so tests can swap in slow or scripted probers.
#[async_trait]
pub trait PortProber: Send + Sync {
    async fn probe_range(&self, target: &str, start_port: u16, end_port: u16) -> Vec<PortResult>;
}

/// Production prober backed by asynchronous TCP connects.
#[derive(Clone, Debug, Default)]
pub struct TcpProber {
    options: ProbeOptions,
}

impl TcpProber {
    pub fn new(options: ProbeOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl PortProber for TcpProber {
    async fn probe_range(&self, target: &str, start_port: u16, end_port: u16) -> Vec<PortResult> {
        probe_range(target, start_port, end_port, self.options).await
    }
}

/// Check a single port with a bounded connect.
///
/// Refusal, timeout and resolution failure all count as closed; the elapsed time is
/// reported either way. With debug logging enabled the target is also resolved
/// up front so the log shows what it maps to.
pub async fn probe(target: &str, port: u16, timeout: Duration) -> PortResult {
    if tracing::enabled!(tracing::Level::DEBUG) {
        log_resolution(target, timeout).await;
    }
    connect_probe(target, port, timeout).await
}

/// Probe every port in `start_port..=end_port` and return once all have answered.
///
/// - Concurrency is bounded by a `Semaphore` of `options.max_concurrency` permits.
/// - Each connect is bounded by `options.timeout`.
/// - Results come back in completion order, one entry per port.
pub async fn probe_range(
    target: &str,
    start_port: u16,
    end_port: u16,
    options: ProbeOptions,
) -> Vec<PortResult> {
    if start_port > end_port {
        return Vec::new();
    }
    if tracing::enabled!(tracing::Level::DEBUG) {
        log_resolution(target, options.timeout).await;
    }

    let width = usize::from(end_port - start_port) + 1;
    let sem = Arc::new(Semaphore::new(
        options.max_concurrency.clamp(1, MAX_CONCURRENCY_CEILING),
    ));
    let target: Arc<str> = Arc::from(target);
    let mut set = JoinSet::new();

    for port in start_port..=end_port {
        let Ok(permit) = sem.clone().acquire_owned().await else {
            break;
        };
        let target = target.clone();
        let timeout = options.timeout;
        set.spawn(async move {
            let _permit = permit; // keep permit until the connect resolves
            connect_probe(&target, port, timeout).await
        });
    }

    let mut results = Vec::with_capacity(width);
    while let Some(res) = set.join_next().await {
        match res {
            Ok(r) => results.push(r),
            Err(e) => warn!(host = %target, error = %e, "probe task failed"),
        }
    }
    close_unanswered(start_port, end_port, &mut results);
    results
}

/// Append a closed result for every port in the range that has none, so a lost
/// probe task never shrinks the sweep.
fn close_unanswered(start_port: u16, end_port: u16, results: &mut Vec<PortResult>) {
    let width = usize::from(end_port - start_port) + 1;
    if results.len() >= width {
        return;
    }
    let mut answered = vec![false; width];
    for r in results.iter() {
        answered[usize::from(r.port - start_port)] = true;
    }
    for (offset, seen) in answered.into_iter().enumerate() {
        if !seen {
            results.push(PortResult {
                port: start_port + offset as u16,
                is_open: false,
                duration_ms: 0,
            });
        }
    }
}

async fn connect_probe(target: &str, port: u16, timeout: Duration) -> PortResult {
    let start = Instant::now();
    let is_open = matches!(
        time::timeout(timeout, TcpStream::connect((target, port))).await,
        Ok(Ok(_))
    );
    PortResult {
        port,
        is_open,
        duration_ms: start.elapsed().as_millis() as u64,
    }
}

async fn log_resolution(target: &str, timeout: Duration) {
    match time::timeout(timeout, lookup_host((target, 0))).await {
        Ok(Ok(addrs)) => {
            let addrs: Vec<_> = addrs.map(|a| a.ip()).collect();
            debug!(host = %target, ?addrs, "target resolved");
        }
        Ok(Err(e)) => debug!(host = %target, error = %e, "target lookup failed"),
        Err(_) => debug!(host = %target, "target lookup timed out"),
    }
}

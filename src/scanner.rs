use crate::error::ScanError;
use crate::ports;
use crate::types::PortResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use ::time::OffsetDateTime;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Probes between two progress log lines.
const PROGRESS_EVERY: u64 = 1000;

/// Upper bound on the per-connect timeout.
pub const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Host to probe: an IP literal or a resolvable name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTarget(String);

impl ScanTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self(host.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve to a single address, preferring IPv4 when a name has both.
    pub async fn resolve(&self) -> Result<IpAddr, ScanError> {
        if let Ok(ip) = self.0.parse::<IpAddr>() {
            return Ok(ip);
        }
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.0.as_str(), 0))
            .await
            .map_err(|e| ScanError::Resolve {
                target: self.0.clone(),
                reason: e.to_string(),
            })?
            .collect();
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .map(|a| a.ip())
            .ok_or_else(|| ScanError::Resolve {
                target: self.0.clone(),
                reason: "no addresses returned".into(),
            })
    }
}

impl fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decides whether `addr` accepts a TCP connection within `timeout`.
///
/// Refused, unreachable and timed-out attempts all report `false`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> bool;
}

/// Plain TCP connect, dropped as soon as the handshake completes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> bool {
        matches!(time::timeout(timeout, TcpStream::connect(addr)).await, Ok(Ok(_)))
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Number of concurrent probe workers.
    pub workers: usize,
    /// Per-port connect timeout, clamped to [`MAX_CONNECT_TIMEOUT`].
    pub connect_timeout: Duration,
    /// Overall deadline after which remaining probes are abandoned.
    pub scan_timeout: Option<Duration>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            workers: 100,
            connect_timeout: MAX_CONNECT_TIMEOUT,
            scan_timeout: None,
        }
    }
}

/// Live counters shared with observers such as the status API.
#[derive(Clone, Debug, Default)]
pub struct ScanProgress {
    pub total: Arc<AtomicU64>,
    pub probed: Arc<AtomicU64>,
    pub open: Arc<AtomicU64>,
}

impl ScanProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.total.load(Ordering::Relaxed),
            self.probed.load(Ordering::Relaxed),
            self.open.load(Ordering::Relaxed),
        )
    }
}

/// A running scan: open results arrive on `results` as workers find them.
///
/// The channel closes once every worker has exited, either because the queue
/// drained or because the scan was cancelled.
pub struct ScanHandle {
    pub results: mpsc::Receiver<PortResult>,
    supervisor: JoinHandle<()>,
}

impl ScanHandle {
    /// Wait for the workers to exit. Results not yet received stay in the channel.
    pub async fn join(self) {
        if let Err(e) = self.supervisor.await {
            error!(error = %e, "scan supervisor task failed");
        }
    }
}

/// Concurrent TCP connect prober with a fixed worker pool.
#[derive(Clone)]
pub struct PortProbe {
    connector: Arc<dyn Connector>,
    options: ScanOptions,
}

impl PortProbe {
    pub fn new(options: ScanOptions) -> Self {
        Self::with_connector(Arc::new(TcpConnector), options)
    }

    pub fn with_connector(connector: Arc<dyn Connector>, options: ScanOptions) -> Self {
        Self { connector, options }
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        self.connector.clone()
    }

    /// Probe every port and return the open ones, sorted by port.
    pub async fn scan(
        &self,
        ip: IpAddr,
        ports: &[u16],
        cancel: CancellationToken,
    ) -> Result<Vec<PortResult>, ScanError> {
        let mut handle = self.scan_streaming(ip, ports, cancel, ScanProgress::new())?;
        let mut open = Vec::new();
        while let Some(result) = handle.results.recv().await {
            open.push(result);
        }
        handle.join().await;
        open.sort_by_key(|r| r.port);
        Ok(open)
    }

    /// Start probing in the background and stream open results back.
    ///
    /// Must be called within a tokio runtime.
    pub fn scan_streaming(
        &self,
        ip: IpAddr,
        ports: &[u16],
        cancel: CancellationToken,
        progress: ScanProgress,
    ) -> Result<ScanHandle, ScanError> {
        if ports.is_empty() {
            return Err(ScanError::EmptyPortSet);
        }

        let total = ports.len() as u64;
        progress.total.store(total, Ordering::Relaxed);
        let workers = self.options.workers.clamp(1, ports.len());
        let timeout = self.options.connect_timeout.min(MAX_CONNECT_TIMEOUT);
        let queue = Arc::new(Mutex::new(ports.iter().copied().collect::<VecDeque<u16>>()));
        let (tx, rx) = mpsc::channel(workers.max(64));

        info!(%ip, ports = total, workers, timeout_ms = timeout.as_millis() as u64, "starting port scan");

        let mut set = JoinSet::new();
        for _ in 0..workers {
            set.spawn(probe_worker(
                ip,
                timeout,
                self.connector.clone(),
                queue.clone(),
                tx.clone(),
                cancel.clone(),
                progress.clone(),
            ));
        }
        drop(tx);

        let scan_timeout = self.options.scan_timeout;
        let supervisor = tokio::spawn(async move {
            let drain = async {
                while let Some(joined) = set.join_next().await {
                    if let Err(e) = joined {
                        error!(%ip, error = %e, "probe worker failed");
                    }
                }
            };
            match scan_timeout {
                Some(limit) => {
                    tokio::pin!(drain);
                    let expired = tokio::select! {
                        _ = &mut drain => false,
                        _ = time::sleep(limit) => true,
                    };
                    if expired {
                        info!(%ip, limit_ms = limit.as_millis() as u64, "scan deadline reached, abandoning remaining probes");
                        cancel.cancel();
                        drain.await;
                    }
                }
                None => drain.await,
            }
            let (total, probed, open) = progress.snapshot();
            info!(%ip, total, probed, open, "port scan finished");
        });

        Ok(ScanHandle {
            results: rx,
            supervisor,
        })
    }
}

async fn probe_worker(
    ip: IpAddr,
    timeout: Duration,
    connector: Arc<dyn Connector>,
    queue: Arc<Mutex<VecDeque<u16>>>,
    tx: mpsc::Sender<PortResult>,
    cancel: CancellationToken,
    progress: ScanProgress,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let next = queue.lock().pop_front();
        let Some(port) = next else {
            return;
        };

        let addr = SocketAddr::new(ip, port);
        let open = tokio::select! {
            _ = cancel.cancelled() => return,
            open = connector.connect(addr, timeout) => open,
        };

        let done = progress.probed.fetch_add(1, Ordering::Relaxed) + 1;
        if done % PROGRESS_EVERY == 0 {
            info!(
                %ip,
                probed = done,
                total = progress.total.load(Ordering::Relaxed),
                open = progress.open.load(Ordering::Relaxed),
                "scan progress"
            );
        }
        if !open {
            continue;
        }

        progress.open.fetch_add(1, Ordering::Relaxed);
        debug!(%addr, "port open");
        let result = PortResult {
            port,
            open: true,
            service: ports::service_name(port),
            suspicious: ports::is_suspicious(port),
            probed_at: OffsetDateTime::now_utc(),
        };
        if tx.send(result).await.is_err() {
            // receiver dropped, nobody is listening any more
            return;
        }
    }
}

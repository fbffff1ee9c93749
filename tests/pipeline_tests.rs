use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use portwarden::enforcer::{Enforcer, MemoryFirewall, UnblockOutcome};
use portwarden::handler::{Enforcement, ThreatHandler};
use portwarden::ledger::ThreatLedger;
use portwarden::scanner::{Connector, PortProbe, ScanOptions, ScanProgress, ScanTarget};
use portwarden::types::Severity;

/// Every port is open; connecting to `at` fires `cancel`.
struct CancelsAt {
    at: u16,
    cancel: CancellationToken,
}

#[async_trait]
impl Connector for CancelsAt {
    async fn connect(&self, addr: SocketAddr, _timeout: Duration) -> bool {
        if addr.port() == self.at {
            self.cancel.cancel();
        }
        true
    }
}

/// Simulated host: only the listed ports accept connections.
struct SimulatedHost(BTreeSet<u16>);

#[async_trait]
impl Connector for SimulatedHost {
    async fn connect(&self, addr: SocketAddr, _timeout: Duration) -> bool {
        self.0.contains(&addr.port())
    }
}

struct Pipeline {
    handler: ThreatHandler,
    ledger: ThreatLedger,
    firewall: Arc<MemoryFirewall>,
}

fn pipeline(open: &[u16]) -> Pipeline {
    pipeline_with(
        Arc::new(SimulatedHost(open.iter().copied().collect())),
        ThreatLedger::open_in_memory().unwrap(),
        8,
    )
}

fn pipeline_with(connector: Arc<dyn Connector>, ledger: ThreatLedger, workers: usize) -> Pipeline {
    let firewall = Arc::new(MemoryFirewall::new());
    let enforcer = Enforcer::new(ledger.clone(), firewall.clone());
    let probe = PortProbe::with_connector(
        connector,
        ScanOptions {
            workers,
            connect_timeout: Duration::from_millis(50),
            scan_timeout: None,
        },
    );
    Pipeline {
        handler: ThreatHandler::new(probe, enforcer),
        ledger,
        firewall,
    }
}

fn host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))
}

async fn scan(p: &Pipeline, ports: &[u16]) -> portwarden::handler::ScanOutcome {
    p.handler
        .scan_and_process(
            &ScanTarget::new("10.0.0.5"),
            ports,
            CancellationToken::new(),
            ScanProgress::new(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn high_risk_host_is_recorded_and_blocked_once() {
    let p = pipeline(&[22, 80, 3389]);
    let ports: Vec<u16> = (1..=4000).collect();
    let outcome = scan(&p, &ports).await;

    assert_eq!(outcome.report.ports(), vec![22, 80, 3389]);
    let severities: BTreeMap<u16, Severity> =
        outcome.threats.iter().map(|t| (t.port, t.severity)).collect();
    assert_eq!(
        severities,
        BTreeMap::from([
            (22, Severity::High),
            (80, Severity::Medium),
            (3389, Severity::High),
        ])
    );

    assert_eq!(p.ledger.query_blocked(), BTreeSet::from([host()]));
    assert_eq!(p.firewall.rules(), BTreeSet::from([host()]));
    assert_eq!(p.firewall.block_calls(), 1);

    let summary = p.ledger.summarize(10).unwrap();
    assert_eq!(summary.count(Severity::High), 2);
    assert_eq!(summary.count(Severity::Medium), 1);
    assert_eq!(summary.count(Severity::Low), 0);
    assert_eq!(summary.blocked_ips, 1);
}

#[tokio::test]
async fn unblock_then_new_high_observation_blocks_again() {
    let p = pipeline(&[22]);
    scan(&p, &[22]).await;
    assert!(p.ledger.is_blocked(host()));

    let outcome = p.handler.enforcer().unblock(host()).await.unwrap();
    assert_eq!(outcome, UnblockOutcome::Unblocked);
    assert!(p.ledger.query_blocked().is_empty());
    assert!(p.firewall.rules().is_empty());

    // A second unblock is a no-op.
    let outcome = p.handler.enforcer().unblock(host()).await.unwrap();
    assert_eq!(outcome, UnblockOutcome::NotBlocked);
    assert_eq!(p.firewall.unblock_calls(), 1);

    let outcome = scan(&p, &[22]).await;
    assert_eq!(outcome.threats[0].enforcement, Enforcement::Blocked);
    assert!(p.ledger.is_blocked(host()));
    assert_eq!(p.firewall.block_calls(), 2);
}

#[tokio::test]
async fn severity_counts_cover_every_record() {
    let p = pipeline(&[22, 25, 80, 443, 8080, 31337]);
    scan(&p, &[22, 25, 80, 443, 8080, 31337, 9999]).await;
    scan(&p, &[80, 8080]).await;

    let summary = p.ledger.summarize(3).unwrap();
    assert_eq!(summary.total(), p.ledger.record_count().unwrap());
    assert_eq!(summary.total(), 8);
    assert_eq!(summary.recent_threats.len(), 3);
}

#[tokio::test]
async fn firewall_failure_leaves_records_unblocked() {
    let p = pipeline(&[22]);
    p.firewall.fail_blocks(true);

    let outcome = scan(&p, &[22]).await;
    assert!(matches!(outcome.threats[0].enforcement, Enforcement::Failed(_)));
    assert!(p.ledger.query_blocked().is_empty());

    let record = p.ledger.get(outcome.threats[0].record_id).unwrap().unwrap();
    assert!(!record.blocked);
    assert_eq!(record.severity, Severity::High);
}

#[tokio::test]
async fn suspicious_medium_port_triggers_block() {
    let p = pipeline(&[25]);
    let outcome = scan(&p, &[25]).await;
    let threat = &outcome.threats[0];
    assert_eq!(threat.severity, Severity::Medium);
    assert!(threat.suspicious);
    assert_eq!(threat.enforcement, Enforcement::Blocked);
    assert!(p.ledger.is_blocked(host()));
}

#[tokio::test]
async fn plain_medium_port_is_only_recorded() {
    let p = pipeline(&[80]);
    let outcome = scan(&p, &[80]).await;
    assert_eq!(outcome.threats[0].enforcement, Enforcement::NotRequired);
    assert!(p.ledger.query_blocked().is_empty());
    assert_eq!(p.firewall.block_calls(), 0);
    assert_eq!(p.ledger.record_count().unwrap(), 1);
}

#[tokio::test]
async fn low_risk_ports_are_never_blocked() {
    let p = pipeline(&[8080, 9999]);
    let outcome = scan(&p, &[8080, 9999]).await;
    assert!(outcome.threats.iter().all(|t| t.severity == Severity::Low));
    assert!(p.ledger.query_blocked().is_empty());
}

#[tokio::test]
async fn restore_reapplies_ledger_blocks() {
    let p = pipeline(&[3389]);
    scan(&p, &[3389]).await;

    let fresh = Arc::new(MemoryFirewall::new());
    let enforcer = Enforcer::new(p.ledger.clone(), fresh.clone());
    assert_eq!(enforcer.restore().await, 1);
    assert_eq!(fresh.rules(), BTreeSet::from([host()]));
}

#[tokio::test]
async fn cancelled_scan_still_reports_processed_ports() {
    let p = pipeline(&[22]);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = p
        .handler
        .scan_and_process(
            &ScanTarget::new("10.0.0.5"),
            &[22],
            cancel,
            ScanProgress::new(),
        )
        .await
        .unwrap();
    assert!(outcome.cancelled);
    assert_eq!(outcome.persistence_failures, 0);
}

#[tokio::test]
async fn cancel_mid_stream_keeps_processed_records() {
    let cancel = CancellationToken::new();
    let p = pipeline_with(
        Arc::new(CancelsAt {
            at: 10,
            cancel: cancel.clone(),
        }),
        ThreatLedger::open_in_memory().unwrap(),
        1,
    );
    let ports: Vec<u16> = (1..=50).collect();
    let outcome = p
        .handler
        .scan_and_process(&ScanTarget::new("10.0.0.5"), &ports, cancel, ScanProgress::new())
        .await
        .unwrap();

    assert!(outcome.cancelled);
    // Ports 1-9 finish before the cancel; port 10 races it.
    assert!((9..=10).contains(&outcome.threats.len()), "{}", outcome.threats.len());
    assert_eq!(p.ledger.record_count().unwrap(), outcome.threats.len() as u64);
    for t in &outcome.threats {
        assert!(p.ledger.get(t.record_id).unwrap().is_some());
    }
}

#[tokio::test]
async fn broken_store_is_counted_and_scan_finishes() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("threats.db");
    let p = pipeline_with(
        Arc::new(SimulatedHost(BTreeSet::from([22, 80, 8080]))),
        ThreatLedger::open(&db).unwrap(),
        4,
    );

    let first = scan(&p, &[22, 80, 8080, 9000]).await;
    assert_eq!(first.persistence_failures, 0);
    assert_eq!(first.threats.len(), 3);

    rusqlite::Connection::open(&db)
        .unwrap()
        .execute_batch("DROP TABLE threats;")
        .unwrap();

    let second = scan(&p, &[22, 80, 8080, 9000]).await;
    assert!(!second.cancelled);
    assert_eq!(second.report.ports(), vec![22, 80, 8080]);
    assert_eq!(second.persistence_failures, 3);
    assert!(second.threats.is_empty());
    assert_eq!(p.firewall.block_calls(), 1);
}

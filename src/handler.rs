use std::net::IpAddr;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::classifier::{classify, should_block};
use crate::enforcer::{BlockOutcome, Enforcer};
use crate::error::{LedgerError, ScanError};
use crate::ledger::ThreatLedger;
use crate::scanner::{PortProbe, ScanProgress, ScanTarget};
use crate::types::{PortResult, ScanReport, Severity};

/// What enforcement did for one observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum Enforcement {
    NotRequired,
    Blocked,
    AlreadyBlocked,
    Failed(String),
}

/// One open port after classification and recording.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedThreat {
    pub record_id: i64,
    pub ip: IpAddr,
    pub port: u16,
    pub service: String,
    pub severity: Severity,
    pub suspicious: bool,
    pub enforcement: Enforcement,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanOutcome {
    pub target: String,
    pub ip: IpAddr,
    pub report: ScanReport,
    pub threats: Vec<ProcessedThreat>,
    /// Open ports whose observation could not be persisted.
    pub persistence_failures: usize,
    pub cancelled: bool,
}

/// Probe → classify → record → enforce.
#[derive(Clone)]
pub struct ThreatHandler {
    probe: PortProbe,
    enforcer: Enforcer,
}

impl ThreatHandler {
    pub fn new(probe: PortProbe, enforcer: Enforcer) -> Self {
        Self { probe, enforcer }
    }

    pub fn ledger(&self) -> &ThreatLedger {
        self.enforcer.ledger()
    }

    pub fn enforcer(&self) -> &Enforcer {
        &self.enforcer
    }

    pub fn probe(&self) -> &PortProbe {
        &self.probe
    }

    /// Classify and record one probe result, blocking the source if policy says so.
    ///
    /// Closed results are ignored. Enforcement failures are logged and
    /// reported in the returned value; only persistence errors propagate.
    pub async fn process(
        &self,
        ip: IpAddr,
        result: &PortResult,
    ) -> Result<Option<ProcessedThreat>, LedgerError> {
        if !result.open {
            return Ok(None);
        }

        let severity = classify(result.port, &result.service, result.suspicious);
        let note = result.suspicious.then_some("suspicious");
        let (port, service) = (result.port, result.service.clone());
        let record_id = self
            .ledger()
            .blocking(move |l| l.record(ip, port, &service, severity, note))
            .await?;

        match severity {
            Severity::High | Severity::Medium => warn!(
                %ip, port = result.port, service = %result.service, %severity,
                suspicious = result.suspicious, "THREAT_DETECTED"
            ),
            Severity::Low => info!(
                %ip, port = result.port, service = %result.service, %severity,
                suspicious = result.suspicious, "THREAT_DETECTED"
            ),
        }

        let enforcement = if should_block(severity, result.suspicious) {
            let reason = match severity {
                Severity::High => format!(
                    "High-risk service detected: {} on port {}",
                    result.service, result.port
                ),
                _ => format!(
                    "Suspicious activity: {} on port {}",
                    result.service, result.port
                ),
            };
            match self.enforcer.block(ip, &reason).await {
                Ok(BlockOutcome::Blocked) => Enforcement::Blocked,
                Ok(BlockOutcome::AlreadyBlocked) => Enforcement::AlreadyBlocked,
                Err(e) => Enforcement::Failed(e.to_string()),
            }
        } else {
            Enforcement::NotRequired
        };

        Ok(Some(ProcessedThreat {
            record_id,
            ip,
            port: result.port,
            service: result.service.clone(),
            severity,
            suspicious: result.suspicious,
            enforcement,
        }))
    }

    /// Scan `target` and process each open port as soon as it is found.
    ///
    /// A persistence failure for one port is logged and counted; the scan goes
    /// on. Cancelling returns whatever was processed so far.
    pub async fn scan_and_process(
        &self,
        target: &ScanTarget,
        ports: &[u16],
        cancel: CancellationToken,
        progress: ScanProgress,
    ) -> Result<ScanOutcome, ScanError> {
        let ip = target.resolve().await?;
        let mut handle = self
            .probe
            .scan_streaming(ip, ports, cancel.clone(), progress)?;

        let mut open = Vec::new();
        let mut threats = Vec::new();
        let mut persistence_failures = 0;
        while let Some(result) = handle.results.recv().await {
            match self.process(ip, &result).await {
                Ok(Some(threat)) => threats.push(threat),
                Ok(None) => {}
                Err(e) => {
                    persistence_failures += 1;
                    error!(%ip, port = result.port, error = %e, "failed to record observation");
                }
            }
            open.push(result);
        }
        handle.join().await;

        threats.sort_by_key(|t| t.port);
        let outcome = ScanOutcome {
            target: target.to_string(),
            ip,
            report: ScanReport::from_results(&open),
            threats,
            persistence_failures,
            cancelled: cancel.is_cancelled(),
        };
        info!(
            scan_target = %outcome.target,
            %ip,
            open = outcome.report.len(),
            persistence_failures,
            cancelled = outcome.cancelled,
            "scan processed"
        );
        Ok(outcome)
    }
}

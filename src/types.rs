use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Threat level assigned to an observed open port.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub const ALL: [Severity; 3] = [Severity::Low, Severity::Medium, Severity::High];

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// One probed port that accepted a connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortResult {
    pub port: u16,
    pub open: bool,
    pub service: String,
    pub suspicious: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub probed_at: OffsetDateTime,
}

/// Per-port entry of a [`ScanReport`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OpenPort {
    pub service: String,
    pub open: bool,
}

/// `{port: {service, open}}` view of a scan, handed to vulnerability lookups.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct ScanReport(pub BTreeMap<u16, OpenPort>);

impl ScanReport {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a PortResult>) -> Self {
        let map = results
            .into_iter()
            .filter(|r| r.open)
            .map(|r| {
                (
                    r.port,
                    OpenPort {
                        service: r.service.clone(),
                        open: true,
                    },
                )
            })
            .collect();
        ScanReport(map)
    }

    pub fn ports(&self) -> Vec<u16> {
        self.0.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A persisted observation of one open port.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ThreatRecord {
    pub id: i64,
    pub ip: IpAddr,
    pub port: u16,
    pub service: String,
    pub severity: Severity,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub action_taken: String,
    pub blocked: bool,
}

/// Aggregate view over the ledger.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ThreatSummary {
    pub severity_counts: BTreeMap<Severity, u64>,
    pub blocked_ips: u64,
    pub recent_threats: Vec<ThreatRecord>,
}

impl ThreatSummary {
    pub fn total(&self) -> u64 {
        self.severity_counts.values().sum()
    }

    pub fn count(&self, severity: Severity) -> u64 {
        self.severity_counts.get(&severity).copied().unwrap_or(0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementAction {
    Block,
    Unblock,
}

impl EnforcementAction {
    pub fn as_str(self) -> &'static str {
        match self {
            EnforcementAction::Block => "block",
            EnforcementAction::Unblock => "unblock",
        }
    }
}

/// Audit entry for a successful block or unblock.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EnforcementEvent {
    pub id: i64,
    pub ip: IpAddr,
    pub action: EnforcementAction,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub upto_threat_id: i64,
}

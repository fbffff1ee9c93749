use std::fmt::Write as _;
use std::time::Duration;

use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::time::{self as ttime, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::ledger::ThreatLedger;
use crate::types::{Severity, ThreatSummary};

/// Read-only periodic view over the ledger.
pub struct Monitor {
    ledger: ThreatLedger,
    interval: Duration,
    recent_limit: usize,
}

impl Monitor {
    pub fn new(ledger: ThreatLedger, interval: Duration, recent_limit: usize) -> Self {
        Self {
            ledger,
            interval: interval.max(Duration::from_millis(1)),
            recent_limit,
        }
    }

    /// Poll until `cancel` fires, handing each summary to `sink`. Returns the number of polls.
    ///
    /// A failed read is logged and skipped; the loop keeps going.
    pub async fn run<F>(&self, cancel: CancellationToken, mut sink: F) -> u64
    where
        F: FnMut(&ThreatSummary),
    {
        let mut ticker = ttime::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut polls = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    polls += 1;
                    let limit = self.recent_limit;
                    match self.ledger.blocking(move |l| l.summarize(limit)).await {
                        Ok(summary) => sink(&summary),
                        Err(e) => error!(error = %e, "monitor failed to read threat summary"),
                    }
                }
            }
        }
        info!(polls, "threat monitor stopped");
        polls
    }
}

fn marker(severity: Severity) -> &'static str {
    match severity {
        Severity::High => "[HIGH]  ",
        Severity::Medium => "[MEDIUM]",
        Severity::Low => "[LOW]   ",
    }
}

/// Plaintext rendering of a summary.
pub fn render_summary(summary: &ThreatSummary, now: OffsetDateTime) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "LIVE THREAT MONITORING");
    let _ = writeln!(out, "{}", "-".repeat(40));
    let _ = writeln!(out, "Threat summary:");
    for severity in [Severity::High, Severity::Medium, Severity::Low] {
        let _ = writeln!(out, "  {} {}", marker(severity), summary.count(severity));
    }
    let _ = writeln!(out, "\nBlocked IPs: {}", summary.blocked_ips);
    let _ = writeln!(out, "\nRecent threats:");
    if summary.recent_threats.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for t in &summary.recent_threats {
        let ts = t.timestamp.format(&Rfc3339).unwrap_or_else(|_| t.timestamp.to_string());
        let blocked = if t.blocked { " BLOCKED" } else { "" };
        let _ = writeln!(
            out,
            "  {} {}:{} - {} ({}){}",
            marker(t.severity),
            t.ip,
            t.port,
            t.service,
            ts,
            blocked
        );
    }
    let now = now.format(&Rfc3339).unwrap_or_else(|_| now.to_string());
    let _ = writeln!(out, "\nLast update: {now}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn polls_until_cancelled_without_writing() {
        let ledger = ThreatLedger::open_in_memory().unwrap();
        ledger
            .record(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), 22, "SSH", Severity::High, None)
            .unwrap();

        let monitor = Monitor::new(ledger.clone(), Duration::from_millis(10), 5);
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            stopper.cancel();
        });

        let mut seen = Vec::new();
        let polls = monitor.run(cancel, |s| seen.push(s.total())).await;
        assert!(polls >= 2, "polls = {polls}");
        assert!(seen.iter().all(|t| *t == 1));
        assert_eq!(ledger.record_count().unwrap(), 1);
        assert!(ledger.query_blocked().is_empty());
    }

    #[tokio::test]
    async fn already_cancelled_monitor_returns_immediately() {
        let ledger = ThreatLedger::open_in_memory().unwrap();
        let monitor = Monitor::new(ledger, Duration::from_secs(60), 5);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let polls = monitor.run(cancel, |_| {}).await;
        assert!(polls <= 1);
    }

    #[test]
    fn render_lists_counts_and_recent() {
        let ledger = ThreatLedger::open_in_memory().unwrap();
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100));
        ledger.record(ip, 22, "SSH", Severity::High, None).unwrap();
        ledger.record(ip, 80, "HTTP", Severity::Medium, None).unwrap();
        ledger.mark_blocked(ip, "ssh").unwrap();

        let text = render_summary(&ledger.summarize(5).unwrap(), OffsetDateTime::UNIX_EPOCH);
        assert!(text.contains("[HIGH]   1"));
        assert!(text.contains("[MEDIUM] 1"));
        assert!(text.contains("Blocked IPs: 1"));
        assert!(text.contains("192.168.1.100:22 - SSH"));
        assert!(text.contains("Last update: 1970-01-01T00:00:00Z"));
    }
}

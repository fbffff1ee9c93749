//! Durable threat ledger backed by SQLite.
//!
//! Every observation is one row in `threats`. Blocked membership is derived
//! from those rows plus the unblock watermarks kept in the `enforcement`
//! audit table: an address is blocked iff it has a blocked threat row newer
//! than its last unblock. The in-memory blocked set is a cache of that query,
//! rebuilt on open and updated under the connection lock after each commit.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension, Row};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::error::LedgerError;
use crate::types::{EnforcementAction, EnforcementEvent, Severity, ThreatRecord, ThreatSummary};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS threats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ip TEXT NOT NULL,
    port INTEGER NOT NULL,
    service TEXT NOT NULL,
    severity TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    action_taken TEXT NOT NULL,
    blocked INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_threats_ip ON threats(ip);
CREATE INDEX IF NOT EXISTS idx_threats_timestamp ON threats(timestamp);

CREATE TABLE IF NOT EXISTS enforcement (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ip TEXT NOT NULL,
    action TEXT NOT NULL,
    reason TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    upto_threat_id INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_enforcement_ip ON enforcement(ip);
"#;

/// Highest threat id covered by the latest unblock of `?1`.
const UNBLOCK_WATERMARK_SQL: &str = "SELECT COALESCE(MAX(upto_threat_id), 0) FROM enforcement \
     WHERE ip = ?1 AND action = 'unblock'";

const BLOCKED_IPS_SQL: &str = "SELECT DISTINCT t.ip FROM threats t \
     WHERE t.blocked = 1 AND t.id > COALESCE( \
         (SELECT MAX(e.upto_threat_id) FROM enforcement e \
          WHERE e.ip = t.ip AND e.action = 'unblock'), 0)";

const RECORD_COLUMNS: &str = "id, ip, port, service, severity, timestamp, action_taken, blocked";

/// Default number of records returned in [`ThreatSummary::recent_threats`].
pub const DEFAULT_RECENT_LIMIT: usize = 10;

/// Thread-safe handle to the ledger. Clones share the same connection.
#[derive(Clone, Debug)]
pub struct ThreatLedger {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    conn: Mutex<Connection>,
    blocked: RwLock<BTreeSet<IpAddr>>,
}

impl ThreatLedger {
    /// Open or create the ledger at `path`. Fails fast if the store is unusable.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let path_display = path.as_ref().display().to_string();
        let init_err = |source| LedgerError::Init {
            path: path_display.clone(),
            source,
        };

        let conn = Connection::open(path.as_ref()).map_err(init_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(init_err)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(init_err)?;

        let ledger = Self::from_connection(conn).map_err(|e| match e {
            LedgerError::Storage(source) => init_err(source),
            other => other,
        })?;
        info!(
            path = %path_display,
            blocked = ledger.inner.blocked.read().len(),
            "threat ledger opened"
        );
        Ok(ledger)
    }

    /// Open a private in-memory ledger (tests, dry runs).
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory().map_err(|source| LedgerError::Init {
            path: ":memory:".into(),
            source,
        })?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(SCHEMA)?;
        let blocked = load_blocked(&conn)?;
        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                blocked: RwLock::new(blocked),
            }),
        })
    }

    /// Run `f` against this ledger on the blocking thread pool.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&ThreatLedger) -> Result<T, LedgerError> + Send + 'static,
        T: Send + 'static,
    {
        let ledger = self.clone();
        tokio::task::spawn_blocking(move || f(&ledger))
            .await
            .map_err(|e| LedgerError::Task(e.to_string()))?
    }

    /// Append one observation and return its id.
    pub fn record(
        &self,
        ip: IpAddr,
        port: u16,
        service: &str,
        severity: Severity,
        info: Option<&str>,
    ) -> Result<i64, LedgerError> {
        let action = match info {
            Some(info) if !info.is_empty() => format!("logged: {info}"),
            _ => "logged".to_string(),
        };
        let conn = self.inner.conn.lock();
        conn.execute(
            "INSERT INTO threats (ip, port, service, severity, timestamp, action_taken, blocked)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![
                ip.to_string(),
                port,
                service,
                severity.as_str(),
                unix_nanos(OffsetDateTime::now_utc()),
                action
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, %ip, port, %severity, "threat recorded");
        Ok(id)
    }

    /// Aggregate counts and the `recent_limit` newest records, read in one snapshot.
    pub fn summarize(&self, recent_limit: usize) -> Result<ThreatSummary, LedgerError> {
        let conn = self.inner.conn.lock();

        let mut severity_counts: BTreeMap<Severity, u64> =
            Severity::ALL.iter().map(|s| (*s, 0)).collect();
        let mut stmt = conn.prepare("SELECT severity, COUNT(*) FROM threats GROUP BY severity")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (severity, count) = row?;
            let severity = severity.parse::<Severity>().map_err(LedgerError::Corrupt)?;
            severity_counts.insert(severity, count.max(0) as u64);
        }

        let blocked_ips: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM ({BLOCKED_IPS_SQL})"),
            [],
            |row| row.get(0),
        )?;

        let limit = i64::try_from(recent_limit).unwrap_or(i64::MAX);
        let recent_threats = query_records(
            &conn,
            &format!("SELECT {RECORD_COLUMNS} FROM threats ORDER BY timestamp DESC, id DESC LIMIT ?1"),
            params![limit],
        )?;

        Ok(ThreatSummary {
            severity_counts,
            blocked_ips: blocked_ips.max(0) as u64,
            recent_threats,
        })
    }

    /// Snapshot of the blocked set.
    pub fn query_blocked(&self) -> BTreeSet<IpAddr> {
        self.inner.blocked.read().clone()
    }

    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.inner.blocked.read().contains(&ip)
    }

    /// Recompute the blocked set from persisted rows, bypassing the cache.
    pub fn blocked_from_store(&self) -> Result<BTreeSet<IpAddr>, LedgerError> {
        let conn = self.inner.conn.lock();
        load_blocked(&conn)
    }

    /// Whether `ip` has an unblocked observation newer than its last unblock.
    pub fn has_pending_observation(&self, ip: IpAddr) -> Result<bool, LedgerError> {
        let conn = self.inner.conn.lock();
        let ip_s = ip.to_string();
        let watermark: i64 = conn.query_row(UNBLOCK_WATERMARK_SQL, [&ip_s], |row| row.get(0))?;
        let pending: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM threats WHERE ip = ?1 AND blocked = 0 AND id > ?2)",
            params![ip_s, watermark],
            |row| row.get(0),
        )?;
        Ok(pending)
    }

    /// Flip `blocked` on every pending record of `ip` and audit the block.
    ///
    /// Returns `false` without writing anything when no record was pending.
    pub fn mark_blocked(&self, ip: IpAddr, reason: &str) -> Result<bool, LedgerError> {
        let mut conn = self.inner.conn.lock();
        let tx = conn.transaction()?;
        let ip_s = ip.to_string();

        let watermark: i64 = tx.query_row(UNBLOCK_WATERMARK_SQL, [&ip_s], |row| row.get(0))?;
        let changed = tx.execute(
            "UPDATE threats SET blocked = 1 WHERE ip = ?1 AND blocked = 0 AND id > ?2",
            params![ip_s, watermark],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        let upto = max_threat_id(&tx, &ip_s)?;
        insert_event(&tx, &ip_s, EnforcementAction::Block, reason, upto)?;
        tx.commit()?;

        self.inner.blocked.write().insert(ip);
        debug!(%ip, records = changed, "ledger marked blocked");
        Ok(true)
    }

    /// Record an unblock of `ip`. Returns `false` if it was not blocked.
    pub fn mark_unblocked(&self, ip: IpAddr, reason: &str) -> Result<bool, LedgerError> {
        let mut conn = self.inner.conn.lock();
        let tx = conn.transaction()?;
        let ip_s = ip.to_string();

        if !blocked_in_store(&tx, &ip_s)? {
            return Ok(false);
        }
        let upto = max_threat_id(&tx, &ip_s)?;
        insert_event(&tx, &ip_s, EnforcementAction::Unblock, reason, upto)?;
        tx.commit()?;

        self.inner.blocked.write().remove(&ip);
        debug!(%ip, upto, "ledger marked unblocked");
        Ok(true)
    }

    pub fn record_count(&self) -> Result<u64, LedgerError> {
        let conn = self.inner.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM threats", [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    pub fn get(&self, id: i64) -> Result<Option<ThreatRecord>, LedgerError> {
        let conn = self.inner.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM threats WHERE id = ?1"),
                [id],
                raw_record,
            )
            .optional()?;
        raw.map(RawRecord::into_record).transpose()
    }

    /// All records for `ip`, oldest first.
    pub fn records_for(&self, ip: IpAddr) -> Result<Vec<ThreatRecord>, LedgerError> {
        let conn = self.inner.conn.lock();
        query_records(
            &conn,
            &format!("SELECT {RECORD_COLUMNS} FROM threats WHERE ip = ?1 ORDER BY id ASC"),
            params![ip.to_string()],
        )
    }

    /// Block/unblock audit trail for `ip`, oldest first.
    pub fn enforcement_history(&self, ip: IpAddr) -> Result<Vec<EnforcementEvent>, LedgerError> {
        let conn = self.inner.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, ip, action, reason, timestamp, upto_threat_id
             FROM enforcement WHERE ip = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([ip.to_string()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, ip, action, reason, ts, upto_threat_id) = row?;
            let action = match action.as_str() {
                "block" => EnforcementAction::Block,
                "unblock" => EnforcementAction::Unblock,
                other => return Err(LedgerError::Corrupt(format!("unknown action {other}"))),
            };
            out.push(EnforcementEvent {
                id,
                ip: parse_ip(&ip)?,
                action,
                reason,
                timestamp: from_unix_nanos(ts)?,
                upto_threat_id,
            });
        }
        Ok(out)
    }
}

/// Raw `threats` row, decoded into a [`ThreatRecord`] outside the rusqlite callback.
struct RawRecord {
    id: i64,
    ip: String,
    port: u16,
    service: String,
    severity: String,
    timestamp: i64,
    action_taken: String,
    blocked: bool,
}

impl RawRecord {
    fn into_record(self) -> Result<ThreatRecord, LedgerError> {
        Ok(ThreatRecord {
            id: self.id,
            ip: parse_ip(&self.ip)?,
            port: self.port,
            service: self.service,
            severity: self.severity.parse().map_err(LedgerError::Corrupt)?,
            timestamp: from_unix_nanos(self.timestamp)?,
            action_taken: self.action_taken,
            blocked: self.blocked,
        })
    }
}

fn raw_record(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        id: row.get(0)?,
        ip: row.get(1)?,
        port: row.get(2)?,
        service: row.get(3)?,
        severity: row.get(4)?,
        timestamp: row.get(5)?,
        action_taken: row.get(6)?,
        blocked: row.get(7)?,
    })
}

fn query_records<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<ThreatRecord>, LedgerError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, raw_record)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?.into_record()?);
    }
    Ok(out)
}

fn load_blocked(conn: &Connection) -> Result<BTreeSet<IpAddr>, LedgerError> {
    let mut stmt = conn.prepare(BLOCKED_IPS_SQL)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = BTreeSet::new();
    for row in rows {
        out.insert(parse_ip(&row?)?);
    }
    Ok(out)
}

fn blocked_in_store(conn: &Connection, ip: &str) -> Result<bool, LedgerError> {
    let watermark: i64 = conn.query_row(UNBLOCK_WATERMARK_SQL, [ip], |row| row.get(0))?;
    let blocked: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM threats WHERE ip = ?1 AND blocked = 1 AND id > ?2)",
        params![ip, watermark],
        |row| row.get(0),
    )?;
    Ok(blocked)
}

fn max_threat_id(conn: &Connection, ip: &str) -> Result<i64, LedgerError> {
    let id: i64 = conn.query_row(
        "SELECT COALESCE(MAX(id), 0) FROM threats WHERE ip = ?1",
        [ip],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn insert_event(
    conn: &Connection,
    ip: &str,
    action: EnforcementAction,
    reason: &str,
    upto: i64,
) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO enforcement (ip, action, reason, timestamp, upto_threat_id)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            ip,
            action.as_str(),
            reason,
            unix_nanos(OffsetDateTime::now_utc()),
            upto
        ],
    )?;
    Ok(())
}

fn parse_ip(s: &str) -> Result<IpAddr, LedgerError> {
    s.parse()
        .map_err(|_| LedgerError::Corrupt(format!("invalid ip address {s:?}")))
}

fn unix_nanos(t: OffsetDateTime) -> i64 {
    i64::try_from(t.unix_timestamp_nanos()).unwrap_or(i64::MAX)
}

fn from_unix_nanos(n: i64) -> Result<OffsetDateTime, LedgerError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(n))
        .map_err(|e| LedgerError::Corrupt(format!("invalid timestamp {n}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::thread;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    #[test]
    fn summary_counts_every_record() {
        let ledger = ThreatLedger::open_in_memory().unwrap();
        ledger.record(ip(100), 22, "SSH", Severity::High, None).unwrap();
        ledger.record(ip(101), 80, "HTTP", Severity::Medium, None).unwrap();
        ledger.record(ip(101), 8081, "Unknown-8081", Severity::Low, Some("probe")).unwrap();

        let summary = ledger.summarize(DEFAULT_RECENT_LIMIT).unwrap();
        assert_eq!(summary.count(Severity::High), 1);
        assert_eq!(summary.count(Severity::Medium), 1);
        assert_eq!(summary.count(Severity::Low), 1);
        assert_eq!(summary.total(), 3);
        assert_eq!(summary.blocked_ips, 0);
        assert_eq!(summary.recent_threats[0].action_taken, "logged: probe");
    }

    #[test]
    fn empty_summary_reports_all_severities() {
        let ledger = ThreatLedger::open_in_memory().unwrap();
        let summary = ledger.summarize(5).unwrap();
        assert_eq!(summary.severity_counts.len(), 3);
        assert_eq!(summary.total(), 0);
        assert!(summary.recent_threats.is_empty());
    }

    #[test]
    fn recent_threats_are_newest_first_and_limited() {
        let ledger = ThreatLedger::open_in_memory().unwrap();
        let ids: Vec<i64> = (1..=6u16)
            .map(|p| ledger.record(ip(1), p, "svc", Severity::Low, None).unwrap())
            .collect();

        let summary = ledger.summarize(4).unwrap();
        let got: Vec<i64> = summary.recent_threats.iter().map(|r| r.id).collect();
        let want: Vec<i64> = ids.iter().rev().take(4).copied().collect();
        assert_eq!(got, want);
    }

    #[test]
    fn concurrent_records_are_all_counted() {
        let ledger = ThreatLedger::open_in_memory().unwrap();
        let handles: Vec<_> = (0..8u8)
            .map(|t| {
                let ledger = ledger.clone();
                thread::spawn(move || {
                    for p in 0..50u16 {
                        ledger.record(ip(t), 1000 + p, "svc", Severity::Low, None).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ledger.record_count().unwrap(), 400);
        assert_eq!(ledger.summarize(1).unwrap().total(), 400);
    }

    #[test]
    fn mark_blocked_flips_once_and_is_idempotent() {
        let ledger = ThreatLedger::open_in_memory().unwrap();
        let id = ledger.record(ip(7), 3389, "RDP", Severity::High, None).unwrap();

        assert!(ledger.mark_blocked(ip(7), "rdp exposed").unwrap());
        assert!(!ledger.mark_blocked(ip(7), "rdp exposed").unwrap());
        assert!(ledger.get(id).unwrap().unwrap().blocked);
        assert_eq!(ledger.query_blocked(), BTreeSet::from([ip(7)]));
        assert_eq!(ledger.summarize(1).unwrap().blocked_ips, 1);
        assert_eq!(ledger.enforcement_history(ip(7)).unwrap().len(), 1);
    }

    #[test]
    fn mark_blocked_without_observation_is_noop() {
        let ledger = ThreatLedger::open_in_memory().unwrap();
        assert!(!ledger.mark_blocked(ip(9), "nothing seen").unwrap());
        assert!(ledger.query_blocked().is_empty());
        assert!(ledger.enforcement_history(ip(9)).unwrap().is_empty());
    }

    #[test]
    fn unblock_sets_watermark_and_new_observation_can_reblock() {
        let ledger = ThreatLedger::open_in_memory().unwrap();
        ledger.record(ip(5), 22, "SSH", Severity::High, None).unwrap();
        ledger.mark_blocked(ip(5), "ssh").unwrap();

        assert!(ledger.mark_unblocked(ip(5), "operator").unwrap());
        assert!(!ledger.mark_unblocked(ip(5), "operator").unwrap());
        assert!(!ledger.is_blocked(ip(5)));
        assert!(!ledger.has_pending_observation(ip(5)).unwrap());
        assert!(!ledger.mark_blocked(ip(5), "stale").unwrap());

        ledger.record(ip(5), 23, "Telnet", Severity::High, None).unwrap();
        assert!(ledger.has_pending_observation(ip(5)).unwrap());
        assert!(ledger.mark_blocked(ip(5), "telnet").unwrap());
        assert!(ledger.is_blocked(ip(5)));
        assert_eq!(ledger.blocked_from_store().unwrap(), ledger.query_blocked());

        let history = ledger.enforcement_history(ip(5)).unwrap();
        let actions: Vec<_> = history.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![EnforcementAction::Block, EnforcementAction::Unblock, EnforcementAction::Block]
        );
    }

    #[test]
    fn blocked_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("threats.db");
        {
            let ledger = ThreatLedger::open(&path).unwrap();
            ledger.record(ip(1), 22, "SSH", Severity::High, None).unwrap();
            ledger.record(ip(2), 5900, "VNC", Severity::High, None).unwrap();
            ledger.mark_blocked(ip(1), "ssh").unwrap();
            ledger.mark_blocked(ip(2), "vnc").unwrap();
            ledger.mark_unblocked(ip(2), "operator").unwrap();
        }
        let ledger = ThreatLedger::open(&path).unwrap();
        assert_eq!(ledger.query_blocked(), BTreeSet::from([ip(1)]));
        assert_eq!(ledger.record_count().unwrap(), 2);
    }

    #[test]
    fn unreachable_store_fails_fast() {
        let err = ThreatLedger::open("/nonexistent-dir/for/sure/threats.db").unwrap_err();
        assert!(matches!(err, LedgerError::Init { .. }));
    }
}

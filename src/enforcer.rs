//! Firewall enforcement: drop traffic from high-risk addresses.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::error::EnforceError;
use crate::ledger::ThreatLedger;

/// Reason recorded for operator-issued unblocks.
pub const OPERATOR_UNBLOCK_REASON: &str = "operator unblock";

/// Mechanism that actually drops traffic from an address.
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Start dropping traffic from `ip`.
    async fn block(&self, ip: IpAddr) -> Result<()>;

    /// Stop dropping traffic from `ip`.
    async fn unblock(&self, ip: IpAddr) -> Result<()>;
}

/// iptables/ip6tables DROP rules inserted at the head of a chain.
#[derive(Debug, Clone)]
pub struct IptablesFirewall {
    chain: String,
    use_sudo: bool,
    v4_binary: PathBuf,
    v6_binary: PathBuf,
}

/// `iptables -C` exit status when the rule does not exist.
const RULE_ABSENT_STATUS: i32 = 1;

impl IptablesFirewall {
    pub fn new(chain: impl Into<String>, use_sudo: bool) -> Self {
        Self {
            chain: chain.into(),
            use_sudo,
            v4_binary: PathBuf::from("iptables"),
            v6_binary: PathBuf::from("ip6tables"),
        }
    }

    /// Use these executables instead of `iptables` / `ip6tables` from `PATH`.
    pub fn with_binaries(mut self, v4: impl Into<PathBuf>, v6: impl Into<PathBuf>) -> Self {
        self.v4_binary = v4.into();
        self.v6_binary = v6.into();
        self
    }

    /// Run one iptables operation against the DROP rule for `ip`.
    async fn run(&self, ip: IpAddr, op: &str) -> Result<std::process::Output> {
        let binary = match ip {
            IpAddr::V4(_) => &self.v4_binary,
            IpAddr::V6(_) => &self.v6_binary,
        };
        let args = rule_args(&self.chain, op, ip);
        let mut cmd = if self.use_sudo {
            let mut c = Command::new("sudo");
            c.arg("-n").arg(binary);
            c
        } else {
            Command::new(binary)
        };
        cmd.args(&args);
        debug!(binary = %binary.display(), ?args, sudo = self.use_sudo, "running firewall command");
        cmd.output()
            .await
            .with_context(|| format!("failed to execute {}", binary.display()))
    }

    /// Only exit status 1 means "no such rule"; anything else non-zero is a failure.
    async fn rule_present(&self, ip: IpAddr) -> Result<bool> {
        let out = self.run(ip, "-C").await?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(RULE_ABSENT_STATUS) => Ok(false),
            _ => bail!(
                "rule check failed ({}): {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ),
        }
    }

    async fn apply(&self, ip: IpAddr, op: &str) -> Result<()> {
        let out = self.run(ip, op).await?;
        if !out.status.success() {
            bail!(
                "{op} failed ({}): {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Firewall for IptablesFirewall {
    async fn block(&self, ip: IpAddr) -> Result<()> {
        if self.rule_present(ip).await? {
            debug!(%ip, chain = %self.chain, "drop rule already present");
            return Ok(());
        }
        self.apply(ip, "-I").await
    }

    async fn unblock(&self, ip: IpAddr) -> Result<()> {
        if !self.rule_present(ip).await? {
            debug!(%ip, chain = %self.chain, "no drop rule to remove");
            return Ok(());
        }
        self.apply(ip, "-D").await
    }
}

fn rule_args(chain: &str, op: &str, ip: IpAddr) -> Vec<String> {
    vec![
        op.to_string(),
        chain.to_string(),
        "-s".to_string(),
        ip.to_string(),
        "-j".to_string(),
        "DROP".to_string(),
    ]
}

/// In-memory firewall for tests and dry runs. Counts every invocation.
#[derive(Debug, Default)]
pub struct MemoryFirewall {
    rules: Mutex<BTreeSet<IpAddr>>,
    block_calls: AtomicUsize,
    unblock_calls: AtomicUsize,
    fail_block: AtomicBool,
    fail_unblock: AtomicBool,
}

impl MemoryFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rules(&self) -> BTreeSet<IpAddr> {
        self.rules.lock().clone()
    }

    pub fn block_calls(&self) -> usize {
        self.block_calls.load(Ordering::SeqCst)
    }

    pub fn unblock_calls(&self) -> usize {
        self.unblock_calls.load(Ordering::SeqCst)
    }

    /// Make subsequent `block` calls fail, as with missing privileges.
    pub fn fail_blocks(&self, fail: bool) {
        self.fail_block.store(fail, Ordering::SeqCst);
    }

    pub fn fail_unblocks(&self, fail: bool) {
        self.fail_unblock.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Firewall for MemoryFirewall {
    async fn block(&self, ip: IpAddr) -> Result<()> {
        self.block_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_block.load(Ordering::SeqCst) {
            bail!("Permission denied (you must be root)");
        }
        self.rules.lock().insert(ip);
        Ok(())
    }

    async fn unblock(&self, ip: IpAddr) -> Result<()> {
        self.unblock_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_unblock.load(Ordering::SeqCst) {
            bail!("Permission denied (you must be root)");
        }
        self.rules.lock().remove(&ip);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockOutcome {
    Blocked,
    AlreadyBlocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnblockOutcome {
    Unblocked,
    NotBlocked,
}

/// Applies firewall changes and keeps the ledger's blocked state in step.
///
/// Either both sides change or neither does: a ledger failure after a
/// successful firewall change reverts the firewall.
#[derive(Clone)]
pub struct Enforcer {
    ledger: ThreatLedger,
    firewall: Arc<dyn Firewall>,
    op_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Enforcer {
    pub fn new(ledger: ThreatLedger, firewall: Arc<dyn Firewall>) -> Self {
        Self {
            ledger,
            firewall,
            op_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn ledger(&self) -> &ThreatLedger {
        &self.ledger
    }

    pub async fn block(&self, ip: IpAddr, reason: &str) -> Result<BlockOutcome, EnforceError> {
        let _guard = self.op_lock.lock().await;

        if self.ledger.is_blocked(ip) {
            info!(%ip, "already blocked");
            return Ok(BlockOutcome::AlreadyBlocked);
        }
        let pending = self
            .ledger
            .blocking(move |l| l.has_pending_observation(ip))
            .await
            .map_err(|source| EnforceError::Ledger { ip, source })?;
        if !pending {
            warn!(%ip, reason, "refusing to block address with no pending observation");
            return Err(EnforceError::NoObservation(ip));
        }

        if let Err(e) = self.firewall.block(ip).await {
            error!(%ip, reason, error = %format!("{e:#}"), "BLOCK_FAILED");
            return Err(EnforceError::Firewall {
                action: "block",
                ip,
                reason: format!("{e:#}"),
            });
        }

        let owned_reason = reason.to_string();
        let marked = self
            .ledger
            .blocking(move |l| l.mark_blocked(ip, &owned_reason))
            .await;
        match marked {
            Ok(true) => {
                warn!(%ip, reason, "IP_BLOCKED");
                Ok(BlockOutcome::Blocked)
            }
            Ok(false) => {
                self.revert_block(ip).await;
                Err(EnforceError::NoObservation(ip))
            }
            Err(source) => {
                error!(%ip, error = %source, "ledger update failed after block, reverting firewall");
                self.revert_block(ip).await;
                Err(EnforceError::Ledger { ip, source })
            }
        }
    }

    pub async fn unblock(&self, ip: IpAddr) -> Result<UnblockOutcome, EnforceError> {
        let _guard = self.op_lock.lock().await;

        if !self.ledger.is_blocked(ip) {
            info!(%ip, "not blocked, nothing to undo");
            return Ok(UnblockOutcome::NotBlocked);
        }

        if let Err(e) = self.firewall.unblock(ip).await {
            error!(%ip, error = %format!("{e:#}"), "UNBLOCK_FAILED");
            return Err(EnforceError::Firewall {
                action: "unblock",
                ip,
                reason: format!("{e:#}"),
            });
        }

        let marked = self
            .ledger
            .blocking(move |l| l.mark_unblocked(ip, OPERATOR_UNBLOCK_REASON))
            .await;
        match marked {
            Ok(_) => {
                info!(%ip, "IP_UNBLOCKED");
                Ok(UnblockOutcome::Unblocked)
            }
            Err(source) => {
                error!(%ip, error = %source, "ledger update failed after unblock, restoring firewall rule");
                if let Err(e) = self.firewall.block(ip).await {
                    error!(%ip, error = %format!("{e:#}"), "failed to restore drop rule; firewall and ledger disagree");
                }
                Err(EnforceError::Ledger { ip, source })
            }
        }
    }

    /// Re-apply drop rules for every address the ledger holds blocked.
    ///
    /// Firewall rules do not survive a reboot; the ledger does. Returns the
    /// number of addresses successfully re-applied.
    pub async fn restore(&self) -> usize {
        let _guard = self.op_lock.lock().await;
        let mut applied = 0;
        for ip in self.ledger.query_blocked() {
            match self.firewall.block(ip).await {
                Ok(()) => applied += 1,
                Err(e) => error!(%ip, error = %format!("{e:#}"), "failed to restore drop rule"),
            }
        }
        info!(applied, "restored firewall rules from ledger");
        applied
    }

    async fn revert_block(&self, ip: IpAddr) {
        if let Err(e) = self.firewall.unblock(ip).await {
            error!(%ip, error = %format!("{e:#}"), "failed to revert drop rule; firewall and ledger disagree");
        }
    }
}

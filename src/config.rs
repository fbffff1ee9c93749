use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::enforcer::{Enforcer, Firewall, IptablesFirewall, MemoryFirewall};
use crate::handler::ThreatHandler;
use crate::ledger::{ThreatLedger, DEFAULT_RECENT_LIMIT};
use crate::scanner::{PortProbe, ScanOptions};

/// Locations searched when no `--config` is given, first match wins.
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["/etc/portwarden/config.toml", "portwarden.toml"];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub scan: ScanSettings,
    pub ledger: LedgerSettings,
    pub enforcer: EnforcerSettings,
    pub monitor: MonitorSettings,
    pub server: ServerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScanSettings {
    pub workers: usize,
    pub timeout_ms: u64,
    /// Overall scan deadline; 0 disables it.
    pub scan_timeout_secs: u64,
    /// Optional ports file; the privileged range is scanned when unset.
    pub ports_file: Option<PathBuf>,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            workers: 100,
            timeout_ms: 1000,
            scan_timeout_secs: 0,
            ports_file: None,
        }
    }
}

impl ScanSettings {
    pub fn options(&self) -> ScanOptions {
        ScanOptions {
            workers: self.workers.max(1),
            connect_timeout: Duration::from_millis(self.timeout_ms.max(1)),
            scan_timeout: (self.scan_timeout_secs > 0)
                .then(|| Duration::from_secs(self.scan_timeout_secs)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LedgerSettings {
    pub db_path: PathBuf,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/portwarden/threats.db"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FirewallBackend {
    Iptables,
    /// Keep rules in memory only; nothing touches the host firewall.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnforcerSettings {
    pub backend: FirewallBackend,
    pub chain: String,
    pub use_sudo: bool,
    /// Re-apply ledger blocks to the firewall at startup.
    pub restore_on_start: bool,
}

impl Default for EnforcerSettings {
    fn default() -> Self {
        Self {
            backend: FirewallBackend::Iptables,
            chain: "INPUT".to_string(),
            use_sudo: false,
            restore_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorSettings {
    pub interval_secs: u64,
    pub recent_limit: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_secs: 2,
            recent_limit: DEFAULT_RECENT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).with_context(|| {
            format!("failed to read config file: {}", path.as_ref().display())
        })?;
        Self::from_toml(&content)
            .with_context(|| format!("failed to parse config file: {}", path.as_ref().display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Open the on-disk ledger at `ledger.db_path`, creating its directory.
    pub fn open_ledger(&self) -> Result<ThreatLedger> {
        let path = &self.ledger.db_path;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create ledger directory {}", parent.display())
            })?;
        }
        ThreatLedger::open(path)
            .with_context(|| format!("cannot use threat ledger {}", path.display()))
    }

    /// Wire ledger, firewall and probe into a pipeline.
    ///
    /// The memory backend keeps the ledger in memory too and never restores:
    /// blocks recorded without a real firewall must not reach the on-disk
    /// ledger, where a later iptables run would enforce them.
    pub async fn build_handler(&self) -> Result<ThreatHandler> {
        let (ledger, firewall): (ThreatLedger, Arc<dyn Firewall>) = match self.enforcer.backend {
            FirewallBackend::Iptables => (
                self.open_ledger()?,
                Arc::new(IptablesFirewall::new(
                    self.enforcer.chain.clone(),
                    self.enforcer.use_sudo,
                )),
            ),
            FirewallBackend::Memory => {
                warn!("dry run: firewall rules and threat records are kept in memory only");
                (ThreatLedger::open_in_memory()?, Arc::new(MemoryFirewall::new()))
            }
        };
        let enforcer = Enforcer::new(ledger, firewall);
        if self.enforcer.restore_on_start && self.enforcer.backend == FirewallBackend::Iptables {
            enforcer.restore().await;
        }
        Ok(ThreatHandler::new(PortProbe::new(self.scan.options()), enforcer))
    }

    /// Load `explicit` if given, else the first existing default location, else defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        for path in DEFAULT_CONFIG_PATHS.iter().map(Path::new) {
            if path.exists() {
                return Self::load(path);
            }
        }
        Ok(Self::default())
    }
}

//! Error types for the portwarden library.

use std::net::IpAddr;

use thiserror::Error;

/// Errors raised by the threat ledger.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// The backing store could not be opened or its schema created.
    #[error("failed to initialize threat ledger at {path}: {source}")]
    Init {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    /// A read or write against the store failed.
    #[error("threat ledger storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A persisted row could not be decoded.
    #[error("corrupt threat ledger row: {0}")]
    Corrupt(String),

    /// The blocking task running a ledger call panicked or was cancelled.
    #[error("threat ledger task failed: {0}")]
    Task(String),
}

/// Errors raised while applying or reversing a block.
#[derive(Error, Debug)]
pub enum EnforceError {
    /// The firewall mechanism refused or failed the change.
    #[error("firewall {action} failed for {ip}: {reason}")]
    Firewall {
        action: &'static str,
        ip: IpAddr,
        reason: String,
    },

    /// The ledger could not be read or updated; any firewall change was rolled back.
    #[error("ledger update failed for {ip}: {source}")]
    Ledger {
        ip: IpAddr,
        #[source]
        source: LedgerError,
    },

    /// Block requested for an address with no pending observation in the ledger.
    #[error("no unblocked observation recorded for {0}")]
    NoObservation(IpAddr),
}

/// Errors that stop a scan from starting.
#[derive(Error, Debug)]
pub enum ScanError {
    /// The target host name did not resolve to any address.
    #[error("failed to resolve target {target}: {reason}")]
    Resolve { target: String, reason: String },

    /// The port set was empty.
    #[error("no ports to scan")]
    EmptyPortSet,
}

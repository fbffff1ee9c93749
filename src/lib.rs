//! Library crate for portwarden: concurrent TCP port probing, threat
//! classification, a durable threat ledger and firewall enforcement.
pub mod classifier;
pub mod config;
pub mod enforcer;
pub mod error;
pub mod handler;
pub mod ledger;
pub mod monitor;
pub mod ports;
pub mod scanner;
pub mod server;
pub mod types;

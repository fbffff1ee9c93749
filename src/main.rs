use std::fs::File;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use portwarden::config::{FirewallBackend, Settings};
use portwarden::enforcer::UnblockOutcome;
use portwarden::handler::ScanOutcome;
use portwarden::monitor::{render_summary, Monitor};
use portwarden::scanner::{ScanProgress, ScanTarget};
use portwarden::server::{self, AppState};
use portwarden::{ports, types::ThreatSummary};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "portwarden",
    version,
    about = "Probe a host's TCP ports, record every exposed service and block high-risk hosts.",
    long_about = None
)]
struct Cli {
    /// TOML config file. Defaults to /etc/portwarden/config.toml or ./portwarden.toml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Threat ledger database path (overrides the config file).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Keep firewall rules and new threat records in memory; neither the host firewall nor the ledger file changes.
    #[arg(long = "dry-run", global = true, default_value_t = false)]
    dry_run: bool,

    /// Verbose logging (same as RUST_LOG=debug).
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Scan a host, record open ports and block it if high risk.
    Scan {
        /// IP address or host name.
        target: String,

        /// Ports to probe, e.g. `22,80,8000-8100`. Defaults to 1-1024.
        #[arg(long, conflicts_with = "ports_file")]
        ports: Option<String>,

        /// Ports file (one port or range per line, `#` comments).
        #[arg(long = "ports-file")]
        ports_file: Option<PathBuf>,

        /// Concurrent probe workers.
        #[arg(long)]
        workers: Option<usize>,

        /// Per-port connect timeout in milliseconds (at most 1000).
        #[arg(long = "timeout-ms")]
        timeout_ms: Option<u64>,

        /// Write the scan outcome as pretty JSON to this path.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print the threat summary.
    Summary {
        /// Number of recent threats to list.
        #[arg(long)]
        limit: Option<usize>,

        /// Print JSON instead of text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// List currently blocked addresses.
    Blocked,

    /// Remove the firewall block for an address.
    Unblock { ip: IpAddr },

    /// Live threat summary, refreshed until Ctrl+C.
    Monitor {
        #[arg(long = "interval-secs")]
        interval_secs: Option<u64>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Serve the JSON status API.
    Serve {
        /// Listen address, e.g. 127.0.0.1:8080.
        #[arg(long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut settings = Settings::load_or_default(cli.config.as_deref())?;
    if let Some(db) = cli.db.clone() {
        settings.ledger.db_path = db;
    }
    if cli.dry_run {
        settings.enforcer.backend = FirewallBackend::Memory;
    }

    match cli.command {
        Command::Scan {
            target,
            ports,
            ports_file,
            workers,
            timeout_ms,
            output,
        } => {
            if let Some(w) = workers {
                settings.scan.workers = w;
            }
            if let Some(t) = timeout_ms {
                settings.scan.timeout_ms = t;
            }
            let port_list = match (ports, ports_file.or(settings.scan.ports_file.clone())) {
                (Some(spec), _) => ports::parse_port_spec(&spec)?,
                (None, Some(path)) => ports::load_ports_from_path(path)?,
                (None, None) => ports::default_ports(),
            };

            let handler = settings.build_handler().await?;
            let cancel = cancel_on_ctrl_c();
            let outcome = handler
                .scan_and_process(
                    &ScanTarget::new(target),
                    &port_list,
                    cancel,
                    ScanProgress::new(),
                )
                .await?;

            print_outcome_table(&outcome, port_list.len());
            if let Some(path) = output.as_deref() {
                match write_outcome_json(path, &outcome) {
                    Ok(()) => println!("Wrote JSON results to {}", path.display()),
                    Err(e) => eprintln!("Failed to write JSON to {}: {:#}", path.display(), e),
                }
            }
        }

        Command::Summary { limit, json } => {
            let ledger = settings.open_ledger()?;
            let summary = ledger.summarize(limit.unwrap_or(settings.monitor.recent_limit))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", render_summary(&summary, OffsetDateTime::now_utc()));
            }
        }

        Command::Blocked => {
            let ledger = settings.open_ledger()?;
            let blocked = ledger.query_blocked();
            if blocked.is_empty() {
                println!("No blocked addresses.");
            }
            for ip in blocked {
                println!("{ip}");
            }
        }

        Command::Unblock { ip } => {
            let handler = settings.build_handler().await?;
            match handler.enforcer().unblock(ip).await? {
                UnblockOutcome::Unblocked => println!("UNBLOCKED: {ip}"),
                UnblockOutcome::NotBlocked => println!("{ip} was not blocked"),
            }
        }

        Command::Monitor {
            interval_secs,
            limit,
        } => {
            let ledger = settings.open_ledger()?;
            let interval = Duration::from_secs(
                interval_secs.unwrap_or(settings.monitor.interval_secs).max(1),
            );
            let monitor = Monitor::new(
                ledger,
                interval,
                limit.unwrap_or(settings.monitor.recent_limit),
            );
            println!("{}", "=".repeat(60));
            println!("  PORTWARDEN - THREAT MONITOR");
            println!("{}", "=".repeat(60));
            monitor
                .run(cancel_on_ctrl_c(), |summary: &ThreatSummary| {
                    // Clear screen and home the cursor.
                    print!("\x1B[2J\x1B[H");
                    print!("{}", render_summary(summary, OffsetDateTime::now_utc()));
                    println!("Press Ctrl+C to exit");
                })
                .await;
            println!("\nThreat monitoring stopped");
        }

        Command::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| settings.server.bind.clone());
            let handler = settings.build_handler().await?;
            let state = AppState::new(handler, settings.monitor.recent_limit);
            tokio::select! {
                res = server::spawn_server(&bind, state) => res?,
                _ = tokio::signal::ctrl_c() => println!("\nShutting down"),
            }
        }
    }

    Ok(())
}

/// Ctrl+C cancels the returned token.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    cancel
}

fn print_outcome_table(outcome: &ScanOutcome, scanned: usize) {
    let mut svc_w = "service".len();
    for t in &outcome.threats {
        svc_w = svc_w.max(t.service.len());
    }
    let port_w = 5usize;
    let sev_w = "severity".len();

    println!(
        "\n{} ({}): {} open of {} probed{}",
        outcome.target,
        outcome.ip,
        outcome.report.len(),
        scanned,
        if outcome.cancelled { " [cancelled]" } else { "" }
    );
    if outcome.threats.is_empty() {
        println!("No open ports found on {}. All is secure!", outcome.target);
        return;
    }
    println!(
        "{:>port_w$}  {:<svc_w$}  {:<sev_w$}  {}",
        "port",
        "service",
        "severity",
        "enforcement",
        port_w = port_w,
        svc_w = svc_w,
        sev_w = sev_w
    );
    println!(
        "{:-<port_w$}  {:-<svc_w$}  {:-<sev_w$}  {:-<11}",
        "",
        "",
        "",
        "",
        port_w = port_w,
        svc_w = svc_w,
        sev_w = sev_w
    );
    for t in &outcome.threats {
        println!(
            "{:>port_w$}  {:<svc_w$}  {:<sev_w$}  {:?}",
            t.port,
            t.service,
            t.severity.as_str(),
            t.enforcement,
            port_w = port_w,
            svc_w = svc_w,
            sev_w = sev_w
        );
    }
    if outcome.persistence_failures > 0 {
        println!(
            "WARNING: {} observation(s) could not be recorded; the summary undercounts.",
            outcome.persistence_failures
        );
    }
}

fn write_outcome_json(path: &Path, outcome: &ScanOutcome) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, outcome)?;
    Ok(())
}

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llm_audit_ledger::audit::{
    AuditLedger, EventType, ExportFormat, ExportQuery, LedgerSigner, VerificationStatus,
    VerifyOptions,
};
use llm_audit_ledger::config::{loader::write_default_config, AppConfig, DEFAULT_CONFIG_FILE};
use llm_audit_ledger::database::Database;

const EXIT_TAMPERED: u8 = 2;
const EXIT_INCOMPLETE: u8 = 3;

#[derive(Parser)]
#[command(name = "llm-audit-ledger", version, about = "Tamper-evident audit ledger for LLM security events")]
struct Cli {
    /// Configuration file (TOML). Environment variables prefixed LEDGER__ override it.
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify the hash chain and signatures
    Verify {
        #[arg(long)]
        batch_size: Option<usize>,
        /// Stop after this many seconds and report the pass as incomplete
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Export ledger rows for compliance review or SIEM ingestion
    Export {
        /// json, csv or siem (cef)
        #[arg(short, long, default_value = "json")]
        format: ExportFormat,
        /// RFC 3339 lower bound on occurred_at
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// RFC 3339 upper bound on occurred_at
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        #[arg(long)]
        event_type: Option<EventType>,
        #[arg(long)]
        from_sequence: Option<u64>,
        #[arg(long)]
        to_sequence: Option<u64>,
        /// Write to a file instead of stdout
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Delete rows older than the retention window
    Sweep {
        /// Override compliance.retention_days for this run
        #[arg(long)]
        days: Option<i64>,
        /// Only report how many rows are eligible
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the current chain tip
    Head,
    /// Run periodic verification and retention sweeps until interrupted
    Schedule,
    /// Write a starter configuration file
    InitConfig {
        #[arg(value_name = "PATH", default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Logs go to stderr so exports on stdout stay clean
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_audit_ledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    if let Command::InitConfig { path } = &cli.command {
        write_default_config(path)?;
        info!("Wrote default configuration to {:?}", path);
        return Ok(ExitCode::SUCCESS);
    }

    let config = AppConfig::load(cli.config.as_deref())?;
    info!("Configuration loaded");

    let ledger = Arc::new(open_ledger(&config).await?);

    match cli.command {
        Command::Verify {
            batch_size,
            timeout_secs,
        } => {
            let mut options = verify_options(&config)
                .with_batch_size(batch_size.unwrap_or(config.scheduler.verify_batch_size));
            if let Some(secs) = timeout_secs {
                options = options.with_deadline(Duration::from_secs(secs));
            }

            let report = ledger.verify_with(options).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(match report.status {
                VerificationStatus::Verified => ExitCode::SUCCESS,
                VerificationStatus::TamperDetected => ExitCode::from(EXIT_TAMPERED),
                VerificationStatus::Incomplete | VerificationStatus::Unavailable => {
                    ExitCode::from(EXIT_INCOMPLETE)
                }
            })
        }
        Command::Export {
            format,
            since,
            until,
            event_type,
            from_sequence,
            to_sequence,
            output,
        } => {
            let query = ExportQuery {
                since,
                until,
                event_type,
                from_sequence,
                to_sequence,
            };
            let rendered = ledger.export(format, &query).await?;
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("Failed to write export to {:?}", path))?;
                    info!("Export written to {:?}", path);
                }
                None => println!("{}", rendered),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Sweep { dry_run: true, .. } => {
            let pending = ledger.pending_sweep().await?;
            println!(
                "{}",
                serde_json::json!({
                    "retentionDays": ledger.settings().retention_days,
                    "eligibleCount": pending,
                })
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Sweep { days, .. } => {
            let report = match days {
                Some(days) => ledger.sweep_with_window(days).await?,
                None => ledger.sweep().await?,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Head => {
            let head = ledger.head().await;
            println!("{}", serde_json::to_string_pretty(&head)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Schedule => {
            schedule(ledger, &config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::InitConfig { .. } => Ok(ExitCode::SUCCESS),
    }
}

async fn open_ledger(config: &AppConfig) -> Result<AuditLedger> {
    let database = Database::new(&config.database_url).await?;
    info!("Database connected");

    database.run_migrations().await?;
    info!("Database migrations completed");

    let signer = config.signing_key()?.map(LedgerSigner::new);
    let ledger = AuditLedger::open(
        Arc::new(database),
        config.compliance.clone(),
        signer,
        config.export.clone(),
    )
    .await?;
    Ok(ledger)
}

fn verify_options(config: &AppConfig) -> VerifyOptions {
    let options = VerifyOptions::default().with_batch_size(config.scheduler.verify_batch_size);
    match config.scheduler.verify_timeout_secs {
        0 => options,
        secs => options.with_deadline(Duration::from_secs(secs)),
    }
}

async fn schedule(ledger: Arc<AuditLedger>, config: &AppConfig) -> Result<()> {
    let shutdown = CancellationToken::new();

    // Periodic verification task
    if config.compliance.verification_enabled {
        let ledger = ledger.clone();
        let shutdown = shutdown.clone();
        let options = verify_options(config);
        let verify_interval = Duration::from_secs(config.scheduler.verify_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(verify_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let report = ledger
                    .verify_with(options.clone().with_cancel(shutdown.child_token()))
                    .await;
                match report.status {
                    VerificationStatus::Verified => info!("{}", report.summary()),
                    VerificationStatus::TamperDetected => error!("{}", report.summary()),
                    _ => warn!("{}", report.summary()),
                }
            }
        });
        info!("Scheduled verification every {:?}", verify_interval);
    } else {
        info!("Scheduled verification disabled by compliance.verification_enabled");
    }

    // Retention sweep task
    {
        let ledger = ledger.clone();
        let shutdown = shutdown.clone();
        let sweep_interval = Duration::from_secs(config.scheduler.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match ledger.sweep().await {
                    Ok(report) => info!(
                        "Retention sweep removed {} of {} entries",
                        report.deleted_count, report.total_entries
                    ),
                    Err(e) => error!("Retention sweep failed: {}", e),
                }
            }
        });
        info!("Scheduled retention sweeps every {:?}", sweep_interval);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down scheduler");
    shutdown.cancel();
    Ok(())
}

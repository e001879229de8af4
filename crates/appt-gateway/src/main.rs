//! appt-gateway: Appointment Gateway Main Binary
//!
//! Main entry point for the appointment gateway.
//!
//! Usage:
//!   appt-gateway                   - Start interactive CLI mode
//!   appt-gateway --ingest "<text>" - Add one appointment and exit
//!   appt-gateway --mail <file>     - File one business mail and exit
//!   appt-gateway --help            - Show help

mod cli;
mod error;
mod service;

use std::path::PathBuf;
use std::sync::Arc;

use appt_calendar::open_store;
use appt_core::{ClaudeClient, Config, StoreKind, TextGenerator};
use appt_email::MailIngestor;
use appt_extract::Extractor;
use appt_sync::Deduplicator;
use service::{spawn_report_logger, AppointmentService};
use tracing_subscriber::EnvFilter;

/// Run mode
#[derive(Debug, PartialEq)]
enum RunMode {
    /// Interactive CLI mode
    Cli,
    /// Add a single appointment from text
    Ingest(String),
    /// File a single business mail
    Mail(PathBuf),
    /// Show help
    Help,
    /// Show version
    Version,
}

/// Parsed command line
#[derive(Debug, PartialEq)]
struct Args {
    mode: RunMode,
    user: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1))?;

    match args.mode {
        RunMode::Help => {
            print_help();
            return Ok(());
        }
        RunMode::Version => {
            println!("appt-gateway {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    // Load .env file
    dotenvy::dotenv().ok();

    let config = Config::load().map_err(|e| anyhow::anyhow!("Config error: {}", e))?;

    tracing::info!("Starting appt-gateway...");
    tracing::info!(model = %config.llm.model, users = config.users.len(), "Configuration loaded");

    let user_id = match args.user {
        Some(user) => user,
        None => config
            .users
            .first()
            .map(|u| u.id.clone())
            .ok_or_else(|| anyhow::anyhow!("No users configured"))?,
    };

    let generator: Arc<dyn TextGenerator> = Arc::new(
        ClaudeClient::new(&config.llm)
            .map_err(|e| anyhow::anyhow!("Failed to create LLM client: {}", e))?,
    );

    match args.mode {
        RunMode::Mail(path) => run_mail(&config, generator, &user_id, &path).await,
        RunMode::Ingest(text) => {
            let (service, reports) = AppointmentService::from_config(&config, generator)?;
            let logger = spawn_report_logger(reports);
            let result = cli::run_ingest(&service, &user_id, &text).await;
            shutdown(service, logger).await;
            result
        }
        RunMode::Cli => {
            tracing::info!("Running in CLI mode");
            let (service, reports) = AppointmentService::from_config(&config, generator)?;
            let logger = spawn_report_logger(reports);
            let result = cli::run_cli(&service, &user_id).await;
            shutdown(service, logger).await;
            result
        }
        RunMode::Help | RunMode::Version => Ok(()),
    }
}

/// File one business mail into the business store
async fn run_mail(
    config: &Config,
    generator: Arc<dyn TextGenerator>,
    user_id: &str,
    path: &std::path::Path,
) -> anyhow::Result<()> {
    let context = config.user_context(user_id)?;
    let business = open_store(&config.stores.business, "business", StoreKind::Business)?;
    let extractor = Extractor::from_config(generator, &config.extraction, config.llm.timeout());
    let ingestor = MailIngestor::new(extractor, business, context.timezone)
        .with_dedup(Deduplicator::from_config(&config.dedup));

    cli::run_mail(&ingestor, path).await
}

/// Stop accepting sync work and let the report logger drain
async fn shutdown(service: AppointmentService, logger: tokio::task::JoinHandle<()>) {
    service.dispatcher().shutdown();
    drop(service);
    if let Err(e) = logger.await {
        tracing::warn!("Report logger ended abnormally: {}", e);
    }
    tracing::info!("Shutdown complete");
}

/// Parse command line arguments
fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let mut mode = RunMode::Cli;
    let mut user = None;
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => mode = RunMode::Help,
            "--version" | "-v" => mode = RunMode::Version,
            "--cli" | "-c" => mode = RunMode::Cli,
            "--ingest" | "-i" => {
                let text = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--ingest needs the appointment text"))?;
                mode = RunMode::Ingest(text);
            }
            "--mail" | "-m" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--mail needs a message file"))?;
                mode = RunMode::Mail(PathBuf::from(path));
            }
            "--user" | "-u" => {
                user = Some(
                    args.next()
                        .ok_or_else(|| anyhow::anyhow!("--user needs a user id"))?,
                );
            }
            other => return Err(anyhow::anyhow!("Unknown argument: {}", other)),
        }
        if matches!(mode, RunMode::Help | RunMode::Version) {
            break;
        }
    }

    Ok(Args { mode, user })
}

/// Print help message
fn print_help() {
    println!("appt-gateway - Natural-language appointments with a shared partner calendar");
    println!();
    println!("Usage:");
    println!("  appt-gateway                    Start interactive CLI mode");
    println!("  appt-gateway --ingest \"<text>\"  Add one appointment and exit");
    println!("  appt-gateway --mail <file>      File one business mail (.eml) and exit");
    println!("  appt-gateway --user <id>        Act as this configured user");
    println!("  appt-gateway --help             Show this help message");
    println!("  appt-gateway --version          Show version");
    println!();
    println!("Configuration is read from ./appt-gateway.toml when present.");
    println!();
    println!("Environment Variables:");
    println!("  LLM_API_KEY                  API key (required)");
    println!("  LLM_MODEL                    Model name");
    println!("  LLM_PROVIDER                 Provider: claude or openai (default: claude)");
    println!("  LLM_BASE_URL                 Custom API endpoint");
    println!("  LLM_TIMEOUT_SECS             Extraction timeout in seconds");
    println!("  APPT_USER_ID                 User id when no config file is used");
    println!("  APPT_TIMEZONE                IANA timezone of that user");
    println!("  SHARED_STORE_PATH            SQLite file for the shared calendar");
    println!("  BUSINESS_STORE_PATH          SQLite file for the business calendar");
    println!("  EXTRACTION_CONFIDENCE_FLOOR  Minimum confidence to accept an extraction");
    println!("  DEDUP_TOLERANCE_MINUTES      Start-time tolerance for duplicates");
    println!("  SYNC_MAX_ATTEMPTS            Attempts per sync task");
    println!("  SYNC_CONCURRENCY             Sync tasks run at once");
    println!("  RUST_LOG                     Log filter (default: info)");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> anyhow::Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_default_mode_is_cli() {
        let parsed = args(&[]).unwrap();
        assert_eq!(parsed.mode, RunMode::Cli);
        assert_eq!(parsed.user, None);
    }

    #[test]
    fn test_ingest_with_user() {
        let parsed = args(&["--user", "bob", "--ingest", "dentist friday 10am"]).unwrap();
        assert_eq!(parsed.mode, RunMode::Ingest("dentist friday 10am".to_string()));
        assert_eq!(parsed.user.as_deref(), Some("bob"));
    }

    #[test]
    fn test_mail_path() {
        let parsed = args(&["-m", "inbox/confirm.eml"]).unwrap();
        assert_eq!(parsed.mode, RunMode::Mail(PathBuf::from("inbox/confirm.eml")));
    }

    #[test]
    fn test_help_wins() {
        assert_eq!(args(&["--help", "--bogus"]).unwrap().mode, RunMode::Help);
    }

    #[test]
    fn test_missing_values_and_unknown_flags() {
        assert!(args(&["--ingest"]).is_err());
        assert!(args(&["--user"]).is_err());
        assert!(args(&["--frobnicate"]).is_err());
    }
}

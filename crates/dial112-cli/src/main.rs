use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use dial112_core::config::{Config, LoggingConfig};
use dial112_core::recording_store::RecordingStore;
use dial112_gateway::GatewayState;
use dial112_services::Collaborators;

#[derive(Parser)]
#[command(
    name = "dial112",
    about = "Voice gateway for emergency calls: telephony media streams in, spoken replies out",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to listen on (default: 8000)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Stored conversation records
    Recordings {
        #[command(subcommand)]
        action: RecordingsAction,
    },

    /// Show gateway status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Check the configuration for problems
    Validate,
}

#[derive(Subcommand)]
enum RecordingsAction {
    /// List stored conversations, newest first
    List,
    /// Print one conversation record
    Show { call_id: String },
}

/// Filter directives: base level, then per-crate overrides.
fn filter_directives(logging: Option<&LoggingConfig>, verbose: bool) -> String {
    let level = if verbose {
        "debug".to_string()
    } else {
        logging
            .and_then(|l| l.level.clone())
            .unwrap_or_else(|| "info".to_string())
    };
    let mut directives = vec![level];
    if let Some(logging) = logging {
        directives.extend(logging.filters.iter().cloned());
    }
    directives.join(",")
}

/// Install the global subscriber. `RUST_LOG` wins over the config file.
fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(logging, verbose)));

    let to_stdout = logging.is_some_and(|l| l.output == "stdout");
    let writer = if to_stdout {
        BoxMakeWriter::new(std::io::stdout)
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    if logging.is_some_and(|l| l.format == "json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)?;

    init_logging(config.logging.as_ref(), cli.verbose);

    match cli.command {
        Commands::Serve { port } => serve(config, port).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("Config OK: {}", config_path.display());
            }
        },
        Commands::Recordings { action } => {
            let store = RecordingStore::new(config.recordings_dir());
            match action {
                RecordingsAction::List => {
                    let summaries = store.list().await?;
                    if summaries.is_empty() {
                        println!("No recordings in {}", store.base().display());
                    }
                    for s in summaries {
                        println!(
                            "{}  {}  {:>6.1}s  {:>3} entries  {}",
                            s.call_id,
                            s.start_time.format("%Y-%m-%d %H:%M:%S"),
                            s.duration_seconds,
                            s.conversation_entries,
                            s.ticket_id.as_deref().unwrap_or("-"),
                        );
                    }
                }
                RecordingsAction::Show { call_id } => match store.load(&call_id).await? {
                    Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                    None => anyhow::bail!("No recording for call {call_id}"),
                },
            }
        }
        Commands::Status => {
            let port = config.gateway_port();
            println!("Dial 112 v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Recordings: {}", config.recordings_dir().display());
            println!("Gateway port: {port}");
            match gateway_health(port).await {
                Some(health) => println!(
                    "Status: running ({} active calls)",
                    health["active_calls"].as_u64().unwrap_or(0)
                ),
                None => println!("Status: not running"),
            }
        }
    }

    Ok(())
}

async fn serve(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let (warnings, errors) = config.validate();
    for w in &warnings {
        tracing::warn!("{w}");
    }
    if !errors.is_empty() {
        for e in &errors {
            tracing::error!("{e}");
        }
        anyhow::bail!("invalid configuration");
    }

    let port = port.unwrap_or_else(|| config.gateway_port());
    let collaborators = Collaborators::from_config(&config);
    let state = GatewayState::new(Arc::new(config), collaborators);

    #[cfg(feature = "metrics")]
    let state = state.with_metrics(dial112_gateway::metrics::install_prometheus_recorder()?);

    tracing::info!(
        port,
        recordings = %state.recordings.base().display(),
        "Starting Dial 112 gateway"
    );
    dial112_gateway::start_gateway(Arc::new(state), port).await
}

async fn gateway_health(port: u16) -> Option<serde_json::Value> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(2))
        .build()
        .ok()?;
    let resp = client
        .get(format!("http://127.0.0.1:{port}/health"))
        .send()
        .await
        .ok()?;
    resp.json().await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives() {
        assert_eq!(filter_directives(None, false), "info");
        assert_eq!(filter_directives(None, true), "debug");

        let logging: LoggingConfig = serde_json::from_str(
            r#"{"level": "warn", "filters": ["dial112_gateway=debug", "tower_http=info"]}"#,
        )
        .unwrap();
        assert_eq!(
            filter_directives(Some(&logging), false),
            "warn,dial112_gateway=debug,tower_http=info"
        );
        assert_eq!(
            filter_directives(Some(&logging), true),
            "debug,dial112_gateway=debug,tower_http=info"
        );
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["dial112", "serve", "--port", "9000"]).unwrap();
        assert!(matches!(cli.command, Commands::Serve { port: Some(9000) }));

        let cli = Cli::try_parse_from(["dial112", "-v", "recordings", "show", "MZ1_1"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Recordings { action: RecordingsAction::Show { ref call_id } } if call_id == "MZ1_1"
        ));

        assert!(Cli::try_parse_from(["dial112", "config", "frobnicate"]).is_err());
    }
}

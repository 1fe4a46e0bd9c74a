use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use pitchline_core::archive::{JsonlArchive, SessionArchive};
use pitchline_core::config::{Config, LoggingConfig, StoreBackend};
use pitchline_gateway::{AppState, Services};
use pitchline_media::stt::{AssemblyAiClient, AssemblyAiRealtime};
use pitchline_media::tts::{DeepgramTts, SpeechSynthesizer};
use pitchline_providers::google::GeminiProvider;
use pitchline_providers::supabase::SupabaseArchive;

#[derive(Parser)]
#[command(
    name = "pitchline",
    about = "Realtime mock sales calls: speak to an AI prospect, get scored",
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
    /// Start the HTTP + WebSocket server
    Serve {
        /// Port to listen on (default: 8000)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show configuration summary and whether a server is running
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Check configuration for errors and missing keys
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    init_logging(&config.logging(), cli.verbose);

    match cli.command {
        Commands::Serve { port } => {
            let (warnings, errors) = config.validate();
            for w in &warnings {
                tracing::warn!("{w}");
            }
            if !errors.is_empty() {
                for e in &errors {
                    tracing::error!("{e}");
                }
                anyhow::bail!("Invalid configuration ({} errors)", errors.len());
            }

            let port = port.unwrap_or_else(|| config.port());
            let services = build_services(&config)?;
            #[allow(unused_mut)]
            let mut state = AppState::new(Arc::new(config), services);

            #[cfg(feature = "metrics")]
            {
                state.metrics_handle = Some(pitchline_gateway::metrics::install_prometheus_recorder()?);
            }

            tracing::info!("Starting Pitchline on port {port}");
            pitchline_gateway::start_gateway(Arc::new(state), port).await?;
        }
        Commands::Status => {
            println!("Pitchline v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Port: {}", config.port());
            println!("LLM model: {}", config.llm().model);
            println!("TTS voice: {}", config.tts().model);
            println!("Archive: {}", describe_store(&config));
            println!("Keys:");
            println!("  transcription: {}", key_state(config.transcription().resolve_api_key()));
            println!("  llm: {}", key_state(config.llm().resolve_api_key()));
            println!("  tts: {}", key_state(config.tts().resolve_api_key()));

            match probe_health(config.port()).await {
                Some(body) => println!(
                    "Status: running ({} sessions, {} live streams)",
                    body["sessions"], body["streams"]
                ),
                None => println!("Status: not running"),
            }
        }
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
                println!("Config OK ({} warnings)", warnings.len());
            }
        },
    }

    Ok(())
}

/// Install the tracing subscriber. `RUST_LOG` wins over config; `--verbose`
/// wins over the configured level.
fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose {
            "debug"
        } else {
            logging.level.as_deref().unwrap_or("info")
        };
        let mut directives = vec![level.to_string()];
        directives.extend(logging.filters.iter().cloned());
        EnvFilter::new(directives.join(","))
    });

    let writer = if logging.output == "stdout" {
        BoxMakeWriter::new(std::io::stdout)
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };

    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .init();
    }
}

fn build_services(config: &Config) -> anyhow::Result<Services> {
    let gemini = Arc::new(GeminiProvider::from_config(&config.llm())?);
    let transcription = config.transcription();
    let realtime = config.realtime();

    let speech: Arc<dyn SpeechSynthesizer> = match DeepgramTts::from_config(&config.tts()) {
        Ok(tts) => Arc::new(tts),
        Err(e) => {
            tracing::warn!("{e}; replies will be sent without audio");
            Arc::new(NoSpeech)
        }
    };

    let store = config.store();
    let archive: Arc<dyn SessionArchive> = match store.backend {
        StoreBackend::Jsonl => Arc::new(JsonlArchive::new(store.archive_dir())),
        StoreBackend::Supabase => Arc::new(SupabaseArchive::from_config(&store)?),
    };

    Ok(Services {
        transcriber: Arc::new(AssemblyAiRealtime::from_config(
            &transcription,
            realtime.sample_rate,
        )?),
        batch: Arc::new(AssemblyAiClient::from_config(&transcription)?),
        replies: gemini.clone(),
        coach: gemini,
        speech,
        archive,
    })
}

/// Stand-in when no TTS key is configured.
struct NoSpeech;

#[async_trait]
impl SpeechSynthesizer for NoSpeech {
    async fn synthesize(&self, _text: &str) -> anyhow::Result<Bytes> {
        anyhow::bail!("No TTS API key configured")
    }
}

fn describe_store(config: &Config) -> String {
    let store = config.store();
    match store.backend {
        StoreBackend::Jsonl => format!("jsonl ({})", store.archive_dir().display()),
        StoreBackend::Supabase => format!(
            "supabase ({}, table {})",
            store.url.as_deref().unwrap_or("no url"),
            store.table
        ),
    }
}

fn key_state(key: Option<String>) -> &'static str {
    if key.is_some() { "configured" } else { "missing" }
}

async fn probe_health(port: u16) -> Option<serde_json::Value> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .ok()?;
    let resp = client
        .get(format!("http://127.0.0.1:{port}/health"))
        .send()
        .await
        .ok()?;
    resp.json().await.ok()
}

//! Ragweave CLI: build, query and evaluate a RAG pipeline from the terminal.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Ragweave: a configurable retrieval-augmented generation pipeline
#[derive(Parser, Debug)]
#[command(name = "ragweave", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (holds .ragweave/config.toml)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override a configuration value, e.g. `--set retrieval.top_k=3`
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_override)]
    overrides: Vec<(String, toml::Value)>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Chunk, embed and persist the document directory
    Index,
    /// Answer a question with the configured query engine
    Query {
        question: String,
        /// Query mode: none, hyde, multi
        #[arg(short, long)]
        mode: Option<String>,
        /// Print sources, each cut to this many characters
        #[arg(long, value_name = "CHARS")]
        sources: Option<usize>,
        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show fused retrieval results without synthesis
    Retrieve {
        query: String,
        /// Number of fused results
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// Generate an evaluation test set from the indexed nodes
    Testset {
        /// Output JSON file
        #[arg(short, long, default_value = "testset.json")]
        output: PathBuf,
        /// Number of samples
        #[arg(short = 'n', long, default_value = "5")]
        size: usize,
        /// Shares of simple, reasoning and multi-context questions
        #[arg(long, value_name = "S,R,M", value_delimiter = ',')]
        distribution: Option<Vec<f32>>,
        /// RNG seed for reproducible sampling
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Score fused retrieval against a generated test set
    Evaluate {
        /// Test set JSON file
        testset: PathBuf,
        /// Count any node of the source document as a hit
        #[arg(long)]
        by_document: bool,
        /// Write the full report as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default .ragweave/config.toml into the workspace
    Init,
    /// Print the merged configuration
    Show,
}

/// Parse `key=value`; the value is read as TOML, falling back to a plain string.
fn parse_override(raw: &str) -> Result<(String, toml::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    let value = value.trim();
    let parsed = toml::from_str::<toml::Table>(&format!("v = {}", value))
        .ok()
        .and_then(|mut table| table.remove("v"))
        .unwrap_or_else(|| toml::Value::String(value.to_string()));
    Ok((key.to_string(), parsed))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "ragweave", "ragweave")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "ragweave.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let overrides: Vec<(&str, toml::Value)> = cli
        .overrides
        .iter()
        .map(|(k, v)| (k.as_str(), v.clone()))
        .collect();
    let settings = commands::Settings {
        workspace,
        config_file: cli.config,
        overrides,
    };

    commands::handle_command(cli.command, &settings).await
}

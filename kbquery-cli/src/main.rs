//! kbquery CLI: answer a question against a local JSON corpus.
//!
//! Runs the full retrieval pipeline with the in-process collaborators and
//! prints the synthesis context plus numbered sources.

mod commands;
mod corpus;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// kbquery: retrieval and ranking over private knowledge bases
#[derive(Parser, Debug)]
#[command(name = "kbquery", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (holds `.kbquery/config.toml`)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv)
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
    /// Retrieve and rank evidence for a question
    Ask {
        /// JSON corpus file to index
        #[arg(long)]
        corpus: PathBuf,

        /// Collection to search
        #[arg(long)]
        collection: String,

        /// Maximum number of evidence chunks
        #[arg(long)]
        budget: Option<usize>,

        /// Relevance/diversity trade-off in [0, 1]
        #[arg(long)]
        lambda: Option<f32>,

        /// Print the evidence bundle as JSON
        #[arg(long)]
        json: bool,

        /// The question to answer
        question: String,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
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

    let log_dir = directories::ProjectDirs::from("dev", "kbquery", "kbquery")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "kbquery.log");
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

    commands::handle_command(cli.command, &workspace).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_ask() {
        let cli = Cli::try_parse_from([
            "kbquery",
            "-vv",
            "ask",
            "--corpus",
            "kb.json",
            "--collection",
            "finance",
            "--budget",
            "3",
            "What was Q3 revenue?",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Ask {
                corpus,
                collection,
                budget,
                lambda,
                json,
                question,
            } => {
                assert_eq!(corpus, PathBuf::from("kb.json"));
                assert_eq!(collection, "finance");
                assert_eq!(budget, Some(3));
                assert_eq!(lambda, None);
                assert!(!json);
                assert_eq!(question, "What was Q3 revenue?");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_config_show() {
        let cli = Cli::try_parse_from(["kbquery", "-q", "config", "show"]).unwrap();
        assert!(cli.quiet);
        assert!(matches!(
            cli.command,
            Commands::Config {
                action: ConfigAction::Show
            }
        ));
    }
}

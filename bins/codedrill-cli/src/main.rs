mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "codedrill-cli")]
#[command(about = "CodeDrill CLI - Screen, run and inspect interview problems locally", long_about = None)]
struct Cli {
    /// Settings file (defaults to config/codedrill.json when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Screen a source file against the blocked-capability policy
    Check {
        /// Python source file
        #[arg(short, long)]
        source: PathBuf,
    },

    /// Run a source file against a catalog problem
    Run {
        /// Problem id
        #[arg(short, long)]
        problem: String,

        /// Python source file
        #[arg(short, long)]
        source: PathBuf,

        /// Include hidden fixtures
        #[arg(long, default_value = "false")]
        all: bool,

        /// Print the report as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// List catalog problems
    Problems {
        #[arg(short, long)]
        category: Option<String>,

        #[arg(short, long)]
        difficulty: Option<String>,
    },

    /// Load the catalog and report problem and fixture counts
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = commands::load_settings(cli.config.as_deref())?;

    let success = match cli.command {
        Commands::Check { source } => commands::check_source(&settings, &source)?,
        Commands::Run {
            problem,
            source,
            all,
            json,
        } => commands::run_problem(&settings, &problem, &source, all, json).await?,
        Commands::Problems {
            category,
            difficulty,
        } => {
            commands::list_problems(&settings, category.as_deref(), difficulty.as_deref())?;
            true
        }
        Commands::Validate => commands::validate_catalog(&settings)?,
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

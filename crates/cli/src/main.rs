//! promptloom CLI, the main entry point.
//!
//! Commands:
//! - `render`  Render a template against a context file
//! - `lint`    Validate and compile a template
//! - `batch`   Render a directory of contexts concurrently
//! - `schema`  Print the template JSON Schema

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "promptloom",
    about = "promptloom: budget-aware chat prompt templates",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.promptloom/config.toml)
    #[arg(long, global = true, env = "PROMPTLOOM_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a template to chat messages
    Render {
        #[arg(short, long)]
        template: PathBuf,

        /// JSON context file
        #[arg(short, long)]
        context: PathBuf,

        /// Token budget (overrides max_tokens)
        #[arg(short, long)]
        budget: Option<usize>,

        /// JSON render options (attachment lanes and injections)
        #[arg(short, long)]
        options: Option<PathBuf>,

        /// Print anchors and the render report alongside the messages
        #[arg(long)]
        detailed: bool,
    },

    /// Validate and compile a template
    Lint {
        #[arg(short, long)]
        template: PathBuf,

        /// Allowed data source names (overrides allowed_sources)
        #[arg(short, long, value_delimiter = ',')]
        sources: Option<Vec<String>>,
    },

    /// Render every context file in a directory
    Batch {
        #[arg(short, long)]
        template: PathBuf,

        /// Directory of JSON context files
        #[arg(long)]
        contexts: PathBuf,

        #[arg(short, long)]
        budget: Option<usize>,

        #[arg(short, long)]
        options: Option<PathBuf>,
    },

    /// Print the template JSON Schema
    Schema,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing. Logs go to stderr so stdout stays JSON.
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Schema = cli.command {
        return commands::schema::run();
    }

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Render {
            template,
            context,
            budget,
            options,
            detailed,
        } => commands::render::run(
            commands::render::RenderArgs {
                template: &template,
                context: &context,
                budget,
                options: options.as_deref(),
                detailed,
            },
            &config,
        )?,
        Commands::Lint { template, sources } => commands::lint::run(&template, sources, &config)?,
        Commands::Batch {
            template,
            contexts,
            budget,
            options,
        } => {
            commands::batch::run(&template, &contexts, budget, options.as_deref(), &config).await?
        }
        Commands::Schema => commands::schema::run()?,
    }

    Ok(())
}

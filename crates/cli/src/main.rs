//! Canopy CLI: the main entry point.
//!
//! Commands:
//! - `new`       Start a new conversation tree
//! - `sub`       Branch a subchat off an existing node
//! - `say`       Append a message to a node
//! - `context`   Show the context a node sees
//! - `chat`      Run a full turn against the configured generator
//! - `tree`      Draw the forest
//! - `path`      Show a node's title path
//! - `reindex`   Retry indexing of deferred messages
//! - `config`    Validate or show configuration

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "canopy",
    about = "Canopy: tree-structured conversations with long-range recall",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.canopy/config.toml)
    #[arg(short, long, global = true, env = "CANOPY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new conversation tree
    New {
        title: String,
        /// Buffer capacity for this node
        #[arg(long)]
        max_turns: Option<usize>,
        /// Turns this node contributes to descendants' context
        #[arg(long)]
        context_turns: Option<usize>,
    },

    /// Create a subchat under an existing node
    Sub {
        parent: String,
        title: String,
        #[arg(long)]
        max_turns: Option<usize>,
        #[arg(long)]
        context_turns: Option<usize>,
    },

    /// Append a message to a node
    Say {
        node: String,
        text: String,
        #[arg(short, long, value_enum, default_value_t = RoleArg::User)]
        role: RoleArg,
        /// Explicit logical timestamp
        #[arg(long)]
        at: Option<u64>,
    },

    /// Show the assembled context of a node
    Context {
        node: String,
        /// Only consider what existed at this logical time
        #[arg(long)]
        at: Option<u64>,
        /// Print the payload as JSON
        #[arg(long)]
        json: bool,
    },

    /// Send a message and append the generated reply
    Chat { node: String, text: String },

    /// Draw every tree of the forest
    Tree,

    /// Show the title path of a node
    Path { node: String },

    /// Retry indexing of messages whose embedding failed
    Reindex,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Check the configuration for errors
    Validate,
    /// Print the effective configuration as TOML
    Show,
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    User,
    Assistant,
    System,
}

impl From<RoleArg> for canopy_core::message::Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::User => Self::User,
            RoleArg::Assistant => Self::Assistant,
            RoleArg::System => Self::System,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::New {
            title,
            max_turns,
            context_turns,
        } => commands::node::create(config_path, None, &title, max_turns, context_turns).await?,
        Commands::Sub {
            parent,
            title,
            max_turns,
            context_turns,
        } => {
            commands::node::create(config_path, Some(&parent), &title, max_turns, context_turns)
                .await?
        }
        Commands::Say { node, text, role, at } => {
            commands::message::say(config_path, &node, role.into(), &text, at).await?
        }
        Commands::Context { node, at, json } => {
            commands::message::context(config_path, &node, at, json).await?
        }
        Commands::Chat { node, text } => commands::chat::run(config_path, &node, &text).await?,
        Commands::Tree => commands::node::tree(config_path).await?,
        Commands::Path { node } => commands::node::path(config_path, &node).await?,
        Commands::Reindex => commands::reindex::run(config_path).await?,
        Commands::Config { action } => match action {
            ConfigAction::Validate => commands::config_cmd::validate(config_path)?,
            ConfigAction::Show => commands::config_cmd::show(config_path)?,
        },
    }

    Ok(())
}

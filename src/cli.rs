use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use docchat::config::ConfigOverrides;

#[derive(Debug, Parser)]
#[command(
    name = "docchat",
    about = "Per-user document retrieval for chat assistants"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Override the embedding model ID or local model path
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Disable the vector backend and search by keyword overlap only
    #[arg(long, global = true)]
    pub no_vectors: bool,

    /// Maximum number of user indexes kept in memory
    #[arg(long, global = true)]
    pub max_services: Option<usize>,

    /// Number of recent chunks scanned by keyword search
    #[arg(long, global = true)]
    pub lexical_window: Option<usize>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            max_services: self.max_services,
            lexical_window: self.lexical_window,
            model: self.model.clone(),
            no_vectors: self.no_vectors,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Add a text or markdown document to a user's index
    Ingest(IngestArgs),
    /// Search a user's documents
    Search(SearchArgs),
    /// Show stored documents and index state
    Status(StatusArgs),
    /// Delete a user's documents and index
    Purge(PurgeArgs),
    /// Remove orphaned index files, and optionally inactive users
    Cleanup(CleanupArgs),
    /// Start MCP server for AI agent integration
    Mcp,
    /// Read and change persisted settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Ingest --

#[derive(Debug, Parser)]
pub struct IngestArgs {
    /// Files to ingest (.txt or .md)
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Owner of the documents
    #[arg(short, long)]
    pub user: String,
}

// -- Cleanup --

#[derive(Debug, Parser)]
pub struct CleanupArgs {
    /// Also delete users whose newest document is older than this many days
    #[arg(long, value_name = "DAYS")]
    pub older_than: Option<u64>,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// User whose documents are searched
    #[arg(short, long)]
    pub user: String,

    /// Number of results to return
    #[arg(short = 'n', long, default_value = "5")]
    pub count: usize,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Purge --

#[derive(Debug, Parser)]
pub struct PurgeArgs {
    /// User to delete
    #[arg(short, long)]
    pub user: String,
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print a setting
    Get {
        key: String,
    },
    /// Persist a setting
    Set {
        key: String,
        value: String,
    },
    /// Print every known setting and its stored value
    List,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "docchat",
            &mut std::io::stdout(),
        );
    }
}

//! CLI command definitions and argument parsing.

use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;

use crate::config::ConfigKey;
use crate::store::SortOrder;

#[derive(Parser)]
#[command(name = "pinakes")]
#[command(about = "Personal searchable index of AT Protocol posts you might have seen")]
#[command(version)]
pub struct Cli {
    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage stored configuration
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Crawl the configured account's view of the network
    Backfill {
        /// Traversal depth budget (default 5, auto-reduced for large
        /// follow graphs)
        #[arg(long)]
        depth: Option<u32>,
        /// Compute embeddings while crawling
        #[arg(long)]
        embeddings: bool,
        /// AppView base URL override
        #[arg(long)]
        appview: Option<String>,
    },
    /// Import one repository: a CAR file path, a DID, or a handle
    Import {
        source: String,
        /// Repository DID (required for CAR file imports)
        #[arg(long)]
        did: Option<String>,
        /// Traversal depth budget
        #[arg(long)]
        depth: Option<u32>,
        /// Re-walk records below the stored revision
        #[arg(long)]
        force: bool,
    },
    /// Generate embeddings for posts already in the index
    Embeddings {
        /// Re-embed every post, not only those missing vectors
        #[arg(long)]
        force: bool,
    },
    /// Search the index
    Search {
        query: String,
        /// Rank by vector similarity instead of substring match
        #[arg(long)]
        vector: bool,
        /// Maximum number of results
        #[arg(short, long, default_value = "25")]
        results: usize,
        /// Restrict to posts by this DID or handle (repeatable)
        #[arg(long = "creator")]
        creators: Vec<String>,
        /// Restrict to replies to posts by this DID or handle (repeatable)
        #[arg(long = "parent-author")]
        parent_authors: Vec<String>,
        /// Restrict to threads rooted at posts by this DID or handle
        /// (repeatable)
        #[arg(long = "root-author")]
        root_authors: Vec<String>,
        /// Only posts created before this time (ISO)
        #[arg(long)]
        before: Option<String>,
        /// Only posts created after this time (ISO)
        #[arg(long)]
        after: Option<String>,
        /// Sort order
        #[arg(long, value_enum, default_value_t = OrderArg::Desc)]
        order: OrderArg,
        /// Maximum cosine distance for vector results
        #[arg(long)]
        threshold: Option<f32>,
        /// Match image alt text as well
        #[arg(long = "include-alt")]
        include_alt: bool,
    },
    /// Explain why a post is in the index
    Explain {
        /// at:// URI of the post
        uri: String,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Store a configuration value
    Set {
        #[arg(value_enum)]
        key: ConfigKey,
        value: String,
    },
    /// Print a configuration value
    Get {
        #[arg(value_enum)]
        key: ConfigKey,
    },
    /// Remove a configuration value
    Delete {
        #[arg(value_enum)]
        key: ConfigKey,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OrderArg {
    Asc,
    Desc,
}

impl std::fmt::Display for OrderArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        })
    }
}

impl From<OrderArg> for SortOrder {
    fn from(order: OrderArg) -> Self {
        match order {
            OrderArg::Asc => Self::Asc,
            OrderArg::Desc => Self::Desc,
        }
    }
}

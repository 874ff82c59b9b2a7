use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use file_indexer_core::storage::models::SearchKind;

#[derive(Debug, Parser)]
#[command(name = "file-indexer")]
#[command(about = "Index files by content hash across machines", long_about = None)]
pub struct Cli {
    /// SQLite index to use (overrides `db_path`)
    #[arg(long, global = true)]
    pub db_path: Option<String>,

    /// Log file (overrides `log_path`)
    #[arg(long, global = true)]
    pub log_path: Option<String>,

    /// Machine name recorded on every row (overrides `machine_name`)
    #[arg(long, global = true)]
    pub machine_name: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan one or more files or directories into the index
    Scan {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Hash archives as plain files without indexing their contents
        #[arg(long)]
        no_archives: bool,

        /// Apply the directory skip rules from the ignore file and config
        #[arg(long)]
        ignore_rules: bool,

        /// File-processing threads
        #[arg(long)]
        workers: Option<usize>,

        /// Files per database transaction
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Print index statistics
    Stats,
    /// List content shared by more than one file
    Duplicates {
        /// Ignore content smaller than this many bytes
        #[arg(long, default_value_t = 0)]
        min_size: i64,

        #[arg(long)]
        machine: Option<String>,

        #[arg(long, default_value_t = 1)]
        page: i64,

        #[arg(long, default_value_t = 50)]
        per_page: i64,
    },
    /// Search the index by name, path or digest
    Search {
        query: String,

        #[arg(long, value_enum, default_value_t = SearchBy::Name)]
        by: SearchBy,

        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
    /// Merge other index databases into this one
    Merge {
        #[arg(required = true)]
        sources: Vec<PathBuf>,
    },
    /// Print configuration values
    PrintConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SearchBy {
    Name,
    Path,
    Hash,
}

impl From<SearchBy> for SearchKind {
    fn from(by: SearchBy) -> Self {
        match by {
            SearchBy::Name => SearchKind::Name,
            SearchBy::Path => SearchKind::Path,
            SearchBy::Hash => SearchKind::Hash,
        }
    }
}

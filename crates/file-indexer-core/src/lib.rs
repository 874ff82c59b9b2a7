pub mod archive;
pub mod batch;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod hasher;
pub mod merge;
pub mod progress;
pub mod scanner;
pub mod storage;

pub use config::AppConfig;
pub use engine::{CancelToken, ScanOptions, ScanSummary, Scanner};
pub use error::Error;
pub use merge::{merge_databases, MergeStats};
pub use progress::{CountingObserver, ScanObserver, ScanState, SilentObserver};
pub use storage::Database;

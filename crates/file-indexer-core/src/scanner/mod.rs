mod ignore;
mod walk;

pub use ignore::SkipRules;
pub use walk::{DirectoryWalker, FileTask, WalkCounters, WalkStats};

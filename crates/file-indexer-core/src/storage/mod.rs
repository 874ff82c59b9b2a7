pub mod models;
mod queries;
mod sqlite;

pub use sqlite::Database;
pub(crate) use sqlite::parse_timestamp;

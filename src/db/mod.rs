mod backend;
mod rebuild;
mod retry;
mod sqlite;

#[cfg(test)]
pub mod recording;

pub use backend::{Backend, BackendError, Row};
pub use retry::RetryPolicy;
pub use sqlite::SqliteBackend;

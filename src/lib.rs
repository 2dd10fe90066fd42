//! Idempotent, resumable schema upgrade steps for SQLite databases.
//!
//! A step definition lists its changes per phase. The [`engine`] applies them
//! in a fixed phase order, inspecting the catalog before every operation so
//! that a re-run after a partial failure only performs the remaining work.
//! [`steps`] loads definitions and chains them into version-to-version
//! upgrade paths.

pub mod cli;
pub mod config;
pub mod db;
pub mod ddl;
pub mod engine;
pub mod error;
pub mod steps;
pub mod value;

pub use error::MigrateError;

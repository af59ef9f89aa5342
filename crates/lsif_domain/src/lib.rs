//! Domain model for the LSIF storage and query engine

mod config;
mod index;
mod job;
mod lsp;
mod query;
mod repository;

pub use config::*;
pub use index::*;
pub use job::*;
pub use lsp::*;
pub use query::*;
pub use repository::*;

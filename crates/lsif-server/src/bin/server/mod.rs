pub mod cli;
pub mod service;
pub mod signals;

pub use cli::Args;
pub use service::run_server;

//! LSIF storage and caching engine
//!
//! Accepts uploaded code intelligence dumps, keeps them on disk under a
//! storage budget, hands them to conversion workers through a durable queue
//! and answers hover, definitions and references queries from converted
//! databases held in a size-weighted cache.

pub mod api;
pub mod backend;
pub mod cache;
pub mod database;
pub mod errors;
pub mod logging;
pub mod queue;
pub mod settings;
pub mod sharding;
pub mod store;
pub mod telemetry;

pub use backend::Backend;
pub use cache::{Cached, Disposable, WeightedLruCache};
pub use database::{Database, DatabaseWriter, IndexBuilder};
pub use errors::{LsifError, Result};
pub use logging::{
    LogFormat, LoggingConfig, init_default_logging, init_development_logging,
    init_production_logging,
};
pub use queue::{ConversionQueue, QueueBackend, Scheduler};
pub use settings::load_config;
pub use sharding::hash_key;
pub use store::DiskStore;

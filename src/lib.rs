// src/lib.rs
// Public library surface for the binary, integration tests and embedders.

pub mod aggregate;
pub mod botlog;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod http;
pub mod notify;
pub mod region;
pub mod scheduler;
pub mod sources;
pub mod stats;
pub mod store;
pub mod watch;

// ---- Re-exports for stable public API ----
pub use crate::aggregate::SourceRegistry;
pub use crate::config::BotConfig;
pub use crate::dispatch::{CommandContext, Dispatcher, SeriesReply};
pub use crate::region::Region;
pub use crate::sources::{Refresh, SourceAdapter, SourceCaches, SourceKind};
pub use crate::stats::{NormalizedReading, Series};
pub use crate::watch::{WatchJob, WatchService};

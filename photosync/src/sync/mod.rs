pub mod albums;
pub mod backoff;
pub mod download;
pub mod engine;
pub mod ignore;
pub mod indexer;
pub mod obsolete;
pub mod paths;
pub mod stats;
pub mod store;

pub use engine::{SyncEngine, SyncError, SyncOptions};
pub use stats::{ItemFailure, RunSummary, StoreStats};
pub use store::{IndexStore, ListingKind, MediaStatus, StoreError};

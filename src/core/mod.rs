pub mod batch;
pub mod coordinator;
pub mod materializer;
pub mod resolver;
pub mod retry;
pub mod state_store;

pub use batch::BatchRunner;
pub use coordinator::SyncCoordinator;
pub use materializer::{content_hash, placement_for, sanitize, ItemMaterializer, UNCATEGORIZED};
pub use resolver::{filter_changed, window_start, ChangeSetResolver};
pub use retry::{cancellable_sleep, RetryExecutor, RetryPolicy};
pub use state_store::{SyncStateStore, LAST_SYNC_PROPERTY, MARKER_NAME};

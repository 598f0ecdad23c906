//! Dynamic configuration module
//!
//! - `types`: `ConfigEvent` and its kinds
//! - `store`: per-(dataId, group) load/watch/publish handle
//! - `coordinator`: owns the config client and the active stores

pub mod coordinator;
pub mod store;
pub mod types;

pub use coordinator::ConfigCoordinator;
pub use store::ConfigWatchStore;
pub use types::{ConfigEvent, ConfigEventKind, DEFAULT_EVENT_CAPACITY};

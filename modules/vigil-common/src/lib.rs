pub mod config;
pub mod profile;
pub mod scheduler;
pub mod store;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{load_config, AppConfig, FileConfig};
pub use profile::{claimed_handle, normalize_handle, HandleClaim, ProfileMetadata};
pub use scheduler::{catch_panic, PeriodicTask, Scheduler};
pub use store::Store;
pub use types::*;

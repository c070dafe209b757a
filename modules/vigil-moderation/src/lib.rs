pub mod classifier;
pub mod cleanup;
pub mod dispatcher;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use classifier::MediaClassifier;
pub use cleanup::cleanup_temp_files;
pub use dispatcher::{process_item, ItemOutcome, ModerationDispatcher, NO_MEDIA_EXPLANATION};

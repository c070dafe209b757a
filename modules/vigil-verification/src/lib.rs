pub mod browserless;
pub mod consensus;
pub mod dispatcher;
pub mod error;
pub mod extraction;
pub mod keys;
pub mod pool;
pub mod selector;
pub mod session;
pub mod vision;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use browserless::{BrowserlessBackend, BrowserlessSession};
pub use consensus::consensus;
pub use dispatcher::{search_url, AttemptResult, VerificationDispatcher, NO_MATCH_ERROR};
pub use error::{Result, VerificationError};
pub use extraction::{
    parse_count, DomSelectors, ExtractedProfile, ExtractionPipeline, ExtractionStrategy,
};
pub use pool::{PoolConfig, PooledSession, SessionPool};
pub use selector::{EndpointHealth, EndpointSelector};
pub use session::{BrowserSession, SessionBackend};
pub use vision::{ClaudeVision, VisionModel, VisionReading};

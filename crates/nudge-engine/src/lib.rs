pub mod batch;
pub mod cache;
pub mod config;
pub mod manager;
pub mod mock;
pub mod recovery;
pub mod repo;
pub mod trigger;

pub use batch::{BatchProcessor, BatchStats, QueueStatus};
pub use cache::{CacheManager, CacheStats, CacheValue};
pub use config::{load_config_from_path, ConfigError, NudgeConfig};
pub use manager::{Collaborators, ManagerState, ManagerStats, ReviewManager};
pub use recovery::{ErrorHandler, RecoveryDecision, RecoveryResult};
pub use repo::ReviewRepo;
pub use trigger::TriggerEngine;

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod feedback;
pub mod limiter_config;
pub mod metrics;
pub mod persistence;
pub mod priority;
pub mod registry;
pub mod token_bucket;
pub mod wrapper;

pub use config::Config;
pub use dispatcher::{Dispatcher, DispatcherOptions, LimiterStatus, RequestId};
pub use error::{LimitError, PacerError, PacerResult};
pub use limiter_config::{EndpointConfigs, LimiterConfig, PriorityWeights};
pub use priority::Priority;
pub use registry::LimiterRegistry;
pub use wrapper::run_with_limit;

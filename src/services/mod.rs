pub mod cache;
pub mod change_capture;
pub mod cmdb;
pub mod conflict;
pub mod dispatcher;
pub mod event_queue;
pub mod fallback;
pub mod graph_store;
pub mod monitor;
pub mod redis_store;
pub mod relational_store;
pub mod schema_validator;
pub mod stats;

pub use cache::EntityCache;
pub use change_capture::ChangeCapture;
pub use cmdb::{CmdbRuntime, CmdbService, WriteRequest, WriteResponse};
pub use conflict::{ConflictResolver, InlineDecision};
pub use dispatcher::{apply_event, ApplyContext, ApplyOutcome, FailedEvent, SyncDispatcher};
pub use event_queue::{EventQueue, FailOutcome};
pub use fallback::FallbackController;
pub use graph_store::{GraphEdge, GraphNode, GraphStore};
pub use monitor::{raise_alert, Monitor};
pub use redis_store::RedisStore;
pub use relational_store::RelationalStore;
pub use stats::RuntimeStats;

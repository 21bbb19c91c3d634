pub mod endpoint;
pub mod expander;
pub mod job;
pub mod models;
pub mod options;
pub mod orchestrator;
pub mod pool;
pub mod progress;
pub mod queue;
pub mod resolver;
pub mod transfer_engine;

pub use endpoint::{
    AbortHandle, Capabilities, Endpoint, EndpointError, EndpointId, EndpointResult, FileMeta,
    Phase,
};
pub use job::JobHandle;
pub use models::{
    ConflictAction, Direction, EntryId, FileEntry, FileProgress, FileStatus, JobFlags, JobId,
    JobSnapshot, JobState, JobSummary, JobTotals,
};
pub use options::{ConflictPolicy, TransferOptions};
pub use orchestrator::{EnqueueError, Orchestrator};
pub use progress::{
    ChannelSink, ConflictDecision, ConflictQuery, ConflictRequest, FileOutcome, NullSink,
    ProgressSink, TransferEvent,
};
pub use queue::QueueError;

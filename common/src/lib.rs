pub mod codec;
pub mod collect;
pub mod config;
pub mod error;
pub mod keys;
pub mod local_store;
pub mod mc_store;
pub mod pipeline;
pub mod reduce;
pub mod results;
pub mod run;
pub mod sample;
pub mod seeds;
pub mod store;
pub mod task;
pub mod worker;

pub use error::{CodecError, PipelineError, Result, RunFailure};
pub use keys::{final_key, key_for, RunContext, RunId, StorageKey, TaskId};
pub use pipeline::{Pipeline, PipelineOptions, RunOutcome, RunState};
pub use results::RunResults;
pub use run::{RunInfo, RunRequest, RunStatus};
pub use sample::{MonteCarloSampler, SampleResult, Sampler};
pub use store::{MemoryStore, ObjectStore};
pub use task::{AssignmentId, SampleTask};
pub use worker::{
    TaskAssignmentRequest, TaskAssignmentResponse, TaskCompleteRequest, TaskCompleteResponse,
    WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerId, WorkerMetrics,
    WorkerRegisterRequest, WorkerRegisterResponse,
};

//! Stage workers and the supervisor that runs them.
//!
//! Each stage is a [`StageHandler`] driven by a [`WorkerPool`] over that stage's queue:
//! conversion feeds upload, upload feeds schedule.

pub mod convert;
pub mod schedule;
pub mod supervisor;
pub mod upload;
pub mod worker_pool;

pub use convert::{ConvertSettings, ConvertStage, destination_for};
pub use schedule::ScheduleStage;
pub use supervisor::{Collaborators, PipelineSupervisor, StageQueues};
pub use upload::UploadStage;
pub use worker_pool::{Outcome, PoolState, StageHandler, WorkerPool, WorkerPoolConfig};

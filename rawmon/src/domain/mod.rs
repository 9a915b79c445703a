//! Domain layer for rawmon.
//!
//! Value types shared by the queue, the watcher, the stage workers and the external
//! service clients.

pub mod job;
pub mod sample;
pub mod stage;

pub use job::{FIXED_VERSION, Job, MethodVersion, ProfileEntry, ScheduleResponse, latest_version};
pub use sample::{
    AcquisitionData, Chromatography, SampleStatus, StatusUpdate, file_name, sample_name,
};
pub use stage::Stage;

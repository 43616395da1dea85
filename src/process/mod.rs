//! Process groups: spawning workers, stepping them through synchronization
//! points, and collecting their results and measurements.

pub mod child;
pub mod group;
pub mod workload;

pub use child::{Process, ARG_MEASUREMENT_PIPE, ARG_SYNC_PIPE_IN, ARG_SYNC_PIPE_OUT, SYNC_CHAR};
pub use group::ProcessGroup;
pub use workload::{
    run_workload, WorkloadArgs, WorkloadContext, WorkloadIo, WorkloadOptions, WorkloadStatistics,
    WorkloadSynchronization,
};

pub use crate::backend::{Capabilities, ComputeBackend, HostBackend};
pub use crate::barrier::{BarrierEvents, Coordinator, Participant};
pub use crate::config::{Config, ConfigBuilder, Strategy};
pub use crate::error::{Error, Result};
pub use crate::heat3d::{self, Heat3dArgs, Heat3dParams, StencilKernels};
pub use crate::ipc::{HandleExporter, HandleImporter, HexCodec, ImportedHandle, SharedHandle};
pub use crate::process::{run_workload, Process, ProcessGroup, WorkloadArgs, WorkloadContext};
pub use crate::result::TestResult;
pub use crate::stats::{
    ConsoleExporter, JsonExporter, MeasurementType, MeasurementUnit, Statistics,
    StatisticsExporter, StatisticsSink,
};

//! Statistics collection and export.

pub mod export;
pub mod statistics;

pub use export::{ConsoleExporter, JsonExporter, StatisticsExporter};
pub use statistics::{MeasurementType, MeasurementUnit, Statistics, StatisticsSink, Summary};

//! Measurement collection for the coordinator.

use crate::error::{Error, Result};
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

// One hour in nanoseconds
const HISTOGRAM_MAX_NS: u64 = 3_600_000_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum MeasurementUnit {
    #[default]
    Unknown,
    Microseconds,
    Nanoseconds,
    GigabytesPerSecond,
    Latency,
}

impl fmt::Display for MeasurementUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MeasurementUnit::Unknown => "unknown",
            MeasurementUnit::Microseconds => "us",
            MeasurementUnit::Nanoseconds => "ns",
            MeasurementUnit::GigabytesPerSecond => "GB/s",
            MeasurementUnit::Latency => "latency",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum MeasurementType {
    #[default]
    Unknown,
    Cpu,
    Gpu,
}

/// Anything measurements can be pushed into.
pub trait StatisticsSink {
    fn push_value(
        &self,
        value: Duration,
        unit: MeasurementUnit,
        kind: MeasurementType,
        label: &str,
    ) -> Result<()>;

    fn push_unit_and_type(&self, unit: MeasurementUnit, kind: MeasurementType) -> Result<()>;
}

/// Per-label series of nanosecond values with summary figures.
#[derive(Debug, Default)]
pub struct Statistics {
    inner: Mutex<Vec<Series>>,
}

#[derive(Debug)]
struct Series {
    label: String,
    unit: MeasurementUnit,
    kind: MeasurementType,
    values: Vec<u64>,
    histogram: Histogram<u64>,
}

impl Series {
    fn new(label: &str, unit: MeasurementUnit, kind: MeasurementType) -> Result<Self> {
        let histogram = Histogram::new_with_max(HISTOGRAM_MAX_NS, 3)
            .map_err(|e| Error::Other(format!("histogram creation failed: {e}")))?;
        Ok(Self {
            label: label.to_string(),
            unit,
            kind,
            values: Vec::new(),
            histogram,
        })
    }

    fn summary(&self) -> Summary {
        let count = self.values.len();
        let mut sorted = self.values.clone();
        sorted.sort_unstable();

        let mean = if count > 0 {
            sorted.iter().map(|v| *v as f64).sum::<f64>() / count as f64
        } else {
            0.0
        };
        let median = match count {
            0 => 0,
            n if n % 2 == 1 => sorted[n / 2],
            n => (sorted[n / 2 - 1] + sorted[n / 2]) / 2,
        };
        let stddev = if count > 1 {
            let var = sorted
                .iter()
                .map(|v| (*v as f64 - mean).powi(2))
                .sum::<f64>()
                / (count - 1) as f64;
            var.sqrt()
        } else {
            0.0
        };

        Summary {
            label: self.label.clone(),
            unit: self.unit,
            kind: self.kind,
            count,
            min_ns: sorted.first().copied().unwrap_or(0),
            max_ns: sorted.last().copied().unwrap_or(0),
            mean_ns: mean,
            median_ns: median,
            stddev_ns: stddev,
            p95_ns: self.histogram.value_at_quantile(0.95),
            p99_ns: self.histogram.value_at_quantile(0.99),
        }
    }
}

/// Summary of one series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub label: String,
    pub unit: MeasurementUnit,
    pub kind: MeasurementType,
    pub count: usize,
    pub min_ns: u64,
    pub max_ns: u64,
    pub mean_ns: f64,
    pub median_ns: u64,
    pub stddev_ns: f64,
    pub p95_ns: u64,
    pub p99_ns: u64,
}

impl Summary {
    /// Relative standard deviation, in percent of the mean.
    pub fn coefficient_of_variation(&self) -> f64 {
        if self.mean_ns == 0.0 {
            return 0.0;
        }
        self.stddev_ns / self.mean_ns * 100.0
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().iter().all(|s| s.values.is_empty())
    }

    /// Labels in the order they were first pushed. Unlabelled values use "".
    pub fn labels(&self) -> Vec<String> {
        self.inner.lock().iter().map(|s| s.label.clone()).collect()
    }

    pub fn values(&self, label: &str) -> Vec<u64> {
        self.inner
            .lock()
            .iter()
            .find(|s| s.label == label)
            .map(|s| s.values.clone())
            .unwrap_or_default()
    }

    pub fn summaries(&self) -> Vec<Summary> {
        self.inner.lock().iter().map(Series::summary).collect()
    }

    pub fn summary(&self, label: &str) -> Option<Summary> {
        self.inner
            .lock()
            .iter()
            .find(|s| s.label == label)
            .map(Series::summary)
    }

    fn series_mut<'a>(
        series: &'a mut Vec<Series>,
        label: &str,
        unit: MeasurementUnit,
        kind: MeasurementType,
    ) -> Result<&'a mut Series> {
        let index = match series.iter().position(|s| s.label == label) {
            Some(index) => index,
            None => {
                series.push(Series::new(label, unit, kind)?);
                series.len() - 1
            }
        };
        Ok(&mut series[index])
    }
}

impl StatisticsSink for Statistics {
    fn push_value(
        &self,
        value: Duration,
        unit: MeasurementUnit,
        kind: MeasurementType,
        label: &str,
    ) -> Result<()> {
        let nanos = u64::try_from(value.as_nanos()).unwrap_or(u64::MAX);
        let mut inner = self.inner.lock();
        let series = Self::series_mut(&mut inner, label, unit, kind)?;
        if series.unit != unit || series.kind != kind {
            return Err(Error::Other(format!(
                "series {label:?} holds {:?}/{:?}, got {unit:?}/{kind:?}",
                series.unit, series.kind
            )));
        }
        series.values.push(nanos);
        series.histogram.saturating_record(nanos);
        Ok(())
    }

    fn push_unit_and_type(&self, unit: MeasurementUnit, kind: MeasurementType) -> Result<()> {
        let mut inner = self.inner.lock();
        for series in inner.iter_mut() {
            series.unit = unit;
            series.kind = kind;
        }
        Ok(())
    }
}

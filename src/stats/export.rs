//! Statistics export to JSON and to the console.

use super::statistics::{Statistics, Summary};
use crate::error::{Error, Result};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;

pub trait StatisticsExporter {
    fn export(&self, name: &str, statistics: &Statistics) -> Result<()>;
}

/// Writes a pretty-printed JSON report to a file.
#[derive(Debug, Clone)]
pub struct JsonExporter {
    output_path: PathBuf,
}

impl JsonExporter {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Report<'a> {
    benchmark: &'a str,
    series: Vec<SerializableSummary>,
}

#[derive(Debug, Serialize)]
struct SerializableSummary {
    label: String,
    unit: String,
    kind: String,
    count: usize,
    min_us: f64,
    max_us: f64,
    mean_us: f64,
    median_us: f64,
    stddev_us: f64,
    p95_us: f64,
    p99_us: f64,
    cv_percent: f64,
}

impl From<&Summary> for SerializableSummary {
    fn from(summary: &Summary) -> Self {
        Self {
            label: display_label(&summary.label).to_string(),
            unit: summary.unit.to_string(),
            kind: format!("{:?}", summary.kind),
            count: summary.count,
            min_us: summary.min_ns as f64 / 1_000.0,
            max_us: summary.max_ns as f64 / 1_000.0,
            mean_us: summary.mean_ns / 1_000.0,
            median_us: summary.median_ns as f64 / 1_000.0,
            stddev_us: summary.stddev_ns / 1_000.0,
            p95_us: summary.p95_ns as f64 / 1_000.0,
            p99_us: summary.p99_ns as f64 / 1_000.0,
            cv_percent: summary.coefficient_of_variation(),
        }
    }
}

fn display_label(label: &str) -> &str {
    if label.is_empty() {
        "average"
    } else {
        label
    }
}

impl JsonExporter {
    pub fn render(name: &str, statistics: &Statistics) -> Result<String> {
        let report = Report {
            benchmark: name,
            series: statistics.summaries().iter().map(SerializableSummary::from).collect(),
        };
        serde_json::to_string_pretty(&report)
            .map_err(|e| Error::Other(format!("JSON serialization failed: {e}")))
    }
}

impl StatisticsExporter for JsonExporter {
    fn export(&self, name: &str, statistics: &Statistics) -> Result<()> {
        let json = Self::render(name, statistics)?;
        std::fs::write(&self.output_path, json)?;
        Ok(())
    }
}

/// Prints one line per series to stdout.
#[derive(Debug, Default)]
pub struct ConsoleExporter {
    verbose: bool,
}

impl ConsoleExporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    pub fn write_to<W: Write>(&self, out: &mut W, name: &str, statistics: &Statistics) -> Result<()> {
        writeln!(out, "{name}")?;
        for summary in statistics.summaries() {
            write!(
                out,
                "  {:<12} n={:<5} mean={:>10.3}us median={:>10.3}us min={:>10.3}us max={:>10.3}us",
                display_label(&summary.label),
                summary.count,
                summary.mean_ns / 1_000.0,
                summary.median_ns as f64 / 1_000.0,
                summary.min_ns as f64 / 1_000.0,
                summary.max_ns as f64 / 1_000.0,
            )?;
            if self.verbose {
                write!(
                    out,
                    " stddev={:.3}us cv={:.2}% p99={:.3}us",
                    summary.stddev_ns / 1_000.0,
                    summary.coefficient_of_variation(),
                    summary.p99_ns as f64 / 1_000.0
                )?;
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

impl StatisticsExporter for ConsoleExporter {
    fn export(&self, name: &str, statistics: &Statistics) -> Result<()> {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        self.write_to(&mut lock, name, statistics)
    }
}

//! Execution context and metric sinks.
//!
//! Components never look up a device or a logger on their own; they receive
//! a [`RunContext`] and use what it carries.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use candle_core::Device;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::Result;

/// Receives scalar metrics.
pub trait MetricsSink: Send + Sync {
    /// Record `value` under `name`; `step` is the epoch or batch counter when known.
    fn log_scalar(&self, name: &str, value: f64, step: Option<usize>);
}

/// Emits metrics as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn log_scalar(&self, name: &str, value: f64, step: Option<usize>) {
        tracing::debug!(metric = name, value, step = ?step, "scalar");
    }
}

/// A recorded metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scalar {
    pub name: String,
    pub value: f64,
    pub step: Option<usize>,
}

/// Keeps metrics in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    scalars: Mutex<Vec<Scalar>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scalars(&self) -> Vec<Scalar> {
        self.scalars.lock().clone()
    }

    /// Values logged under `name`, in order.
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.scalars
            .lock()
            .iter()
            .filter(|s| s.name == name)
            .map(|s| s.value)
            .collect()
    }
}

impl MetricsSink for MemorySink {
    fn log_scalar(&self, name: &str, value: f64, step: Option<usize>) {
        self.scalars.lock().push(Scalar {
            name: name.to_string(),
            value,
            step,
        });
    }
}

/// Appends one JSON object per metric to a file.
pub struct JsonlSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl MetricsSink for JsonlSink {
    fn log_scalar(&self, name: &str, value: f64, step: Option<usize>) {
        let record = Scalar {
            name: name.to_string(),
            value,
            step,
        };
        let mut writer = self.writer.lock();
        if let Err(e) = write_record(&mut *writer, &record) {
            tracing::warn!(error = %e, metric = name, "failed to write metric");
        }
    }
}

fn write_record(writer: &mut impl Write, record: &Scalar) -> std::io::Result<()> {
    serde_json::to_writer(&mut *writer, record)?;
    writeln!(writer)?;
    writer.flush()
}

/// Device and metrics shared by trainers and evaluators.
#[derive(Clone)]
pub struct RunContext {
    pub device: Device,
    pub metrics: Arc<dyn MetricsSink>,
}

impl RunContext {
    pub fn new(device: Device, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { device, metrics }
    }

    /// CPU with metrics sent to `tracing`.
    pub fn cpu() -> Self {
        Self::new(Device::Cpu, Arc::new(TracingSink))
    }

    pub fn log_scalar(&self, name: &str, value: f64, step: Option<usize>) {
        self.metrics.log_scalar(name, value, step);
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

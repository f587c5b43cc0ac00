//! Interfaces to the sequencer's external collaborators.
//!
//! The sequencer pulls target rows from a [`RowSource`], reads the scale through a
//! [`WeightSource`] and hands telemetry and sent commands to a [`RecordSink`]. Concrete
//! file-backed implementations live in [`crate::targets`] and [`crate::sink`]; this
//! module also carries the simulated scale and small in-memory implementations.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use rand::Rng;

use crate::protocol::{ControlCommand, TelemetrySample};
use crate::targets::Target;
use crate::{DoserError, Result};

/// Supplies target rows in order.
pub trait RowSource: Send {
    /// Next unread row, or `None` once exhausted.
    fn next_row(&mut self) -> Option<Target>;

    /// Rows not yet returned by [`RowSource::next_row`].
    fn remaining(&self) -> usize;

    /// Name of the sheet the rows come from, if any.
    fn sheet_name(&self) -> Option<&str> {
        None
    }
}

/// Reads the current vial weight in grams.
///
/// Callers bound each read with a timeout and fall back to the last known weight on
/// failure, so implementations may block or fail freely.
#[async_trait::async_trait]
pub trait WeightSource: Send {
    async fn current_weight(&mut self) -> Result<f64>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Receives telemetry samples and sent commands. Fire-and-forget: implementations
/// handle their own failures.
pub trait RecordSink: Send {
    /// Rows from the sheet `name` have been loaded.
    fn begin_sheet(&mut self, _name: &str) {}

    /// A new target row (1-based) has been loaded.
    fn begin_target(&mut self, _row: usize, _target: &Target) {}

    /// Store one telemetry sample for `material`.
    fn record(&mut self, material: &str, sample: &TelemetrySample);

    /// Store one command sent on the control channel.
    fn record_command(&mut self, command: &ControlCommand);
}

/// Rows held in memory.
impl RowSource for VecDeque<Target> {
    fn next_row(&mut self) -> Option<Target> {
        self.pop_front()
    }

    fn remaining(&self) -> usize {
        self.len()
    }
}

/// Scale stand-in drawing uniform readings from `[min, max)` grams.
#[derive(Debug, Clone)]
pub struct SimulatedScale {
    min: f64,
    max: f64,
}

impl SimulatedScale {
    pub const DEFAULT_RANGE: (f64, f64) = (5.0, 15.0);

    pub fn new(min: f64, max: f64) -> Result<Self> {
        if !(min.is_finite() && max.is_finite() && min < max) {
            return Err(DoserError::configuration(
                "simulated weight range",
                format!("{min}..{max} is empty or not finite"),
            ));
        }
        Ok(Self { min, max })
    }
}

impl Default for SimulatedScale {
    fn default() -> Self {
        Self { min: Self::DEFAULT_RANGE.0, max: Self::DEFAULT_RANGE.1 }
    }
}

#[async_trait::async_trait]
impl WeightSource for SimulatedScale {
    async fn current_weight(&mut self) -> Result<f64> {
        let weight = rand::thread_rng().gen_range(self.min..self.max);
        tracing::trace!(weight, "Simulated weight");
        Ok(weight)
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

/// Replays a fixed sequence of readings, then keeps returning the last one.
#[derive(Debug, Clone)]
pub struct ScriptedScale {
    readings: VecDeque<f64>,
    last: f64,
}

impl ScriptedScale {
    pub fn new(readings: impl IntoIterator<Item = f64>) -> Self {
        Self { readings: readings.into_iter().collect(), last: 0.0 }
    }
}

#[async_trait::async_trait]
impl WeightSource for ScriptedScale {
    async fn current_weight(&mut self) -> Result<f64> {
        if let Some(next) = self.readings.pop_front() {
            self.last = next;
        }
        Ok(self.last)
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// What a [`MemorySink`] has captured.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recorded {
    pub samples: Vec<(String, TelemetrySample)>,
    pub commands: Vec<ControlCommand>,
}

/// Sink keeping everything in memory. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<Recorded>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    pub fn snapshot(&self) -> Recorded {
        self.inner.lock().map(|recorded| recorded.clone()).unwrap_or_default()
    }
}

impl RecordSink for MemorySink {
    fn record(&mut self, material: &str, sample: &TelemetrySample) {
        if let Ok(mut recorded) = self.inner.lock() {
            recorded.samples.push((material.to_string(), *sample));
        }
    }

    fn record_command(&mut self, command: &ControlCommand) {
        if let Ok(mut recorded) = self.inner.lock() {
            recorded.commands.push(*command);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_scale_stays_in_range() {
        let mut scale = SimulatedScale::default();
        for _ in 0..1000 {
            let weight = scale.current_weight().await.unwrap();
            assert!((5.0..15.0).contains(&weight), "{weight}");
        }
    }

    #[test]
    fn empty_range_is_rejected() {
        assert!(SimulatedScale::new(5.0, 5.0).is_err());
        assert!(SimulatedScale::new(f64::NAN, 1.0).is_err());
        assert!(SimulatedScale::new(0.0, 1.0).is_ok());
    }

    #[tokio::test]
    async fn scripted_scale_repeats_last_reading() {
        let mut scale = ScriptedScale::new([9.5, 9.9]);
        assert_eq!(scale.current_weight().await.unwrap(), 9.5);
        assert_eq!(scale.current_weight().await.unwrap(), 9.9);
        assert_eq!(scale.current_weight().await.unwrap(), 9.9);
    }

    #[test]
    fn memory_sink_clones_share_storage() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        let sample =
            TelemetrySample {
                accuracy: 0.95,
                difference: 0.2,
                target_weight: 10.0,
                elapsed_time: 3.5,
            };

        writer.record("salt", &sample);
        writer.record_command(&ControlCommand::continuation(5.0, 9.8, 10.0));

        let recorded = sink.snapshot();
        assert_eq!(recorded.samples, vec![("salt".to_string(), sample)]);
        assert_eq!(recorded.commands.len(), 1);
        assert!(recorded.commands[0].is_continuation());
    }
}

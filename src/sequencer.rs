//! The dispensing run state machine.
//!
//! A [`Sequencer`] owns all mutable run state and is driven by one caller at a time
//! (the [`crate::driver`] actor). Control-channel messages advance it through the target
//! rows; each advance or `executing` notice reads the scale, runs the control law and
//! yields the [`ControlCommand`] to send. Data-channel telemetry is forwarded to the
//! record sink while a target is active.
//!
//! ```text
//! Idle --start--> Running --new_target past last row--> Completed
//!   ^                |
//!   +------stop------+   (Completed instead when no rows remain)
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::collaborators::{RecordSink, RowSource, WeightSource};
use crate::config::MaterialParameters;
use crate::control_law::{Actuation, ControlLaw};
use crate::protocol::{self, ControlCommand, Message, TelemetrySample};
use crate::targets::Target;
use crate::{DoserError, Result};

/// Default bound on a single scale read.
pub const DEFAULT_WEIGHT_TIMEOUT: Duration = Duration::from_secs(2);

/// Run phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Running,
    Completed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => f.write_str("idle"),
            Phase::Running => f.write_str("running"),
            Phase::Completed => f.write_str("completed"),
        }
    }
}

/// Single-owner run state and the collaborators it drives.
pub struct Sequencer {
    phase: Phase,
    /// 1-based index of the current row; 0 before the first.
    row: usize,
    target: Option<Target>,
    last_weight: f64,
    last_actuation: Option<Actuation>,
    parameters: MaterialParameters,
    law: Box<dyn ControlLaw>,
    rows: Box<dyn RowSource>,
    weights: Box<dyn WeightSource>,
    sink: Box<dyn RecordSink>,
    weight_timeout: Duration,
}

impl Sequencer {
    /// A sequencer with no rows loaded.
    pub fn new(
        law: Box<dyn ControlLaw>,
        parameters: MaterialParameters,
        weights: Box<dyn WeightSource>,
        sink: Box<dyn RecordSink>,
    ) -> Self {
        Self {
            phase: Phase::Idle,
            row: 0,
            target: None,
            last_weight: 0.0,
            last_actuation: None,
            parameters,
            law,
            rows: Box::new(VecDeque::new()),
            weights,
            sink,
            weight_timeout: DEFAULT_WEIGHT_TIMEOUT,
        }
    }

    pub fn with_weight_timeout(mut self, timeout: Duration) -> Self {
        self.weight_timeout = timeout;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// 1-based index of the current row, 0 before the first.
    pub fn row(&self) -> usize {
        self.row
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    pub fn last_weight(&self) -> f64 {
        self.last_weight
    }

    pub fn last_actuation(&self) -> Option<Actuation> {
        self.last_actuation
    }

    pub fn parameters(&self) -> &MaterialParameters {
        &self.parameters
    }

    pub fn remaining(&self) -> usize {
        self.rows.remaining()
    }

    pub fn law_name(&self) -> &'static str {
        self.law.name()
    }

    /// Replace the material parameters used for the next computations.
    pub fn set_parameters(&mut self, parameters: MaterialParameters) {
        self.parameters = parameters;
    }

    /// Replace the target rows. Not allowed while running.
    pub fn load_rows(&mut self, rows: Box<dyn RowSource>) -> Result<()> {
        if self.phase == Phase::Running {
            return Err(DoserError::invalid_state("cannot load targets while running"));
        }

        info!(rows = rows.remaining(), sheet = ?rows.sheet_name(), "Targets loaded");
        if let Some(name) = rows.sheet_name() {
            self.sink.begin_sheet(name);
        }
        self.rows = rows;
        self.row = 0;
        self.target = None;
        self.phase = Phase::Idle;
        Ok(())
    }

    /// Begin or resume the run.
    ///
    /// Refused when the control link is down, nothing is loaded, or the run already
    /// completed. Starting a running sequencer does nothing.
    pub fn start(&mut self, control_connected: bool) -> Result<()> {
        match self.phase {
            Phase::Running => {
                debug!("Start ignored, already running");
                return Ok(());
            }
            Phase::Completed => {
                return Err(DoserError::invalid_state("run completed, load new targets to restart"));
            }
            Phase::Idle => {}
        }
        if !control_connected {
            return Err(DoserError::invalid_state("control link is not connected"));
        }
        if self.rows.remaining() == 0 {
            return Err(DoserError::invalid_state("no target rows loaded"));
        }

        self.phase = Phase::Running;
        info!(
            next_row = self.row + 1,
            remaining = self.rows.remaining(),
            law = self.law.name(),
            "Run started"
        );
        Ok(())
    }

    /// Stop sending commands. Returns the phase stopped into.
    pub fn stop(&mut self) -> Phase {
        if self.phase == Phase::Running {
            self.phase =
                if self.rows.remaining() == 0 { Phase::Completed } else { Phase::Idle };
            info!(phase = %self.phase, row = self.row, "Run stopped");
        }
        self.phase
    }

    /// Handle one control-channel message, returning the command to send, if any.
    pub async fn on_control(&mut self, message: Message) -> Option<ControlCommand> {
        match message {
            Message::NewTarget => self.advance().await,
            Message::Executing(notice) => self.continue_target(&notice).await,
            Message::TargetAck => {
                debug!(row = self.row, "Target acknowledged");
                None
            }
            Message::Data(echo) => {
                debug!(?echo, "Packet echoed by server");
                None
            }
            Message::Unknown(text) => {
                warn!(text = %text, "Unknown control message ignored");
                None
            }
            Message::Malformed(reason) => {
                warn!(reason = %reason, "Malformed control message dropped");
                None
            }
        }
    }

    /// Handle one data-channel record. Returns the sample handed to the sink, if any.
    pub fn on_telemetry(&mut self, record: &str) -> Option<TelemetrySample> {
        let sample = match protocol::parse_telemetry(record) {
            Ok(Some(sample)) => sample,
            Ok(None) => {
                trace!("No sample this poll");
                return None;
            }
            Err(e) => {
                warn!("Telemetry dropped: {}", e);
                return None;
            }
        };

        match (&self.target, self.phase) {
            (Some(target), Phase::Running) => {
                debug!(row = self.row, material = %target.material, ?sample, "Telemetry sample");
                self.sink.record(&target.material, &sample);
                Some(sample)
            }
            _ => {
                debug!(phase = %self.phase, "Telemetry outside an active target dropped");
                None
            }
        }
    }

    /// Log a command the control link accepted.
    pub fn command_sent(&mut self, command: &ControlCommand) {
        self.sink.record_command(command);
    }

    /// Whether the data channel should be polled now.
    pub fn wants_telemetry(&self) -> bool {
        self.phase == Phase::Running
    }

    async fn advance(&mut self) -> Option<ControlCommand> {
        if self.phase != Phase::Running {
            debug!(phase = %self.phase, "new_target ignored");
            return None;
        }

        let Some(target) = self.rows.next_row() else {
            self.phase = Phase::Completed;
            info!(rows = self.row, "All targets processed");
            return None;
        };

        self.row += 1;
        self.parameters = target.apply_to(&self.parameters);
        self.sink.begin_target(self.row, &target);
        info!(
            row = self.row,
            material = %target.material,
            target_weight = target.target_weight,
            density = target.density,
            "Target loaded"
        );

        let current = self.acquire_weight().await;
        let actuation = self.actuation(target.target_weight, current);
        let command = ControlCommand::new(
            target.target_weight,
            actuation.amplitude,
            current,
            actuation.angle,
        );
        self.target = Some(target);
        Some(command)
    }

    async fn continue_target(&mut self, notice: &str) -> Option<ControlCommand> {
        debug!(notice, "Executing");
        if self.phase != Phase::Running {
            return None;
        }
        let target_weight = self.target.as_ref()?.target_weight;

        let current = self.acquire_weight().await;
        let actuation = self.actuation(target_weight, current);
        Some(ControlCommand::continuation(actuation.amplitude, current, actuation.angle))
    }

    fn actuation(&mut self, target_weight: f64, current_weight: f64) -> Actuation {
        let parameters = &self.parameters;
        let actuation = self
            .law
            .compute(target_weight, current_weight, parameters.density, parameters.particle_size)
            .unwrap_or_else(|| {
                warn!(
                    law = self.law.name(),
                    target_weight,
                    current_weight,
                    "Control law produced no result, using safe default"
                );
                Actuation::SAFE_DEFAULT
            });
        self.last_actuation = Some(actuation);
        actuation
    }

    /// Read the scale within the timeout, falling back to the last reading.
    async fn acquire_weight(&mut self) -> f64 {
        let source = self.weights.name();
        let read = tokio::time::timeout(self.weight_timeout, self.weights.current_weight()).await;
        let error = match read {
            Ok(Ok(weight)) if weight.is_finite() => {
                debug!(source, weight, "Weight acquired");
                self.last_weight = weight;
                return weight;
            }
            Ok(Ok(weight)) => DoserError::computation(format!("non-finite weight {weight}")),
            Ok(Err(e)) => e,
            Err(_) => DoserError::Timeout { duration: self.weight_timeout },
        };

        warn!(source, fallback = self.last_weight, "Weight read failed: {}", error);
        self.last_weight
    }
}

impl fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequencer")
            .field("phase", &self.phase)
            .field("row", &self.row)
            .field("target", &self.target)
            .field("last_weight", &self.last_weight)
            .field("law", &self.law.name())
            .finish_non_exhaustive()
    }
}

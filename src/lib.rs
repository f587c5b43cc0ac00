//! Control and telemetry engine for a remote weighing/dispensing rig.
//!
//! The rig exposes two TCP channels: a control channel carrying a command/response
//! handshake, and a data channel polled for telemetry. This crate connects to both,
//! walks a sheet of dispensing targets, computes shake actuation from the measured
//! weight with a deterministic or fuzzy control law, and records the returned
//! telemetry as JSON lines.
//!
//! # Features
//!
//! - **Resilient links**: timed connect/read/write, buffered record framing, faults
//!   reported through callbacks and never fatal
//! - **Pure protocol codec**: packet formatting, parsing and validation
//! - **Two control laws**: threshold buckets or an in-crate fuzzy rule base
//! - **Single-writer run state**: link events, poll ticks and user requests are
//!   serialised through one actor
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use doser::{ClientConfig, Doser, Phase};
//!
//! #[tokio::main]
//! async fn main() -> doser::Result<()> {
//!     let config = ClientConfig::load("doser.yaml");
//!     let doser = Doser::new(config)?;
//!
//!     doser.connect().await?;
//!     doser.load_targets("targets.csv").await?;
//!     doser.start().await?;
//!
//!     doser.wait_for_phase(Phase::Completed).await?;
//!     doser.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::path::Path;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;
use tracing::{info, warn};

// Core types and error handling
mod error;
pub mod protocol;

// Configuration and ambient setup
pub mod config;
pub mod logging;

// Engine
pub mod control_law;
pub mod driver;
pub mod link;
pub mod sequencer;

// Collaborators
pub mod collaborators;
pub mod sink;
pub mod targets;

// Core exports
pub use error::*;

pub use collaborators::{RecordSink, RowSource, SimulatedScale, WeightSource};
pub use config::{ClientConfig, MaterialParameters};
pub use control_law::{Actuation, ControlLaw, ControlLawKind};
pub use driver::{Driver, DriverHandle, DriverSettings, RunStatus};
pub use link::{Link, LinkCallbacks, LinkConfig, LinkEvent, LinkFault, LinkRole, LinkState};
pub use protocol::{ControlCommand, Message, TelemetrySample};
pub use sequencer::{Phase, Sequencer};
pub use sink::JsonLinesSink;
pub use targets::{Target, TargetTable};

/// Unified entry point wiring both links, the sequencer and its driver.
///
/// # Examples
///
/// ```rust,no_run
/// use doser::{ClientConfig, Doser};
///
/// # #[tokio::main]
/// # async fn main() -> doser::Result<()> {
/// let mut config = ClientConfig::default();
/// config.set_control_endpoint("192.168.1.20", 1023);
///
/// let doser = Doser::new(config)?;
/// doser.connect_control().await?;
/// println!("{:?}", doser.status().phase);
/// # Ok(())
/// # }
/// ```
pub struct Doser {
    config: ClientConfig,
    control: Arc<Link>,
    data: Arc<Link>,
    driver: DriverHandle,
}

impl Doser {
    /// Build with the configured collaborators: the simulated scale and JSON-lines
    /// results in `files.results_dir`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Self> {
        if !config.parameters.simulate_weight {
            warn!("No external weight source configured, using the simulated scale");
        }
        let sink = JsonLinesSink::new(&config.files.results_dir, targets::UNKNOWN_MATERIAL)?;
        Ok(Self::with_collaborators(config, Box::new(SimulatedScale::default()), Box::new(sink)))
    }

    /// Build with caller-supplied weight source and record sink.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_collaborators(
        config: ClientConfig,
        weights: Box<dyn WeightSource>,
        sink: Box<dyn RecordSink>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let control = Arc::new(Link::new(
            LinkRole::Control,
            config.control_link(),
            LinkCallbacks::forward_to(LinkRole::Control, events_tx.clone()),
        ));
        let data = Arc::new(Link::new(
            LinkRole::Data,
            config.data_link(),
            LinkCallbacks::forward_to(LinkRole::Data, events_tx),
        ));

        let sequencer =
            Sequencer::new(config.control_law.build(), config.parameters, weights, sink);
        let settings = DriverSettings {
            poll_interval: config.poll_interval(),
            request_token: config.communication.request_token.clone(),
        };
        let driver =
            Driver::spawn(sequencer, Arc::clone(&control), Arc::clone(&data), events_rx, settings);

        info!(
            control = %config.control_link().endpoint(),
            data = %config.data_link().endpoint(),
            law = ?config.control_law,
            "Doser ready"
        );
        Self { config, control, data, driver }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn control_link(&self) -> &Link {
        &self.control
    }

    pub fn data_link(&self) -> &Link {
        &self.data
    }

    pub async fn connect_control(&self) -> Result<()> {
        self.control.connect().await
    }

    pub async fn connect_data(&self) -> Result<()> {
        self.data.connect().await
    }

    /// Connect both links. Both are attempted; the first failure is returned.
    pub async fn connect(&self) -> Result<()> {
        let control = self.control.connect().await;
        let data = self.data.connect().await;
        control.and(data)
    }

    pub async fn disconnect(&self) {
        self.control.disconnect().await;
        self.data.disconnect().await;
    }

    /// Point the control link at a new endpoint, used by the next connect.
    pub async fn set_control_endpoint(&mut self, host: impl Into<String>, port: u16) {
        let host = host.into();
        self.config.set_control_endpoint(host.clone(), port);
        self.control.set_endpoint(host, port).await;
    }

    /// Point the data link at a new endpoint, used by the next connect.
    pub async fn set_data_endpoint(&mut self, host: impl Into<String>, port: u16) {
        let host = host.into();
        self.config.set_data_endpoint(host.clone(), port);
        self.data.set_endpoint(host, port).await;
    }

    /// Update material parameters for subsequent computations.
    pub async fn update_parameters(
        &mut self,
        density: Option<f64>,
        vial_weight: Option<f64>,
        particle_size: Option<f64>,
    ) -> Result<MaterialParameters> {
        let parameters = self.config.update_parameters(density, vial_weight, particle_size, None);
        self.driver.set_parameters(parameters).await?;
        Ok(parameters)
    }

    /// Load a target sheet, inheriting the current material parameters. Returns the
    /// number of rows.
    pub async fn load_targets(&self, path: impl AsRef<Path>) -> Result<usize> {
        let table = TargetTable::load(path, &self.config.parameters)?;
        self.load_table(table).await
    }

    pub async fn load_table(&self, table: TargetTable) -> Result<usize> {
        let rows = table.len();
        self.driver.load_rows(Box::new(table)).await?;
        Ok(rows)
    }

    /// Start or resume the run.
    pub async fn start(&self) -> Result<()> {
        self.driver.start().await
    }

    /// Stop sending commands; returns the phase stopped into.
    pub async fn stop(&self) -> Result<Phase> {
        self.driver.stop().await
    }

    pub fn status(&self) -> Arc<RunStatus> {
        self.driver.status()
    }

    /// Stream of status snapshots, starting with the current one.
    pub fn status_updates(&self) -> impl Stream<Item = Arc<RunStatus>> + 'static {
        self.driver.status_updates()
    }

    pub async fn wait_for_phase(&self, phase: Phase) -> Result<Arc<RunStatus>> {
        self.driver.wait_for_phase(phase).await
    }

    /// Stop the driver and close both links.
    pub async fn shutdown(self) {
        let Self { control, data, driver, .. } = self;
        driver.shutdown().await;
        control.disconnect().await;
        data.disconnect().await;
        info!("Doser shut down");
    }
}

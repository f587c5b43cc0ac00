//! Client configuration.
//!
//! Configuration is a YAML document (see [`ClientConfig`]) read once at startup and
//! passed explicitly to the links and the sequencer. Loading never fails: a missing
//! file, a syntax error or an invalid value is logged and replaced by its default.
//!
//! ```yaml
//! communication:
//!   control: { host: 127.0.0.1, port: 1023 }
//!   data: { host: 127.0.0.1, port: 1025 }
//!   timeout: 30.0
//!   buffer_size: 10240
//!   poll_interval_ms: 1000
//!   request_token: request_weight
//! parameters:
//!   density: 2.11
//!   vial_weight: 9.7
//!   particle_size: 3.0
//!   simulate_weight: true
//! control_law: deterministic
//! files:
//!   targets: targets.csv
//!   results_dir: Experimental results
//! logging:
//!   level: debug
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::control_law::ControlLawKind;
use crate::link::{DEFAULT_BUFFER_SIZE, DEFAULT_TIMEOUT, LinkConfig};
use crate::protocol::DEFAULT_REQUEST_TOKEN;
use crate::{DoserError, Result};

/// Complete client configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub communication: CommunicationConfig,
    pub parameters: MaterialParameters,
    pub control_law: ControlLawKind,
    pub files: FileConfig,
    pub logging: LoggingConfig,
}

/// Host and port of one rig channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

/// Socket and polling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunicationConfig {
    pub control: Endpoint,
    pub data: Endpoint,
    /// Socket timeout in seconds.
    pub timeout: f64,
    pub buffer_size: usize,
    pub poll_interval_ms: u64,
    pub request_token: String,
}

impl Default for CommunicationConfig {
    fn default() -> Self {
        Self {
            control: Endpoint::new("127.0.0.1", 1023),
            data: Endpoint::new("127.0.0.1", 1025),
            timeout: DEFAULT_TIMEOUT.as_secs_f64(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            poll_interval_ms: 1000,
            request_token: DEFAULT_REQUEST_TOKEN.to_string(),
        }
    }
}

/// Material parameters fed to the control law.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterialParameters {
    /// Density, strictly positive.
    pub density: f64,
    /// Empty vial weight in grams.
    pub vial_weight: f64,
    pub particle_size: f64,
    /// Use the simulated scale instead of an external weight source.
    pub simulate_weight: bool,
}

impl Default for MaterialParameters {
    fn default() -> Self {
        Self { density: 2.11, vial_weight: 9.7, particle_size: 3.0, simulate_weight: true }
    }
}

/// Where targets come from and results go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Target sheet loaded at startup, if any.
    pub targets: Option<PathBuf>,
    pub results_dir: PathBuf,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self { targets: None, results_dir: PathBuf::from("Experimental results") }
    }
}

/// Log filter and optional log file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. `info` or `doser=debug`.
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "debug".to_string(), file: None }
    }
}

impl ClientConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ClientConfig = serde_yaml_ng::from_str(yaml)
            .map_err(|e| DoserError::configuration("<document>", e.to_string()))?;
        Ok(config.validated())
    }

    /// Load from `path`, falling back to defaults on any problem.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let yaml = match std::fs::read_to_string(path) {
            Ok(yaml) => yaml,
            Err(e) => {
                warn!(path = %path.display(), "Cannot read configuration ({}), using defaults", e);
                return Self::default();
            }
        };

        match Self::from_yaml(&yaml) {
            Ok(config) => {
                info!(path = %path.display(), "Configuration loaded");
                config
            }
            Err(e) => {
                warn!(path = %path.display(), "{}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Load from `path`, writing a default file first if none exists.
    pub fn load_or_create(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }

        let config = Self::default();
        match config.save(path) {
            Ok(()) => info!(path = %path.display(), "Default configuration written"),
            Err(e) => warn!(path = %path.display(), "Cannot write default configuration: {}", e),
        }
        config
    }

    /// Persist this configuration as YAML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let yaml = serde_yaml_ng::to_string(self)
            .map_err(|e| DoserError::configuration("<document>", e.to_string()))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| DoserError::file_error(parent, e))?;
        }
        std::fs::write(path, yaml).map_err(|e| DoserError::file_error(path, e))
    }

    /// Replace values the client cannot work with by their defaults.
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();
        let communication = &mut self.communication;

        if Duration::try_from_secs_f64(communication.timeout).map_or(true, |d| d.is_zero()) {
            warn!(value = communication.timeout, "Invalid communication.timeout, using default");
            communication.timeout = defaults.communication.timeout;
        }
        if communication.buffer_size == 0 {
            warn!("Invalid communication.buffer_size 0, using default");
            communication.buffer_size = defaults.communication.buffer_size;
        }
        if communication.poll_interval_ms == 0 {
            warn!("Invalid communication.poll_interval_ms 0, using default");
            communication.poll_interval_ms = defaults.communication.poll_interval_ms;
        }
        if communication.request_token.trim().is_empty() {
            warn!("Empty communication.request_token, using default");
            communication.request_token = defaults.communication.request_token;
        }

        let parameters = &mut self.parameters;
        if !(parameters.density.is_finite() && parameters.density > 0.0) {
            warn!(value = parameters.density, "Invalid parameters.density, using default");
            parameters.density = defaults.parameters.density;
        }
        if !parameters.particle_size.is_finite() {
            warn!("Invalid parameters.particle_size, using default");
            parameters.particle_size = defaults.parameters.particle_size;
        }
        if !parameters.vial_weight.is_finite() {
            warn!("Invalid parameters.vial_weight, using default");
            parameters.vial_weight = defaults.parameters.vial_weight;
        }

        self
    }

    /// Socket timeout.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.communication.timeout).unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Data-channel poll period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.communication.poll_interval_ms.max(1))
    }

    pub fn control_link(&self) -> LinkConfig {
        self.link_config(&self.communication.control)
    }

    pub fn data_link(&self) -> LinkConfig {
        self.link_config(&self.communication.data)
    }

    fn link_config(&self, endpoint: &Endpoint) -> LinkConfig {
        LinkConfig::new(endpoint.host.clone(), endpoint.port)
            .with_timeout(self.timeout())
            .with_buffer_size(self.communication.buffer_size)
    }

    pub fn set_control_endpoint(&mut self, host: impl Into<String>, port: u16) {
        self.communication.control = Endpoint::new(host, port);
    }

    pub fn set_data_endpoint(&mut self, host: impl Into<String>, port: u16) {
        self.communication.data = Endpoint::new(host, port);
    }

    /// Overwrite the given material parameters, keeping the others.
    pub fn update_parameters(
        &mut self,
        density: Option<f64>,
        vial_weight: Option<f64>,
        particle_size: Option<f64>,
        simulate_weight: Option<bool>,
    ) -> MaterialParameters {
        let parameters = &mut self.parameters;
        if let Some(density) = density.filter(|d| d.is_finite() && *d > 0.0) {
            parameters.density = density;
        }
        if let Some(vial_weight) = vial_weight.filter(|v| v.is_finite()) {
            parameters.vial_weight = vial_weight;
        }
        if let Some(particle_size) = particle_size.filter(|p| p.is_finite()) {
            parameters.particle_size = particle_size;
        }
        if let Some(simulate_weight) = simulate_weight {
            parameters.simulate_weight = simulate_weight;
        }
        info!(
            density = parameters.density,
            vial_weight = parameters.vial_weight,
            particle_size = parameters.particle_size,
            simulate_weight = parameters.simulate_weight,
            "Parameters updated"
        );
        *parameters
    }
}

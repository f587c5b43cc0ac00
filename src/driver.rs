//! Driver spawns and manages the sequencer actor

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::collaborators::RowSource;
use crate::config::MaterialParameters;
use crate::control_law::Actuation;
use crate::link::{Link, LinkEvent, LinkRole, LinkState};
use crate::protocol::{self, ControlCommand, DEFAULT_REQUEST_TOKEN, TelemetrySample};
use crate::sequencer::{Phase, Sequencer};
use crate::{DoserError, Result};

/// Depth of the request queue into the actor.
const COMMAND_QUEUE: usize = 16;

/// Snapshot of the run, published after every change.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunStatus {
    pub phase: Phase,
    /// 1-based index of the current row, 0 before the first.
    pub row: usize,
    pub remaining: usize,
    pub material: Option<String>,
    pub target_weight: Option<f64>,
    pub last_weight: f64,
    pub last_actuation: Option<Actuation>,
    pub last_sample: Option<TelemetrySample>,
    pub control: LinkState,
    pub data: LinkState,
}

/// Timing and polling settings of the actor.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverSettings {
    /// Data-channel poll period while running.
    pub poll_interval: Duration,
    /// Text sent on the data channel to request a sample.
    pub request_token: String,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            request_token: DEFAULT_REQUEST_TOKEN.to_string(),
        }
    }
}

enum Request {
    Start(oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<Phase>),
    LoadRows(Box<dyn RowSource>, oneshot::Sender<Result<()>>),
    SetParameters(MaterialParameters),
}

/// Handle to a running driver. Dropping it stops the actor.
pub struct DriverHandle {
    requests: mpsc::Sender<Request>,
    status: watch::Receiver<Arc<RunStatus>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DriverHandle {
    /// Start or resume the run.
    pub async fn start(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.request(Request::Start(reply)).await?;
        response.await.map_err(|_| driver_gone())?
    }

    /// Stop sending commands; returns the phase stopped into.
    pub async fn stop(&self) -> Result<Phase> {
        let (reply, response) = oneshot::channel();
        self.request(Request::Stop(reply)).await?;
        response.await.map_err(|_| driver_gone())
    }

    /// Replace the target rows. Refused while running.
    pub async fn load_rows(&self, rows: Box<dyn RowSource>) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.request(Request::LoadRows(rows, reply)).await?;
        response.await.map_err(|_| driver_gone())?
    }

    /// Replace the material parameters used for the next computation.
    pub async fn set_parameters(&self, parameters: MaterialParameters) -> Result<()> {
        self.request(Request::SetParameters(parameters)).await
    }

    /// Current status.
    pub fn status(&self) -> Arc<RunStatus> {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<Arc<RunStatus>> {
        self.status.clone()
    }

    /// Stream of status snapshots, starting with the current one.
    pub fn status_updates(&self) -> impl Stream<Item = Arc<RunStatus>> + 'static {
        WatchStream::new(self.status.clone())
    }

    /// Wait until the run reaches `phase`.
    pub async fn wait_for_phase(&self, phase: Phase) -> Result<Arc<RunStatus>> {
        let mut status = self.status.clone();
        let reached = status.wait_for(|s| s.phase == phase).await.map_err(|_| driver_gone())?;
        Ok(reached.clone())
    }

    /// Stop the actor and wait for it to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Driver task ended abnormally: {}", e);
            }
        }
    }

    async fn request(&self, request: Request) -> Result<()> {
        self.requests.send(request).await.map_err(|_| driver_gone())
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        debug!("Dropping driver handle");
        self.cancel.cancel();
    }
}

fn driver_gone() -> DoserError {
    DoserError::invalid_state("driver is not running")
}

/// Driver spawns the single-writer actor owning the [`Sequencer`].
///
/// The actor serialises link events, poll ticks and user requests, so reading the
/// scale, computing and sending happen atomically per control event.
pub struct Driver;

impl Driver {
    /// Spawn the actor.
    ///
    /// `events` must carry the records and faults of both links, usually wired with
    /// [`crate::link::LinkCallbacks::forward_to`].
    pub fn spawn(
        sequencer: Sequencer,
        control: Arc<Link>,
        data: Arc<Link>,
        events: mpsc::UnboundedReceiver<LinkEvent>,
        settings: DriverSettings,
    ) -> DriverHandle {
        let (requests_tx, requests_rx) = mpsc::channel(COMMAND_QUEUE);
        let cancel = CancellationToken::new();

        let actor = Actor {
            sequencer,
            control,
            data,
            settings,
            last_sample: None,
            status: watch::channel(Arc::new(RunStatus::default())).0,
        };
        let status = actor.status.subscribe();
        actor.publish();

        let task = tokio::spawn(actor.run(events, requests_rx, cancel.clone()));

        DriverHandle { requests: requests_tx, status, cancel, task: Some(task) }
    }
}

struct Actor {
    sequencer: Sequencer,
    control: Arc<Link>,
    data: Arc<Link>,
    settings: DriverSettings,
    last_sample: Option<TelemetrySample>,
    status: watch::Sender<Arc<RunStatus>>,
}

impl Actor {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
        mut requests: mpsc::Receiver<Request>,
        cancel: CancellationToken,
    ) {
        info!(law = self.sequencer.law_name(), "Driver task started");

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut control_state = self.control.watch_state();
        let mut data_state = self.data.watch_state();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Driver cancelled");
                    break;
                }
                Some(request) = requests.recv() => self.handle_request(request),
                Some(event) = events.recv() => self.handle_event(event).await,
                _ = ticker.tick() => self.poll().await,
                Ok(()) = control_state.changed() => {}
                Ok(()) = data_state.changed() => {}
            }
            self.publish();
        }

        if self.sequencer.stop() == Phase::Idle {
            debug!("Run left idle at shutdown");
        }
        self.publish();
        info!(row = self.sequencer.row(), "Driver task ended");
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Start(reply) => {
                let started = self.sequencer.start(self.control.is_connected());
                if let Err(e) = &started {
                    warn!("Start refused: {}", e);
                }
                let _ = reply.send(started);
            }
            Request::Stop(reply) => {
                let _ = reply.send(self.sequencer.stop());
            }
            Request::LoadRows(rows, reply) => {
                let loaded = self.sequencer.load_rows(rows);
                if loaded.is_ok() {
                    self.last_sample = None;
                }
                let _ = reply.send(loaded);
            }
            Request::SetParameters(parameters) => {
                debug!(?parameters, "Parameters replaced");
                self.sequencer.set_parameters(parameters);
            }
        }
    }

    async fn handle_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Received { role: LinkRole::Control, record } => {
                let message = protocol::parse_response(&record);
                trace!(?message, "Control message");
                if let Some(command) = self.sequencer.on_control(message).await {
                    self.send_command(&command).await;
                }
            }
            LinkEvent::Received { role: LinkRole::Data, record } => {
                if let Some(sample) = self.sequencer.on_telemetry(&record) {
                    self.last_sample = Some(sample);
                }
            }
            LinkEvent::Fault(fault) => {
                error!(role = %fault.role, kind = %fault.kind, "Link fault: {}", fault.message);
            }
        }
    }

    async fn send_command(&mut self, command: &ControlCommand) {
        let Some(packet) = command.to_packet() else {
            warn!(?command, "Command could not be encoded, not sent");
            return;
        };
        match self.control.send(&packet).await {
            Ok(()) => self.sequencer.command_sent(command),
            Err(e) => warn!(packet = %packet, "Control packet not sent: {}", e),
        }
    }

    async fn poll(&mut self) {
        if !self.sequencer.wants_telemetry() || !self.data.is_connected() {
            return;
        }
        if let Err(e) = self.data.send(&self.settings.request_token).await {
            debug!("Telemetry poll not sent: {}", e);
        }
    }

    fn publish(&self) {
        let sequencer = &self.sequencer;
        let target = sequencer.target();
        let next = RunStatus {
            phase: sequencer.phase(),
            row: sequencer.row(),
            remaining: sequencer.remaining(),
            material: target.map(|t| t.material.clone()),
            target_weight: target.map(|t| t.target_weight),
            last_weight: sequencer.last_weight(),
            last_actuation: sequencer.last_actuation(),
            last_sample: self.last_sample,
            control: self.control.state(),
            data: self.data.state(),
        };

        self.status.send_if_modified(|current| {
            if **current == next {
                false
            } else {
                *current = Arc::new(next);
                true
            }
        });
    }
}

//! TCP links to the rig.
//!
//! A [`Link`] owns one TCP connection. Connecting spawns a receive task that reads the
//! socket with a timeout, splits the byte stream into protocol records and hands each
//! record to the receive callback. Faults move the link to
//! [`LinkState::Disconnected`] and are reported once through the error callback; they
//! are never propagated as panics. The control and data channels are two independent
//! links.
//!
//! Callbacks run on the receive task and must return quickly. The usual wiring is
//! [`LinkCallbacks::forward_to`], which enqueues [`LinkEvent`]s for a single consumer.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{ConnectionErrorKind, DoserError, Result};

mod framing;


pub use framing::{FrameMode, RecordFramer};

/// Default socket timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default receive buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 10240;

/// Quiet period after which an unterminated record is delivered as is.
const SETTLE_DELAY: Duration = Duration::from_millis(50);

/// Which of the two rig channels a link carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkRole {
    /// Command/response handshake.
    Control,
    /// Telemetry polling.
    Data,
}

impl LinkRole {
    /// Record grammar spoken on this channel.
    pub fn frame_mode(self) -> FrameMode {
        match self {
            LinkRole::Control => FrameMode::Control,
            LinkRole::Data => FrameMode::Telemetry,
        }
    }
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkRole::Control => f.write_str("control"),
            LinkRole::Data => f.write_str("data"),
        }
    }
}

/// Connection state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connected,
}

/// Where and how a link connects.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    pub host: String,
    pub port: u16,
    /// Bounds connecting, each read and each write.
    pub timeout: Duration,
    /// Size of a single socket read, and of the largest partial record held back.
    pub buffer_size: usize,
}

impl LinkConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, timeout: DEFAULT_TIMEOUT, buffer_size: DEFAULT_BUFFER_SIZE }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// `host:port`, for logs and errors.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A link fault as delivered to the error callback.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkFault {
    pub role: LinkRole,
    pub kind: ConnectionErrorKind,
    pub message: String,
}

impl LinkFault {
    fn new(role: LinkRole, error: &DoserError) -> Self {
        Self {
            role,
            kind: error.connection_kind().unwrap_or(ConnectionErrorKind::Io),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for LinkFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} link: {}", self.role, self.message)
    }
}

/// Something a link reports to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// One complete protocol record.
    Received { role: LinkRole, record: String },
    /// The link failed and is now disconnected.
    Fault(LinkFault),
}

pub type ReceiveCallback = Arc<dyn Fn(String) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(LinkFault) + Send + Sync>;

/// Receive and error callbacks of a link.
#[derive(Clone)]
pub struct LinkCallbacks {
    on_receive: ReceiveCallback,
    on_error: ErrorCallback,
}

impl LinkCallbacks {
    pub fn new(
        on_receive: impl Fn(String) + Send + Sync + 'static,
        on_error: impl Fn(LinkFault) + Send + Sync + 'static,
    ) -> Self {
        Self { on_receive: Arc::new(on_receive), on_error: Arc::new(on_error) }
    }

    /// Callbacks that enqueue every record and fault as a [`LinkEvent`].
    pub fn forward_to(role: LinkRole, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        let faults = events.clone();
        Self::new(
            move |record| {
                if events.send(LinkEvent::Received { role, record }).is_err() {
                    trace!(%role, "Event consumer gone, dropping record");
                }
            },
            move |fault| {
                if faults.send(LinkEvent::Fault(fault)).is_err() {
                    trace!(%role, "Event consumer gone, dropping fault");
                }
            },
        )
    }

    /// Callbacks that discard everything.
    pub fn noop() -> Self {
        Self::new(|_| {}, |_| {})
    }
}

impl fmt::Debug for LinkCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkCallbacks").finish_non_exhaustive()
    }
}

/// Write side of a live connection.
struct Writer {
    stream: OwnedWriteHalf,
    endpoint: String,
    timeout: Duration,
    /// Stops the receive task of the same connection.
    cancel: CancellationToken,
}

/// Receive task of a live connection.
struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Shared {
    role: LinkRole,
    config: Mutex<LinkConfig>,
    callbacks: LinkCallbacks,
    state: watch::Sender<LinkState>,
    writer: Mutex<Option<Writer>>,
    session: Mutex<Option<Session>>,
}

impl Shared {
    /// Move to `Disconnected` and report, unless already disconnected.
    fn fail(&self, error: &DoserError) {
        let transitioned = self.state.send_if_modified(|state| {
            if *state == LinkState::Connected {
                *state = LinkState::Disconnected;
                true
            } else {
                false
            }
        });

        if transitioned {
            error!(role = %self.role, %error, "Link fault, disconnected");
            (self.callbacks.on_error)(LinkFault::new(self.role, error));
        }
    }
}

/// One TCP connection to the rig.
pub struct Link {
    inner: Arc<Shared>,
}

impl Link {
    pub fn new(role: LinkRole, config: LinkConfig, callbacks: LinkCallbacks) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            inner: Arc::new(Shared {
                role,
                config: Mutex::new(config),
                callbacks,
                state,
                writer: Mutex::new(None),
                session: Mutex::new(None),
            }),
        }
    }

    pub fn role(&self) -> LinkRole {
        self.inner.role
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Receiver observing every state change.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.inner.state.subscribe()
    }

    pub async fn config(&self) -> LinkConfig {
        self.inner.config.lock().await.clone()
    }

    /// Change the endpoint used by the next [`Link::connect`].
    pub async fn set_endpoint(&self, host: impl Into<String>, port: u16) {
        let mut config = self.inner.config.lock().await;
        config.host = host.into();
        config.port = port;
        info!(role = %self.inner.role, endpoint = %config.endpoint(), "Link endpoint updated");
    }

    /// Open the connection and start the receive task.
    ///
    /// Failures are reported through the error callback as well as returned. Connecting
    /// an already connected link does nothing.
    pub async fn connect(&self) -> Result<()> {
        let role = self.inner.role;
        let mut session = self.inner.session.lock().await;

        if self.is_connected() {
            debug!(%role, "Link already connected");
            return Ok(());
        }

        if let Some(finished) = session.take() {
            finished.cancel.cancel();
            if let Err(e) = finished.task.await {
                warn!(%role, "Previous receive task ended abnormally: {}", e);
            }
        }

        let config = self.inner.config.lock().await.clone();
        let endpoint = config.endpoint();
        info!(%role, %endpoint, "Connecting");

        let connect = TcpStream::connect((config.host.as_str(), config.port));
        let connected = tokio::time::timeout(config.timeout, connect).await;
        let stream = match connected {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.connect_failed(DoserError::connection_io(&endpoint, e))),
            Err(_) => {
                return Err(self.connect_failed(DoserError::connection_failed(
                    ConnectionErrorKind::Timeout,
                    &endpoint,
                )));
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(%role, "Could not disable Nagle: {}", e);
        }

        let (reader, writer) = stream.into_split();
        let cancel = CancellationToken::new();

        *self.inner.writer.lock().await = Some(Writer {
            stream: writer,
            endpoint: endpoint.clone(),
            timeout: config.timeout,
            cancel: cancel.clone(),
        });
        self.inner.state.send_replace(LinkState::Connected);

        let task = tokio::spawn(receive_loop(
            Arc::clone(&self.inner),
            reader,
            endpoint.clone(),
            config.timeout,
            config.buffer_size,
            cancel.clone(),
        ));
        *session = Some(Session { cancel, task });

        info!(%role, %endpoint, "Connected");
        Ok(())
    }

    fn connect_failed(&self, error: DoserError) -> DoserError {
        error!(role = %self.inner.role, %error, "Connect failed");
        (self.inner.callbacks.on_error)(LinkFault::new(self.inner.role, &error));
        error
    }

    /// Stop the receive task and close the socket. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let role = self.inner.role;
        let mut session = self.inner.session.lock().await;
        let previous = self.inner.state.send_replace(LinkState::Disconnected);

        if let Some(active) = session.take() {
            active.cancel.cancel();
            if let Err(e) = active.task.await {
                warn!(%role, "Receive task ended abnormally: {}", e);
            }
        }

        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            if let Err(e) = writer.stream.shutdown().await {
                debug!(%role, "Socket shutdown failed: {}", e);
            }
        }

        if previous == LinkState::Connected {
            info!(%role, "Disconnected");
        }
    }

    /// Write `text` to the socket.
    ///
    /// Fails fast with [`DoserError::NotConnected`] when disconnected. A write fault
    /// disconnects the link and is reported through the error callback.
    pub async fn send(&self, text: &str) -> Result<()> {
        let role = self.inner.role;

        if !text.is_ascii() {
            warn!(%role, text, "Refusing to send non-ASCII text");
            return Err(DoserError::protocol("outgoing record", "text is not ASCII"));
        }
        if !self.is_connected() {
            warn!(%role, "Send failed: link not connected");
            return Err(DoserError::NotConnected);
        }

        let mut slot = self.inner.writer.lock().await;
        let Some(writer) = slot.as_mut() else {
            warn!(%role, "Send failed: link not connected");
            return Err(DoserError::NotConnected);
        };

        let written =
            tokio::time::timeout(writer.timeout, writer.stream.write_all(text.as_bytes())).await;
        let error = match written {
            Ok(Ok(())) => {
                debug!(%role, text, "Sent");
                return Ok(());
            }
            Ok(Err(e)) => DoserError::connection_io(&writer.endpoint, e),
            Err(_) => DoserError::Timeout { duration: writer.timeout },
        };

        if let Some(failed) = slot.take() {
            failed.cancel.cancel();
        }
        drop(slot);
        self.inner.fail(&error);
        Err(error)
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Ok(mut session) = self.inner.session.try_lock() {
            if let Some(active) = session.take() {
                debug!(role = %self.inner.role, "Dropping link, cancelling receive task");
                active.cancel.cancel();
            }
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Read, frame and deliver records until cancelled or the connection fails.
async fn receive_loop(
    shared: Arc<Shared>,
    mut reader: OwnedReadHalf,
    endpoint: String,
    read_timeout: Duration,
    buffer_size: usize,
    cancel: CancellationToken,
) {
    let role = shared.role;
    let mut framer = RecordFramer::new(role.frame_mode(), buffer_size);
    let mut buf = vec![0u8; buffer_size.max(1)];
    debug!(%role, "Receive task started");

    loop {
        let settling = framer.is_settling();
        let wait = if settling { SETTLE_DELAY.min(read_timeout) } else { read_timeout };
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(%role, "Receive task cancelled");
                break;
            }
            read = tokio::time::timeout(wait, reader.read(&mut buf)) => read,
        };

        let fault = match read {
            Err(_) if settling => {
                if let Some(record) = framer.settle() {
                    debug!(%role, record = %record, "Record received");
                    (shared.callbacks.on_receive)(record);
                }
                continue;
            }
            Err(_) => {
                trace!(%role, "Read timed out with no data");
                continue;
            }
            Ok(Ok(0)) => {
                warn!(%role, %endpoint, "Peer closed the connection");
                DoserError::connection_failed(ConnectionErrorKind::Closed, &endpoint)
            }
            Ok(Ok(n)) => {
                let chunk = String::from_utf8_lossy(&buf[..n]);
                trace!(%role, bytes = n, chunk = ?chunk, "Chunk received");
                for record in framer.push(&chunk) {
                    debug!(%role, record = %record, "Record received");
                    (shared.callbacks.on_receive)(record);
                }
                continue;
            }
            Ok(Err(e)) => DoserError::connection_io(&endpoint, e),
        };

        shared.fail(&fault);
        shared.writer.lock().await.take();
        break;
    }

    debug!(%role, "Receive task ended");
}

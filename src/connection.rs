//! Live camera-stream connection state machine.
//!
//! One [`StreamConnection`] owns the stream of one device tile. It starts a transport
//! attempt, forwards frames to a [`DisplaySurface`], and on failure either schedules a
//! retry with backoff or gives up once the retry ceiling is reached.
//!
//! # Generations
//!
//! Every piece of asynchronous work the connection starts (an attempt or a retry
//! timer) is tagged with the generation current at the time. `pause`, `close` and a
//! device change bump the generation, so completions that were already in flight are
//! recognized as stale and dropped instead of resurrecting a torn-down stream.
//!
//! # Driving the connection
//!
//! Attempts and timers run as tokio tasks and report back through a channel owned by
//! the connection. The host applies them on its own thread, either with [`poll`] from
//! a UI frame loop or with [`process_next`] from async code:
//!
//! ```no_run
//! use std::sync::Arc;
//! use aquarium_stream::connection::{ConnectionConfig, StreamConnection};
//! use aquarium_stream::transport::mock::MockTransport;
//!
//! # async fn run() {
//! let transport = Arc::new(MockTransport::new());
//! let mut conn = StreamConnection::new(
//!     0,
//!     transport,
//!     ConnectionConfig::default(),
//!     tokio::runtime::Handle::current(),
//! );
//! conn.open(0);
//! while conn.process_next().await {
//!     println!("{}", conn.status_text());
//! }
//! # }
//! ```
//!
//! [`poll`]: StreamConnection::poll
//! [`process_next`]: StreamConnection::process_next

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::backoff::{effective_delay, Backoff, BackoffPolicy};
use crate::error::{ErrorDescriptor, StreamError, TransportError};
use crate::transport::{DeviceId, Frame, FrameSource, FrameTransport};

/// Attempt epoch. Incremented whenever in-flight work must be invalidated.
pub type Generation = u64;

/// Completions a connection buffers before the attempt starts dropping frames.
///
/// Errors and retry expiries are never dropped; the attempt waits for room instead.
pub const COMPLETION_QUEUE_CAPACITY: usize = 16;

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// No attempt, no timer.
    Idle,
    /// An attempt is running but no frame has arrived yet.
    Connecting,
    /// Frames are arriving.
    Streaming,
    /// Waiting for the retry timer.
    Retrying,
    /// Gave up; only `resume` or `open` start a new attempt.
    Failed,
}

impl Phase {
    /// True while an attempt is running.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Streaming)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Consecutive transient failures after which the connection gives up.
    pub retry_ceiling: u32,
    /// Report a transient error when no frame arrives for this long.
    pub frame_timeout: Option<Duration>,
    /// Report a transient error when the transport has not connected after this long.
    pub connect_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: 3,
            frame_timeout: Some(Duration::from_secs(10)),
            connect_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Read-only snapshot of a connection, handed to the display surface.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    /// Device being streamed.
    pub device_id: DeviceId,
    /// Externally paused (capture in progress).
    pub paused: bool,
    /// Current phase.
    pub phase: Phase,
    /// Consecutive failures since the last frame.
    pub failure_count: u32,
    /// Most recent transport error.
    pub last_error: Option<ErrorDescriptor>,
    /// Why the connection is `Failed`.
    pub failure: Option<StreamError>,
    /// Current generation.
    pub generation: Generation,
    /// Configured retry ceiling.
    pub retry_ceiling: u32,
    /// When the pending retry fires, while `Retrying`.
    pub next_retry_at: Option<Instant>,
}

impl ConnectionState {
    /// Short status line for the tile overlay.
    #[must_use]
    pub fn status_text(&self) -> String {
        match self.phase {
            Phase::Idle if self.paused => "Paused".to_string(),
            Phase::Idle => "Idle".to_string(),
            Phase::Connecting => "Connecting...".to_string(),
            Phase::Streaming => "Live".to_string(),
            Phase::Retrying => format!(
                "Reconnecting (attempt {}/{})...",
                self.failure_count + 1,
                self.retry_ceiling
            ),
            Phase::Failed => match &self.last_error {
                Some(err) => format!("Camera unavailable: {}", friendly_error(err)),
                None => "Camera unavailable".to_string(),
            },
        }
    }

    /// Whole seconds until the pending retry, rounded up.
    #[must_use]
    pub fn seconds_until_retry(&self) -> Option<u64> {
        let due = self.next_retry_at?;
        let remaining = due.saturating_duration_since(Instant::now());
        Some(remaining.as_millis().div_ceil(1_000) as u64)
    }
}

/// Render a transport error for end users.
#[must_use]
pub fn friendly_error(err: &ErrorDescriptor) -> String {
    let lower = err.message.to_lowercase();
    match err.code {
        Some(1008) | Some(404) | Some(410) => "camera is not available".to_string(),
        Some(403) => "access to this camera was denied".to_string(),
        Some(code) if (500..600).contains(&code) => "the backend reported an error".to_string(),
        _ if lower.contains("refused")
            || lower.contains("connection failed")
            || lower.contains("connect timed out") =>
        {
            "cannot reach the backend".to_string()
        }
        _ if lower.contains("timed out") || lower.contains("no frames") => {
            "the camera stopped sending frames".to_string()
        }
        _ => err.message.clone(),
    }
}

/// Where frames and status changes are rendered.
pub trait DisplaySurface: Send {
    /// Render a frame.
    fn show_frame(&mut self, frame: &Frame);

    /// Render a status change.
    fn show_status(&mut self, _state: &ConnectionState) {}
}

impl<S: DisplaySurface + ?Sized> DisplaySurface for Box<S> {
    fn show_frame(&mut self, frame: &Frame) {
        (**self).show_frame(frame);
    }

    fn show_status(&mut self, state: &ConnectionState) {
        (**self).show_status(state);
    }
}

/// Surface that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSurface;

impl DisplaySurface for NullSurface {
    fn show_frame(&mut self, _frame: &Frame) {}
}

#[derive(Debug)]
enum Signal {
    Frame(Frame),
    Failed(TransportError),
    RetryDue,
}

#[derive(Debug)]
struct Completion {
    generation: Generation,
    signal: Signal,
}

/// Running attempt. Dropping it aborts the task, which drops the frame source.
struct AttemptHandle {
    task: JoinHandle<()>,
}

impl Drop for AttemptHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Scheduled retry. Dropping it cancels the timer.
struct RetryTimer {
    task: JoinHandle<()>,
    due_at: Instant,
}

impl Drop for RetryTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Reconnecting stream of one camera.
///
/// All state changes happen through `&mut self` on the host's thread. The operations
/// never fail; transport problems are visible through [`StreamConnection::state`].
/// Dropping the connection cancels its attempt and retry timer.
pub struct StreamConnection {
    device_id: DeviceId,
    paused: bool,
    phase: Phase,
    failure_count: u32,
    last_error: Option<ErrorDescriptor>,
    failure: Option<StreamError>,
    generation: Generation,
    attempt: Option<AttemptHandle>,
    pending_retry: Option<RetryTimer>,
    config: ConnectionConfig,
    backoff: Arc<dyn BackoffPolicy>,
    transport: Arc<dyn FrameTransport>,
    surface: Box<dyn DisplaySurface>,
    runtime: Handle,
    tx: mpsc::Sender<Completion>,
    rx: mpsc::Receiver<Completion>,
}

impl StreamConnection {
    /// Create an idle connection for `device_id`. Nothing runs until [`open`](Self::open).
    pub fn new(
        device_id: impl Into<DeviceId>,
        transport: Arc<dyn FrameTransport>,
        config: ConnectionConfig,
        runtime: Handle,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMPLETION_QUEUE_CAPACITY);
        Self {
            device_id: device_id.into(),
            paused: false,
            phase: Phase::Idle,
            failure_count: 0,
            last_error: None,
            failure: None,
            generation: 0,
            attempt: None,
            pending_retry: None,
            config,
            backoff: Arc::new(Backoff::default()),
            transport,
            surface: Box::new(NullSurface),
            runtime,
            tx,
            rx,
        }
    }

    /// Use `policy` for retry delays.
    #[must_use]
    pub fn with_backoff(mut self, policy: impl BackoffPolicy + 'static) -> Self {
        self.backoff = Arc::new(policy);
        self
    }

    /// Use a shared backoff policy.
    #[must_use]
    pub fn with_shared_backoff(mut self, policy: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = policy;
        self
    }

    /// Render into `surface`.
    #[must_use]
    pub fn with_surface(mut self, surface: impl DisplaySurface + 'static) -> Self {
        self.surface = Box::new(surface);
        self
    }

    /// Start streaming `device_id`.
    ///
    /// A different device than the current one is a device change. While paused the
    /// connection stays idle. Already connecting or streaming is a no-op.
    pub fn open(&mut self, device_id: impl Into<DeviceId>) {
        let device_id = device_id.into();
        if device_id != self.device_id {
            self.set_device(device_id);
            return;
        }
        self.open_current();
    }

    /// Stop streaming until [`resume`](Self::resume). Idempotent.
    pub fn pause(&mut self) {
        if !self.paused {
            info!(device = %self.device_id, "Pausing stream");
        }
        self.paused = true;
        self.teardown();
        self.failure_count = 0;
        self.failure = None;
        self.set_phase(Phase::Idle);
    }

    /// Clear the pause and reconnect unless already connecting or streaming.
    pub fn resume(&mut self) {
        if self.paused {
            info!(device = %self.device_id, "Resuming stream");
        }
        self.paused = false;
        if self.phase.is_active() {
            return;
        }
        self.open_current();
    }

    /// Stop everything and return to `Idle`. Safe to call repeatedly from any phase.
    pub fn close(&mut self) {
        if self.phase != Phase::Idle || self.paused {
            debug!(device = %self.device_id, phase = %self.phase, "Closing stream");
        }
        self.teardown();
        self.paused = false;
        self.failure_count = 0;
        self.last_error = None;
        self.failure = None;
        // Everything still queued belongs to an older generation
        while self.rx.try_recv().is_ok() {}
        self.set_phase(Phase::Idle);
    }

    /// Switch to another device. The same device is a no-op.
    pub fn set_device(&mut self, device_id: impl Into<DeviceId>) {
        let device_id = device_id.into();
        if device_id == self.device_id {
            return;
        }
        info!(from = %self.device_id, to = %device_id, "Switching device");
        self.teardown();
        self.device_id = device_id;
        self.failure_count = 0;
        self.last_error = None;
        self.failure = None;
        self.set_phase(Phase::Idle);
        self.open_current();
    }

    /// Apply a frame delivered by the attempt of `generation`.
    pub fn on_frame(&mut self, generation: Generation, frame: Frame) -> Result<(), StreamError> {
        self.check_generation(generation)?;
        if self.attempt.is_none() {
            return Err(self.stale(generation));
        }

        self.failure_count = 0;
        self.last_error = None;
        self.failure = None;
        if self.phase != Phase::Streaming {
            info!(device = %self.device_id, generation, "Stream live");
            self.set_phase(Phase::Streaming);
        }
        self.surface.show_frame(&frame);
        Ok(())
    }

    /// Apply a failure reported by the attempt of `generation`.
    pub fn on_transport_error(
        &mut self,
        generation: Generation,
        err: TransportError,
    ) -> Result<(), StreamError> {
        self.check_generation(generation)?;
        if self.attempt.is_none() {
            return Err(self.stale(generation));
        }

        self.attempt = None;
        self.last_error = Some(err.descriptor().clone());

        match err {
            TransportError::Terminal(descriptor) => {
                warn!(
                    device = %self.device_id,
                    error = %descriptor,
                    "Camera unavailable, not retrying"
                );
                self.failure = Some(StreamError::TerminalTransport(descriptor));
                self.set_phase(Phase::Failed);
            }
            TransportError::Transient(descriptor) => {
                self.failure_count += 1;
                if self.failure_count >= self.config.retry_ceiling {
                    warn!(
                        device = %self.device_id,
                        attempts = self.failure_count,
                        error = %descriptor,
                        "Giving up after repeated failures"
                    );
                    self.failure = Some(StreamError::ExhaustedRetries {
                        attempts: self.failure_count,
                        last: descriptor,
                    });
                    self.set_phase(Phase::Failed);
                } else if self.paused {
                    self.set_phase(Phase::Idle);
                } else {
                    self.schedule_retry(&descriptor);
                }
            }
        }
        Ok(())
    }

    /// Apply every completion that is already queued. Returns how many were applied.
    pub fn poll(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(completion) = self.rx.try_recv() {
            if self.dispatch(completion) {
                applied += 1;
            }
        }
        applied
    }

    /// Wait for the next completion and apply it.
    ///
    /// Returns true if it changed the connection, false if it was stale.
    pub async fn process_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(completion) => self.dispatch(completion),
            None => false,
        }
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState {
            device_id: self.device_id.clone(),
            paused: self.paused,
            phase: self.phase,
            failure_count: self.failure_count,
            last_error: self.last_error.clone(),
            failure: self.failure.clone(),
            generation: self.generation,
            retry_ceiling: self.config.retry_ceiling,
            next_retry_at: self.pending_retry.as_ref().map(|t| t.due_at),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Device being streamed.
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Whether the connection is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Consecutive failures since the last frame.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Most recent transport error.
    #[must_use]
    pub fn last_error(&self) -> Option<&ErrorDescriptor> {
        self.last_error.as_ref()
    }

    /// Current generation.
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Whether a transport attempt is running.
    #[must_use]
    pub fn has_active_attempt(&self) -> bool {
        self.attempt.is_some()
    }

    /// Whether a retry timer is pending.
    #[must_use]
    pub fn has_pending_retry(&self) -> bool {
        self.pending_retry.is_some()
    }

    /// Whole seconds until the pending retry, rounded up.
    #[must_use]
    pub fn seconds_until_retry(&self) -> Option<u64> {
        self.state().seconds_until_retry()
    }

    /// Status line for the tile overlay.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.state().status_text()
    }

    fn open_current(&mut self) {
        if self.paused {
            debug!(device = %self.device_id, "Open while paused, staying idle");
            self.teardown();
            self.set_phase(Phase::Idle);
            return;
        }

        match self.phase {
            Phase::Connecting | Phase::Streaming => {
                debug!(device = %self.device_id, "Already connected");
                return;
            }
            Phase::Failed => {
                self.failure_count = 0;
                self.failure = None;
            }
            Phase::Retrying | Phase::Idle => {}
        }
        self.start_attempt();
    }

    fn start_attempt(&mut self) {
        // One of {nothing, attempt, timer} at a time
        self.pending_retry = None;
        self.attempt = None;
        self.generation += 1;

        let generation = self.generation;
        info!(
            device = %self.device_id,
            generation,
            transport = self.transport.name(),
            attempt = self.failure_count + 1,
            "Connecting to camera stream"
        );

        let attempt = run_attempt(
            Arc::clone(&self.transport),
            self.device_id.clone(),
            generation,
            self.config.clone(),
            self.tx.clone(),
        );
        let tx = self.tx.clone();
        let device = self.device_id.clone();
        let task = self.runtime.spawn(async move {
            if AssertUnwindSafe(attempt).catch_unwind().await.is_err() {
                warn!(device = %device, generation, "Transport panicked");
                let _ = tx
                    .send(Completion {
                        generation,
                        signal: Signal::Failed(TransportError::transient("transport panicked")),
                    })
                    .await;
            }
        });
        self.attempt = Some(AttemptHandle { task });
        self.set_phase(Phase::Connecting);
    }

    fn schedule_retry(&mut self, cause: &ErrorDescriptor) {
        let delay = effective_delay(self.backoff.as_ref(), self.failure_count);
        self.generation += 1;
        let generation = self.generation;

        info!(
            device = %self.device_id,
            attempt = self.failure_count,
            delay_ms = delay.as_millis() as u64,
            error = %cause,
            "Scheduling reconnect"
        );

        let tx = self.tx.clone();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx
                .send(Completion {
                    generation,
                    signal: Signal::RetryDue,
                })
                .await;
        });
        self.pending_retry = Some(RetryTimer {
            task,
            due_at: Instant::now() + delay,
        });
        self.set_phase(Phase::Retrying);
    }

    fn on_retry_due(&mut self, generation: Generation) -> Result<(), StreamError> {
        self.check_generation(generation)?;
        if self.pending_retry.take().is_none() || self.phase != Phase::Retrying {
            return Err(self.stale(generation));
        }
        if self.paused {
            self.set_phase(Phase::Idle);
            return Ok(());
        }
        self.start_attempt();
        Ok(())
    }

    /// Cancel the retry timer, detach the transport and invalidate in-flight work.
    fn teardown(&mut self) {
        self.pending_retry = None;
        self.attempt = None;
        self.generation += 1;
    }

    fn dispatch(&mut self, completion: Completion) -> bool {
        let Completion { generation, signal } = completion;
        let result = match signal {
            Signal::Frame(frame) => self.on_frame(generation, frame),
            Signal::Failed(err) => self.on_transport_error(generation, err),
            Signal::RetryDue => self.on_retry_due(generation),
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                debug!(device = %self.device_id, %err, "Dropping completion");
                false
            }
        }
    }

    fn check_generation(&self, generation: Generation) -> Result<(), StreamError> {
        if generation == self.generation {
            Ok(())
        } else {
            Err(self.stale(generation))
        }
    }

    fn stale(&self, generation: Generation) -> StreamError {
        StreamError::StaleCallback {
            generation,
            current: self.generation,
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        let changed = self.phase != phase;
        self.phase = phase;
        if changed || matches!(phase, Phase::Retrying | Phase::Failed) {
            let state = self.state();
            self.surface.show_status(&state);
        }
    }
}

impl fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConnection")
            .field("device_id", &self.device_id)
            .field("paused", &self.paused)
            .field("phase", &self.phase)
            .field("failure_count", &self.failure_count)
            .field("generation", &self.generation)
            .field("transport", &self.transport.name())
            .finish_non_exhaustive()
    }
}

/// Connect, then pump frames until the source fails or the task is aborted.
async fn run_attempt(
    transport: Arc<dyn FrameTransport>,
    device: DeviceId,
    generation: Generation,
    config: ConnectionConfig,
    tx: mpsc::Sender<Completion>,
) {
    let fail = |err: TransportError| {
        let tx = tx.clone();
        async move {
            let _ = tx
                .send(Completion {
                    generation,
                    signal: Signal::Failed(err),
                })
                .await;
        }
    };

    let connected = match config.connect_timeout {
        Some(limit) => tokio::time::timeout(limit, transport.connect(&device))
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::transient(format!(
                    "connect timed out after {}",
                    format_limit(limit)
                )))
            }),
        None => transport.connect(&device).await,
    };
    let mut source = match connected {
        Ok(source) => source,
        Err(err) => {
            fail(err).await;
            return;
        }
    };

    let mut sequence = 0u64;
    let mut dropped = 0u64;
    loop {
        match next_frame(source.as_mut(), config.frame_timeout).await {
            Ok(data) => {
                sequence += 1;
                let frame = Frame {
                    device: device.clone(),
                    sequence,
                    data,
                    received_at: Instant::now(),
                };
                match tx.try_send(Completion {
                    generation,
                    signal: Signal::Frame(frame),
                }) {
                    Ok(()) => {}
                    // Host is behind; a newer frame will follow
                    Err(TrySendError::Full(_)) => {
                        dropped += 1;
                        trace!(device = %device, sequence, dropped, "Dropping frame");
                    }
                    Err(TrySendError::Closed(_)) => return,
                }
            }
            Err(err) => {
                debug!(device = %device, generation, error = %err, "Frame source failed");
                fail(err).await;
                return;
            }
        }
    }
}

async fn next_frame(
    source: &mut dyn FrameSource,
    frame_timeout: Option<Duration>,
) -> Result<bytes::Bytes, TransportError> {
    match frame_timeout {
        Some(limit) => tokio::time::timeout(limit, source.next_frame())
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::transient(format!(
                    "no frames for {}",
                    format_limit(limit)
                )))
            }),
        None => source.next_frame().await,
    }
}

/// `5s` for whole seconds, `500ms` otherwise.
fn format_limit(limit: Duration) -> String {
    if limit.subsec_millis() == 0 && limit.as_secs() > 0 {
        format!("{}s", limit.as_secs())
    } else {
        format!("{}ms", limit.as_millis())
    }
}

//! In-memory transport for tests and offline demos.
//!
//! Connect outcomes are scripted per call; accepted connections get a [`MockFeed`]
//! through which the caller pushes frames or errors. The transport counts how many
//! sources are alive at once so tests can assert that a connection never holds two.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{DeviceId, FrameSource, FrameTransport};
use crate::error::TransportError;

/// Scripted result of one `connect` call.
#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    /// Succeed and hand out a feed.
    Accept,
    /// Fail with the given error.
    Fail(TransportError),
    /// Never complete (a connect that hangs until cancelled).
    Hang,
}

#[derive(Default)]
struct MockState {
    script: VecDeque<ConnectOutcome>,
    connects: Vec<DeviceId>,
    feeds: Vec<MockFeed>,
    live: usize,
    peak_live: usize,
}

/// Scriptable [`FrameTransport`].
///
/// Unscripted connects are accepted. With [`MockTransport::generating`] every accepted
/// source also produces a synthetic frame on a fixed interval.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    generate_every: Option<Duration>,
}

impl MockTransport {
    /// Transport that accepts every connect and waits for fed frames.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport whose sources emit a synthetic frame every `period`.
    #[must_use]
    pub fn generating(period: Duration) -> Self {
        Self {
            state: Arc::default(),
            generate_every: Some(period),
        }
    }

    /// Queue outcomes for the next `connect` calls, in order.
    pub fn script(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        self.lock().script.extend(outcomes);
    }

    /// Number of `connect` calls so far.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.lock().connects.len()
    }

    /// Devices passed to `connect`, in call order.
    #[must_use]
    pub fn connected_devices(&self) -> Vec<DeviceId> {
        self.lock().connects.clone()
    }

    /// Sources currently alive.
    #[must_use]
    pub fn live_sources(&self) -> usize {
        self.lock().live
    }

    /// Highest number of sources ever alive at the same time.
    #[must_use]
    pub fn peak_live_sources(&self) -> usize {
        self.lock().peak_live
    }

    /// Feed of the most recently accepted connection.
    #[must_use]
    pub fn latest_feed(&self) -> Option<MockFeed> {
        self.lock().feeds.last().cloned()
    }

    /// Feed of the `index`-th accepted connection (0-based).
    #[must_use]
    pub fn feed(&self, index: usize) -> Option<MockFeed> {
        self.lock().feeds.get(index).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl FrameTransport for MockTransport {
    async fn connect(&self, device: &DeviceId) -> Result<Box<dyn FrameSource>, TransportError> {
        let outcome = {
            let mut state = self.lock();
            state.connects.push(device.clone());
            state.script.pop_front().unwrap_or(ConnectOutcome::Accept)
        };

        match outcome {
            ConnectOutcome::Accept => {}
            ConnectOutcome::Fail(err) => return Err(err),
            ConnectOutcome::Hang => std::future::pending::<()>().await,
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let live = LiveGuard::new(Arc::clone(&self.state));
        self.lock().feeds.push(MockFeed { tx });

        let source = match self.generate_every {
            Some(period) => MockSource::Generated {
                ticker: tokio::time::interval(period),
                counter: 0,
                feed: rx,
                _live: live,
            },
            None => MockSource::Fed { feed: rx, _live: live },
        };
        Ok(Box::new(source))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Handle for pushing frames or errors into one accepted mock connection.
#[derive(Debug, Clone)]
pub struct MockFeed {
    tx: mpsc::UnboundedSender<Result<Bytes, TransportError>>,
}

impl MockFeed {
    /// Deliver a frame. Returns false once the source has been released.
    pub fn push_frame(&self, data: impl Into<Bytes>) -> bool {
        self.tx.send(Ok(data.into())).is_ok()
    }

    /// Fail the source with `err`. Returns false once the source has been released.
    pub fn push_error(&self, err: TransportError) -> bool {
        self.tx.send(Err(err)).is_ok()
    }

    /// True once the consuming source has been dropped.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.tx.is_closed()
    }
}

struct LiveGuard {
    state: Arc<Mutex<MockState>>,
}

impl LiveGuard {
    fn new(state: Arc<Mutex<MockState>>) -> Self {
        {
            let mut s = state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            s.live += 1;
            s.peak_live = s.peak_live.max(s.live);
        }
        Self { state }
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let mut s = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        s.live = s.live.saturating_sub(1);
    }
}

enum MockSource {
    Fed {
        feed: mpsc::UnboundedReceiver<Result<Bytes, TransportError>>,
        _live: LiveGuard,
    },
    Generated {
        ticker: tokio::time::Interval,
        counter: u64,
        feed: mpsc::UnboundedReceiver<Result<Bytes, TransportError>>,
        _live: LiveGuard,
    },
}

#[async_trait]
impl FrameSource for MockSource {
    async fn next_frame(&mut self) -> Result<Bytes, TransportError> {
        match self {
            Self::Fed { feed, .. } => match feed.recv().await {
                Some(item) => item,
                None => Err(TransportError::transient("mock feed closed")),
            },
            Self::Generated {
                ticker,
                counter,
                feed,
                ..
            } => {
                tokio::select! {
                    Some(item) = feed.recv() => item,
                    _ = ticker.tick() => {
                        *counter += 1;
                        Ok(synthetic_frame(*counter))
                    }
                }
            }
        }
    }
}

/// JPEG-framed placeholder payload carrying a counter.
fn synthetic_frame(counter: u64) -> Bytes {
    let mut data = vec![0xff, 0xd8];
    data.extend_from_slice(&counter.to_be_bytes());
    data.extend_from_slice(&[0xff, 0xd9]);
    Bytes::from(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_outcomes_then_accept() {
        let transport = MockTransport::new();
        transport.script([ConnectOutcome::Fail(TransportError::terminal("gone"))]);

        assert!(transport.connect(&DeviceId::from(0)).await.is_err());
        let mut source = transport.connect(&DeviceId::from(0)).await.unwrap();
        assert_eq!(transport.connect_count(), 2);
        assert_eq!(transport.live_sources(), 1);

        let feed = transport.latest_feed().unwrap();
        assert!(feed.push_frame(Bytes::from_static(b"jpeg")));
        assert_eq!(&source.next_frame().await.unwrap()[..], b"jpeg");

        feed.push_error(TransportError::transient("reset"));
        assert!(source.next_frame().await.unwrap_err().is_retriable());

        drop(source);
        assert_eq!(transport.live_sources(), 0);
        assert_eq!(transport.peak_live_sources(), 1);
        assert!(feed.is_released());
    }

    #[tokio::test(start_paused = true)]
    async fn generating_source_ticks() {
        let transport = MockTransport::generating(Duration::from_millis(100));
        let mut source = transport.connect(&DeviceId::from(1)).await.unwrap();
        let first = source.next_frame().await.unwrap();
        let second = source.next_frame().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(&first[..2], &[0xff, 0xd8]);
    }
}

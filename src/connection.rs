//! Lifecycle of the push connection: connect, detect loss, reconnect with backoff.
//!
//! The manager runs one background task that only decodes frames and forwards
//! them; state changes are published on a `watch` channel so any number of
//! readers can observe connectivity without touching the task.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::LiveEvent;
use crate::sse::{SseDecoder, SseFrame};

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected yet: the first attempt and its retries
    Connecting,
    Connected,
    /// Was connected at least once and lost the stream
    Reconnecting,
    /// Retry budget exhausted or shut down; needs `reconnect()`
    Disconnected,
}

// ── Backoff ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed retries tolerated before giving up
    pub max_retries: u32,
    /// Upward stretch factor in `[0, 1]`; 0 disables jitter
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: 8,
            jitter: 0.2,
        }
    }
}

/// Exponential backoff: `base * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Un-jittered delay for the given retry number.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.policy
            .base_delay
            .saturating_mul(factor)
            .min(self.policy.max_delay)
    }

    /// Next delay with `sample` in `[0, 1)` as the jitter draw. `None` once the
    /// retry budget is spent.
    pub fn next_delay_with(&mut self, sample: f64) -> Option<Duration> {
        if self.attempt >= self.policy.max_retries {
            return None;
        }
        let delay = self.delay_for(self.attempt);
        let stretch = 1.0 + unit_fraction(self.policy.jitter) * unit_fraction(sample);
        self.attempt += 1;
        Some(delay.mul_f64(stretch).min(self.policy.max_delay))
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        let sample = rand::rng().random::<f64>();
        self.next_delay_with(sample)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Clamp into `[0, 1]`; NaN and infinities become 0.
pub(crate) fn unit_fraction(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

// ── Event source ──────────────────────────────────────────────────────────────

pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// Something that can open the raw push stream.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn open(&self) -> Result<ByteStream>;
}

/// `GET {endpoint}/api/events` as an SSE byte stream.
pub struct HttpEventSource {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpEventSource {
    pub fn new(endpoint: &str, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: format!("{}/api/events", endpoint.trim_end_matches('/')),
            api_key,
        }
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn open(&self) -> Result<ByteStream> {
        let mut req = self
            .http
            .get(&self.url)
            .header("Accept", "text/event-stream");
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", self.url))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("event stream error {}: {}", status, text));
        }

        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(anyhow::Error::from))
            .boxed())
    }
}

// ── Manager ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Control {
    Reconnect,
}

pub struct ConnectionManager {
    state: watch::Receiver<ConnectionState>,
    control: mpsc::UnboundedSender<Control>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Start connecting right away. Decoded events arrive on the returned receiver,
    /// which closes once the manager shuts down.
    pub fn connect(
        source: Arc<dyn EventSource>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<LiveEvent>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let worker = Worker {
            source,
            backoff: Backoff::new(policy),
            state: state_tx,
            control: control_rx,
            events: events_tx,
            cancel: cancel.clone(),
            ever_connected: false,
        };
        let task = tokio::spawn(worker.run());

        (
            Self {
                state: state_rx,
                control: control_tx,
                cancel,
                task: Some(task),
            },
            events_rx,
        )
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Retry now with a fresh budget. Cancels a pending retry wait and resumes
    /// after `Disconnected`; ignored while connected.
    pub fn reconnect(&self) {
        if self.control.send(Control::Reconnect).is_err() {
            debug!("reconnect requested after shutdown");
        }
    }

    /// Close the stream and cancel any pending retry. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "connection task ended abnormally");
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Background task ───────────────────────────────────────────────────────────

enum StreamEnd {
    Stopped,
    Lost(String),
}

struct Worker {
    source: Arc<dyn EventSource>,
    backoff: Backoff,
    state: watch::Sender<ConnectionState>,
    control: mpsc::UnboundedReceiver<Control>,
    events: mpsc::UnboundedSender<LiveEvent>,
    cancel: CancellationToken,
    ever_connected: bool,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => break,
                opened = self.source.open() => opened,
            };

            match opened {
                Ok(stream) => {
                    self.ever_connected = true;
                    self.backoff.reset();
                    self.set_state(ConnectionState::Connected);
                    match self.pump(stream).await {
                        StreamEnd::Stopped => break,
                        StreamEnd::Lost(reason) => warn!(%reason, "event stream lost"),
                    }
                }
                Err(e) => warn!(error = %e, "failed to open event stream"),
            }

            let retry_state = if self.ever_connected {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            };

            let Some(delay) = self.backoff.next_delay() else {
                self.set_state(ConnectionState::Disconnected);
                if !self.wait_for_reconnect().await {
                    break;
                }
                self.backoff.reset();
                self.set_state(retry_state);
                continue;
            };

            self.set_state(retry_state);
            debug!(
                delay_ms = delay.as_millis() as u64,
                attempt = self.backoff.attempts(),
                "scheduling reconnect"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                cmd = self.control.recv() => match cmd {
                    Some(Control::Reconnect) => {
                        info!("reconnect requested, skipping backoff");
                        self.backoff.reset();
                    }
                    None => break,
                },
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Forward decoded frames until the stream ends or the manager stops.
    async fn pump(&mut self, mut stream: ByteStream) -> StreamEnd {
        let mut decoder = SseDecoder::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return StreamEnd::Stopped,
                cmd = self.control.recv() => match cmd {
                    Some(Control::Reconnect) => debug!("already connected, ignoring reconnect"),
                    None => return StreamEnd::Stopped,
                },
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        for frame in decoder.push(&bytes) {
                            if !self.deliver(&frame) {
                                return StreamEnd::Stopped;
                            }
                        }
                    }
                    Some(Err(e)) => return StreamEnd::Lost(e.to_string()),
                    None => {
                        if let Some(frame) = decoder.finish() {
                            if !self.deliver(&frame) {
                                return StreamEnd::Stopped;
                            }
                        }
                        return StreamEnd::Lost("server closed the stream".to_string());
                    }
                },
            }
        }
    }

    /// Returns false when nobody is listening anymore.
    fn deliver(&self, frame: &SseFrame) -> bool {
        match LiveEvent::decode(frame) {
            Ok(event) => {
                debug!(kind = event.kind_name(), channel = %event.channel_id, "event received");
                self.events.send(event).is_ok()
            }
            Err(e) => {
                warn!(error = %e, event = ?frame.event, "dropping malformed frame");
                true
            }
        }
    }

    /// Parked in `Disconnected`. Returns false if the manager went away instead.
    async fn wait_for_reconnect(&mut self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            cmd = self.control.recv() => matches!(cmd, Some(Control::Reconnect)),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let mut previous = next;
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                previous = std::mem::replace(current, next);
                true
            }
        });
        if changed {
            info!(from = ?previous, to = ?next, "connection state changed");
        }
    }
}

//! Realtime stream controller.
//!
//! Each subscription owns one controller that drives a single SSE connection
//! at a time through connect, handshake, registration, and relay. The first
//! pass through connect/handshake/registration is awaited by the caller so
//! bad credentials or rejected targets fail `subscribe` itself; afterwards a
//! background worker keeps relaying and reconnects under the configured
//! backoff until the subscription is cancelled.

use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::Stream;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::AuthError;
use crate::client::{summarize_error_body, Client, ClientError};
use crate::realtime::hub::Hub;
use crate::realtime::proto::{ConnectPayload, Event, SubscriptionSet, CONNECT_EVENT};
use crate::realtime::sse::{SseDecoder, SseFrame};
use crate::realtime::subscription::Subscription;
use crate::retry::ReconnectStrategy;

/// Realtime endpoint, used for both the event stream and registration.
pub const REALTIME_PATH: &str = "/api/realtime";

/// Options for a realtime subscription.
#[derive(Clone, Debug)]
pub struct SubscribeOptions {
    /// Pacing of reconnect attempts after the connection is lost.
    pub reconnect: ReconnectStrategy,
    /// When `true`, `subscribe` returns only after the first connection is
    /// registered and fails with its error. When `false`, it returns at once
    /// and the outcome is reported by [`Subscription::ready`].
    pub wait_for_probe: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectStrategy::default(),
            wait_for_probe: true,
        }
    }
}

/// Lifecycle of the current physical connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamState {
    Connecting,
    HandshakeWait,
    Authorizing,
    Relaying,
    /// The last attempt failed; a reconnect may follow.
    Failed,
    /// Cancelled by unsubscribe. Terminal.
    Closed,
}

/// Errors produced by realtime subscriptions.
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("no subscription targets given")]
    NoTargets,

    #[error("authorization failed: {0}")]
    Auth(#[from] AuthError),

    #[error("realtime connect failed: {0}")]
    Connect(reqwest::Error),

    #[error("realtime connect returned http status {status}: {body}")]
    ConnectRejected { status: StatusCode, body: String },

    /// The first frame was missing, misnamed, or undecodable.
    #[error("handshake protocol error: {0}")]
    Handshake(String),

    #[error("subscription registration failed: {0}")]
    Register(reqwest::Error),

    #[error("subscription rejected with http status {status}: {body}")]
    SubscriptionRejected { status: StatusCode, body: String },

    #[error("realtime stream read failed: {0}")]
    Stream(reqwest::Error),

    #[error("realtime stream closed by server")]
    StreamClosed,

    #[error("subscription cancelled")]
    Cancelled,
}

impl From<ClientError> for RealtimeError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Auth(err) => Self::Auth(err),
            ClientError::Transport(err) => Self::Register(err),
            ClientError::HttpStatus { status, body } => Self::SubscriptionRejected { status, body },
            ClientError::Decode { source, .. } => Self::Handshake(source.to_string()),
        }
    }
}

/// Outcome of the first connection attempt, observed through
/// [`Subscription::ready`].
#[derive(Clone, Debug)]
pub(crate) enum ProbeState {
    Pending,
    Succeeded,
    Failed(Arc<RealtimeError>),
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// A registered connection ready to relay events.
struct LiveSession {
    client_id: String,
    decoder: SseDecoder<ByteStream>,
}

struct StreamController<T> {
    client: Client,
    targets: Vec<String>,
    hub: Hub<Event<T>>,
    cancel: CancellationToken,
    state: watch::Sender<StreamState>,
}

/// Subscribes to `targets` and returns the caller's handle.
pub async fn subscribe<T>(
    client: &Client,
    targets: Vec<String>,
    options: SubscribeOptions,
) -> Result<Subscription<T>, RealtimeError>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    if targets.is_empty() {
        return Err(RealtimeError::NoTargets);
    }

    let (state_tx, state_rx) = watch::channel(StreamState::Connecting);
    let (ready_tx, ready_rx) = watch::channel(ProbeState::Pending);
    let controller = Arc::new(StreamController {
        client: client.clone(),
        targets,
        hub: Hub::new(),
        cancel: CancellationToken::new(),
        state: state_tx,
    });
    let subscription = Subscription::new(
        controller.hub.clone(),
        controller.cancel.clone(),
        ready_rx,
        state_rx,
    );
    let reconnect = options.reconnect;

    if options.wait_for_probe {
        let session = match controller.establish().await {
            Ok(session) => session,
            Err(err) => {
                controller.set_state(StreamState::Failed);
                warn!(event = "realtime_probe_failed", error = %err);
                return Err(err);
            }
        };
        let _ = ready_tx.send(ProbeState::Succeeded);
        tokio::spawn(controller.run(Some(session), reconnect));
    } else {
        tokio::spawn(async move {
            match controller.establish().await {
                Ok(session) => {
                    let _ = ready_tx.send(ProbeState::Succeeded);
                    controller.run(Some(session), reconnect).await;
                }
                Err(err) => {
                    if matches!(err, RealtimeError::Cancelled) || controller.cancel.is_cancelled() {
                        controller.set_state(StreamState::Closed);
                        debug!(event = "realtime_probe_cancelled");
                    } else {
                        warn!(event = "realtime_probe_failed", error = %err);
                        controller.set_state(StreamState::Failed);
                    }
                    controller.hub.close();
                    let _ = ready_tx.send(ProbeState::Failed(Arc::new(err)));
                }
            }
        });
    }

    Ok(subscription)
}

impl Client {
    /// Subscribes to `targets`, decoding records as `T`.
    pub async fn subscribe<T>(
        &self,
        targets: Vec<String>,
        options: SubscribeOptions,
    ) -> Result<Subscription<T>, RealtimeError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        subscribe(self, targets, options).await
    }
}

impl<T> StreamController<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn set_state(&self, state: StreamState) {
        self.state.send_replace(state);
    }

    /// Connects, completes the handshake, and registers the targets.
    ///
    /// Used for the awaited first attempt and for every reconnect.
    async fn establish(&self) -> Result<LiveSession, RealtimeError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RealtimeError::Cancelled),
            result = self.connect_and_register() => result,
        }
    }

    async fn connect_and_register(&self) -> Result<LiveSession, RealtimeError> {
        self.set_state(StreamState::Connecting);
        self.client.authorize().await?;

        let url = self.client.endpoint(REALTIME_PATH);
        let request = self
            .client
            .with_credential(self.client.http().get(url.as_str()))
            .header(ACCEPT, "text/event-stream");
        let response = request.send().await.map_err(RealtimeError::Connect)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RealtimeError::ConnectRejected {
                status,
                body: summarize_error_body(&body),
            });
        }
        let body: ByteStream = Box::pin(response.bytes_stream());
        let mut decoder = SseDecoder::new(body);

        self.set_state(StreamState::HandshakeWait);
        let first = tokio::time::timeout(self.client.request_timeout(), decoder.next_frame())
            .await
            .map_err(|_| {
                RealtimeError::Handshake(format!("timed out waiting for {CONNECT_EVENT}"))
            })?;
        let frame = match first {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                return Err(RealtimeError::Handshake(format!(
                    "failed reading {CONNECT_EVENT}: {err}"
                )));
            }
            None => {
                return Err(RealtimeError::Handshake(format!(
                    "stream ended before {CONNECT_EVENT}"
                )));
            }
        };
        if frame.event_name() != CONNECT_EVENT {
            return Err(RealtimeError::Handshake(format!(
                "first event must be {CONNECT_EVENT}, got {}",
                frame.event_name()
            )));
        }
        let connect: ConnectPayload = serde_json::from_str(&frame.data).map_err(|err| {
            RealtimeError::Handshake(format!("invalid {CONNECT_EVENT} payload: {err}"))
        })?;

        self.set_state(StreamState::Authorizing);
        let registration = SubscriptionSet {
            client_id: connect.client_id,
            subscriptions: self.targets.clone(),
        };
        let response = self
            .client
            .send_authorized(|http| http.post(url.as_str()).json(&registration))
            .await?;
        if response.status != StatusCode::NO_CONTENT {
            return Err(RealtimeError::SubscriptionRejected {
                status: response.status,
                body: summarize_error_body(&response.body),
            });
        }

        debug!(
            event = "realtime_subscription_registered",
            client_id = %registration.client_id,
            targets = ?self.targets
        );
        Ok(LiveSession {
            client_id: registration.client_id,
            decoder,
        })
    }

    /// Reads frames until the connection fails or the subscription is
    /// cancelled. Returns the reason it stopped.
    ///
    /// Decoding and publishing happen on a separate task fed in arrival
    /// order, so a slow listener never delays the next read.
    async fn relay(&self, session: LiveSession) -> RealtimeError {
        let LiveSession {
            client_id,
            mut decoder,
        } = session;
        self.set_state(StreamState::Relaying);
        info!(event = "realtime_relaying", client_id = %client_id);

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_frames(frames_rx, self.hub.clone()));

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return RealtimeError::Cancelled,
                next = decoder.next_frame() => next,
            };

            match next {
                Some(Ok(frame)) => {
                    if frame.event_name() == CONNECT_EVENT {
                        continue;
                    }
                    if frames_tx.send(frame).is_err() {
                        return RealtimeError::Cancelled;
                    }
                }
                Some(Err(err)) => return RealtimeError::Stream(err),
                None => return RealtimeError::StreamClosed,
            }
        }
    }

    /// Background worker: relays the probed session, then reconnects after
    /// every failure until cancelled.
    async fn run(self: Arc<Self>, mut established: Option<LiveSession>, reconnect: ReconnectStrategy) {
        let mut backoff = reconnect.backoff();

        loop {
            let attempt = match established.take() {
                Some(session) => Ok(session),
                None => self.establish().await,
            };
            let err = match attempt {
                Ok(session) => {
                    backoff.reset();
                    self.relay(session).await
                }
                Err(err) => err,
            };

            if matches!(err, RealtimeError::Cancelled) || self.cancel.is_cancelled() {
                break;
            }

            self.set_state(StreamState::Failed);
            warn!(event = "realtime_session_failed", error = %err);
            let delay = backoff.next_delay();
            debug!(
                event = "realtime_reconnect_scheduled",
                delay_ms = delay.as_millis() as u64,
                targets = ?self.targets
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(StreamState::Closed);
        debug!(event = "realtime_worker_stopped");
    }
}

async fn dispatch_frames<T>(mut frames: mpsc::UnboundedReceiver<SseFrame>, hub: Hub<Event<T>>)
where
    T: DeserializeOwned + Clone,
{
    while let Some(frame) = frames.recv().await {
        let decoded = Event::<T>::decode(frame.event_name(), &frame.data);
        if let Some(err) = decoded.error.as_ref() {
            debug!(
                event = "realtime_event_undecodable",
                topic = %decoded.topic,
                error = %err
            );
        }
        hub.publish(decoded);
    }
}

//! Ingest sessions: dial, negotiate, then pump packets into the packager
//! until the producer ends or the session is stopped.

use std::{future::Future, sync::Arc};

use tokio::sync::{mpsc, watch};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::{IngestConfig, PackagerConfig},
    error::{IngestError, IngestResult},
    locator::{Connector, Dispatcher},
    packager::{Fragment, FragmentPackager, InitSegment},
    packet::CodecDescriptor,
    queue::ProducerOutput,
    StreamClient,
};

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Dialing,
    Negotiating,
    Streaming,
    Stopped,
}

#[derive(Debug, Clone)]
pub enum EndReason {
    /// The source ended cleanly. The tail fragment has been emitted.
    Finished,
    Cancelled,
    Failed(Arc<IngestError>),
}

impl EndReason {
    fn from_error(error: IngestError) -> Self {
        if error.is_cancelled() {
            EndReason::Cancelled
        } else {
            EndReason::Failed(Arc::new(error))
        }
    }

    pub fn error(&self) -> Option<&IngestError> {
        match self {
            EndReason::Failed(error) => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Init {
        session: SessionId,
        codecs: Vec<CodecDescriptor>,
        init: InitSegment,
    },
    Fragment {
        session: SessionId,
        fragment: Fragment,
    },
    /// Sent exactly once per session, whatever ended it.
    Ended {
        session: SessionId,
        reason: EndReason,
    },
}

impl SessionEvent {
    pub fn session(&self) -> SessionId {
        match self {
            SessionEvent::Init { session, .. }
            | SessionEvent::Fragment { session, .. }
            | SessionEvent::Ended { session, .. } => *session,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;

/// Handle of a running session. Dropping it requests a stop.
pub struct Session {
    id: SessionId,
    cancel: CancellationToken,
    tracker: TaskTracker,
    state: watch::Receiver<SessionState>,
}

impl Session {
    pub fn start<C: StreamClient>(
        id: SessionId,
        client: C,
        config: PackagerConfig,
        events: EventSender,
    ) -> Self {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (state_tx, state) = watch::channel(SessionState::Idle);

        let context = Context {
            id,
            cancel: cancel.clone(),
            tracker: tracker.clone(),
            state: state_tx,
            events,
            config,
        };
        tracker.spawn(context.run(client));
        tracker.close();

        Self {
            id,
            cancel,
            tracker,
            state,
        }
    }

    /// A session whose locator could not be turned into a client.
    pub fn failed(id: SessionId, error: IngestError, events: &EventSender) -> Self {
        tracing::warn!(session = id, error = %error, "Session failed before dialing");
        _ = events.send(SessionEvent::Ended {
            session: id,
            reason: EndReason::from_error(error),
        });

        let tracker = TaskTracker::new();
        tracker.close();
        let (_, state) = watch::channel(SessionState::Stopped);
        Self {
            id,
            cancel: CancellationToken::new(),
            tracker,
            state,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Requests a stop without waiting for the teardown.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once every task of the session has finished and the client
    /// has been closed.
    pub async fn join(&self) {
        self.tracker.wait().await;
    }

    pub async fn stop(&self) {
        self.cancel();
        self.join().await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Step<C, T> {
    Done(C, IngestResult<T>),
    Cancelled,
    /// The child task panicked and took the client with it.
    Lost(IngestError),
}

async fn dial<C: StreamClient>(mut client: C, cancel: CancellationToken) -> (C, IngestResult<()>) {
    let result = tokio::select! {
        result = client.dial() => result,
        _ = cancel.cancelled() => Err(IngestError::Cancelled),
    };
    (client, result)
}

async fn negotiate<C: StreamClient>(
    mut client: C,
    cancel: CancellationToken,
) -> (C, IngestResult<Vec<CodecDescriptor>>) {
    let result = tokio::select! {
        result = client.negotiate_codecs() => result,
        _ = cancel.cancelled() => Err(IngestError::Cancelled),
    };
    (client, result)
}

struct Context {
    id: SessionId,
    cancel: CancellationToken,
    tracker: TaskTracker,
    state: watch::Sender<SessionState>,
    events: EventSender,
    config: PackagerConfig,
}

impl Context {
    fn enter(&self, state: SessionState) {
        tracing::debug!(session = self.id, ?state, "Session state changed");
        self.state.send_replace(state);
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!(session = self.id, "Event receiver is gone");
        }
    }

    async fn run<C: StreamClient>(self, client: C) {
        let (reason, client) = self.drive(client).await;

        self.enter(SessionState::Stopped);
        match &reason {
            EndReason::Finished => tracing::info!(session = self.id, "Stream finished"),
            EndReason::Cancelled => tracing::info!(session = self.id, "Session stopped"),
            EndReason::Failed(e) => tracing::error!(session = self.id, error = %e, "Session failed"),
        }
        self.emit(SessionEvent::Ended {
            session: self.id,
            reason,
        });

        if let Some(mut client) = client {
            client.close().await;
            tracing::debug!(session = self.id, "Client closed");
        }
    }

    /// Runs `op` on a child task that owns the client, racing it against
    /// cancellation. A cancelled child still gets its client closed by a
    /// tracked follow-up once it returns.
    async fn step<C, T, F, Fut>(&self, client: C, op: F) -> Step<C, T>
    where
        C: StreamClient,
        T: Send + 'static,
        F: FnOnce(C, CancellationToken) -> Fut,
        Fut: Future<Output = (C, IngestResult<T>)> + Send + 'static,
    {
        let mut child = self.tracker.spawn(op(client, self.cancel.child_token()));
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                let id = self.id;
                self.tracker.spawn(async move {
                    if let Ok((mut client, _)) = child.await {
                        client.close().await;
                        tracing::debug!(session = id, "Abandoned client closed");
                    }
                });
                Step::Cancelled
            }
            joined = &mut child => match joined {
                Ok((client, result)) => Step::Done(client, result),
                Err(e) => Step::Lost(e.into()),
            },
        }
    }

    async fn drive<C: StreamClient>(&self, client: C) -> (EndReason, Option<C>) {
        self.enter(SessionState::Dialing);
        let client = match self.step(client, dial::<C>).await {
            Step::Done(client, Ok(())) => client,
            Step::Done(client, Err(e)) => return (EndReason::from_error(e), Some(client)),
            Step::Cancelled => return (EndReason::Cancelled, None),
            Step::Lost(e) => return (EndReason::from_error(e), None),
        };

        self.enter(SessionState::Negotiating);
        let (mut client, codecs) = match self.step(client, negotiate::<C>).await {
            Step::Done(client, Ok(codecs)) => (client, codecs),
            Step::Done(client, Err(e)) => return (EndReason::from_error(e), Some(client)),
            Step::Cancelled => return (EndReason::Cancelled, None),
            Step::Lost(e) => return (EndReason::from_error(e), None),
        };
        let Some(output) = client.take_output() else {
            let error = IngestError::Negotiation("client has no packet output".into());
            return (EndReason::from_error(error), Some(client));
        };

        let kind = client.kind();
        let zero_composition = self.config.composition_correction.applies_to(kind);
        let (mut packager, init) = FragmentPackager::new(&codecs, &self.config, zero_composition);
        tracing::info!(
            session = self.id,
            ?kind,
            zero_composition,
            mime = %init.mime,
            "Codecs negotiated"
        );
        self.emit(SessionEvent::Init {
            session: self.id,
            codecs,
            init,
        });

        self.enter(SessionState::Streaming);
        let reason = self.pump(output, &mut packager).await;
        tracing::debug!(session = self.id, fragments = packager.fragments(), "Pump finished");
        (reason, Some(client))
    }

    async fn pump(&self, output: ProducerOutput, packager: &mut FragmentPackager) -> EndReason {
        let ProducerOutput {
            mut packets,
            mut terminal,
        } = output;

        // producers fire the terminal after their last send, and packets are
        // polled first, so nothing queued is lost
        let result = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return EndReason::Cancelled,
                packet = packets.recv() => match packet {
                    Some(packet) => {
                        if let Some(fragment) = packager.write_packet(packet) {
                            self.emit(SessionEvent::Fragment { session: self.id, fragment });
                        }
                    }
                    None => break terminal.wait().await,
                },
                result = terminal.wait() => break result,
            }
        };

        match result {
            Ok(()) => {
                if let Some(fragment) = packager.flush() {
                    self.emit(SessionEvent::Fragment {
                        session: self.id,
                        fragment,
                    });
                }
                EndReason::Finished
            }
            Err(e) => EndReason::from_error(e),
        }
    }
}

/// Plays one locator at a time. Starting a new session fully tears down the
/// previous one first.
pub struct Player<C: Connector = Dispatcher> {
    connector: C,
    config: PackagerConfig,
    events: EventSender,
    next_id: SessionId,
    current: Option<Session>,
}

impl Player<Dispatcher> {
    pub fn with_config(config: IngestConfig, events: EventSender) -> Self {
        let packager = config.packager.clone();
        Self::new(Dispatcher::new(config), packager, events)
    }
}

impl<C: Connector> Player<C> {
    pub fn new(connector: C, config: PackagerConfig, events: EventSender) -> Self {
        Self {
            connector,
            config,
            events,
            next_id: 0,
            current: None,
        }
    }

    pub async fn play(&mut self, locator: &str) -> SessionId {
        self.stop().await;

        self.next_id += 1;
        let id = self.next_id;
        tracing::info!(session = id, locator, "Starting session");
        let session = match self.connector.connect(locator) {
            Ok(client) => Session::start(id, client, self.config.clone(), self.events.clone()),
            Err(e) => Session::failed(id, e, &self.events),
        };
        self.current = Some(session);
        id
    }

    /// Stops the current session and waits for its teardown.
    pub async fn stop(&mut self) {
        if let Some(session) = self.current.take() {
            session.stop().await;
        }
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }
}

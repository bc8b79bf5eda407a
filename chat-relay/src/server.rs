use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use chrono::Local;
use futures::{Stream, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    select,
    sync::watch,
    task::{JoinError, JoinSet},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    codec::decode_frame,
    config::RelayConfig,
    connection::{Connection, ConnectionHandle, signalled},
    error::{DecodeError, FrameError, RegistryError, SessionError},
    history::HistorySink,
    message::{ClientFrame, ErrorKind, ServerFrame, validate_username},
    registry::{Registry, SessionId},
    router::Router,
};

/// Lifecycle of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport accepted, no identity yet.
    Connecting,
    /// Waiting for the join frame.
    Handshaking,
    /// Registered and relaying messages.
    Active,
    /// Deregistering.
    Closing,
    /// Resources released.
    Closed,
}

/// Accepts connections and runs one session task per client.
pub struct Server {
    listener: TcpListener,
    config: RelayConfig,
    history: Option<Arc<dyn HistorySink>>,
}

impl Server {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self {
            listener,
            config,
            history: None,
        }
    }

    pub fn with_history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            config,
            history,
        } = self;
        let state = Arc::new(RelayState::new(config, history).await);
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &stop_rx, &mut sessions);
                }
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    log_session_exit(finished);
                }
            }
        }

        drop(listener);
        drain_sessions(&state, stop_tx, sessions).await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<RelayState>,
    stop: &watch::Receiver<bool>,
    sessions: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => {
            if let Err(err) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = ?err, "failed to set TCP_NODELAY");
            }
            sessions.spawn(run_session(stream, peer.to_string(), Arc::clone(state), stop.clone()));
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn log_session_exit(result: Result<(), JoinError>) {
    if let Err(err) = result {
        if err.is_panic() {
            warn!(error = ?err, "session task panicked");
        }
    }
}

/// Signals every session to stop, then waits up to the grace period for
/// them before aborting the rest.
async fn drain_sessions(state: &RelayState, stop: watch::Sender<bool>, mut sessions: JoinSet<()>) {
    info!(sessions = sessions.len(), "relay shutting down");
    stop.send_replace(true);

    let grace = state.config.shutdown_grace;
    let drained = timeout(grace, async {
        while let Some(finished) = sessions.join_next().await {
            log_session_exit(finished);
        }
    })
    .await;

    if drained.is_err() {
        warn!(remaining = sessions.len(), ?grace, "sessions did not stop in time; aborting");
        sessions.shutdown().await;
    }

    for session in state.registry.drain().await {
        session.handle().close();
    }
}

/// Shared by every session task.
pub(crate) struct RelayState {
    config: RelayConfig,
    registry: Arc<Registry>,
    router: Router,
}

impl RelayState {
    pub(crate) async fn new(config: RelayConfig, history: Option<Arc<dyn HistorySink>>) -> Self {
        let registry = Arc::new(Registry::new(config.enforce_unique_usernames));
        let mut router = Router::new(Arc::clone(&registry), config.echo_to_sender);

        if let Some(history) = history {
            // Continue numbering after whatever a previous run recorded.
            match history.latest_id().await {
                Ok(Some(latest)) => router = router.starting_at(latest + 1),
                Ok(None) => {}
                Err(error) => warn!(%error, "failed to read history; numbering from 1"),
            }
            router = router.with_history(history);
        }

        Self {
            config,
            registry,
            router,
        }
    }
}

struct Session {
    peer: String,
    state: SessionState,
}

impl Session {
    fn advance(&mut self, next: SessionState) {
        debug!(peer = %self.peer, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }
}

/// Identity of a session once it is `Active`.
struct Member {
    id: SessionId,
    username: String,
}

/// Counts malformed frames and trips once the threshold is exceeded.
#[derive(Debug)]
struct MalformedBudget {
    count: u32,
    threshold: u32,
}

impl MalformedBudget {
    fn new(threshold: u32) -> Self {
        Self {
            count: 0,
            threshold,
        }
    }

    fn record(&mut self) -> Result<u32, SessionError> {
        self.count += 1;
        if self.count > self.threshold {
            return Err(SessionError::ProtocolAbuse {
                count: self.count,
                threshold: self.threshold,
            });
        }
        Ok(self.count)
    }
}

pub(crate) async fn run_session<S>(
    stream: S,
    peer: String,
    state: Arc<RelayState>,
    stop: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    match handle_connection(stream, peer.clone(), state, stop).await {
        Ok(()) => {}
        Err(SessionError::ShuttingDown | SessionError::ClosedBeforeHandshake) => {}
        Err(err) => warn!(peer = %peer, error = %err, "client connection closed with error"),
    }
}

async fn handle_connection<S>(
    stream: S,
    peer: String,
    state: Arc<RelayState>,
    mut stop: watch::Receiver<bool>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut session = Session {
        peer: peer.clone(),
        state: SessionState::Connecting,
    };
    let mut connection = Connection::new(stream, peer.clone(), &state.config.connection());
    let handle = connection.handle();
    let grace = state.config.shutdown_grace;

    session.advance(SessionState::Handshaking);
    let joined = match perform_handshake(&mut connection, &state.config, &mut stop).await {
        Ok(username) => register_and_welcome(&state, &handle, username).await,
        Err(err) => Err(err),
    };
    let member = match joined {
        Ok(member) => member,
        Err(err) => {
            reject(&handle, &err);
            connection.shutdown(grace).await;
            session.advance(SessionState::Closed);
            return Err(err);
        }
    };

    session.advance(SessionState::Active);
    info!(peer = %peer, session = %member.id, username = %member.username, "client joined");
    state
        .router
        .announce(
            Some(member.id),
            &ServerFrame::Joined {
                username: member.username.clone(),
            },
        )
        .await;

    let outcome = run_client_session(connection.receive(), &handle, &state, &member, &mut stop).await;

    session.advance(SessionState::Closing);
    if let Err(err) = &outcome {
        reject(&handle, err);
    }
    let stopping = *stop.borrow();
    cleanup_client_disconnect(&state, &member, &peer, stopping).await;
    connection.shutdown(grace).await;
    session.advance(SessionState::Closed);

    outcome
}

async fn perform_handshake<S>(
    connection: &mut Connection<S>,
    config: &RelayConfig,
    stop: &mut watch::Receiver<bool>,
) -> Result<String, SessionError>
where
    S: AsyncRead,
{
    let first = {
        let frames = connection.receive();
        tokio::pin!(frames);
        select! {
            frame = timeout(config.handshake_timeout, frames.next()) => {
                frame.map_err(|_| SessionError::HandshakeTimeout(config.handshake_timeout))?
            }
            _ = signalled(&mut *stop) => return Err(SessionError::ShuttingDown),
        }
    };

    let payload = first.ok_or(SessionError::ClosedBeforeHandshake)??;
    extract_username(decode_frame(&payload)?)
}

fn extract_username(frame: ClientFrame) -> Result<String, SessionError> {
    match frame {
        ClientFrame::Join { username } => {
            let username = username.trim().to_string();
            validate_username(&username).map_err(DecodeError::from)?;
            Ok(username)
        }
        ClientFrame::Quit => Err(SessionError::ClosedBeforeHandshake),
        ClientFrame::Chat { .. } => Err(SessionError::UnexpectedFrame),
    }
}

async fn register_and_welcome(
    state: &RelayState,
    handle: &ConnectionHandle,
    username: String,
) -> Result<Member, SessionError> {
    // Routing waits on this lock, so no live message can reach the session
    // before its welcome or overtake (or repeat) the replayed history.
    let mut registry = state.registry.lock().await;
    let participants: Vec<String> = registry
        .sessions()
        .map(|session| session.username().to_string())
        .collect();
    let id = registry.admit(username.clone(), handle.clone())?;

    deliver(
        handle,
        &ServerFrame::Welcome {
            session_id: id,
            username: username.clone(),
        },
    );
    if !participants.is_empty() {
        deliver(handle, &ServerFrame::Roster { participants });
    }
    replay_history(state, handle).await;

    drop(registry);
    Ok(Member { id, username })
}

async fn replay_history(state: &RelayState, handle: &ConnectionHandle) {
    let Some(history) = state.router.history() else {
        return;
    };
    if state.config.history_replay == 0 {
        return;
    }
    match history.recent(state.config.history_replay).await {
        Ok(messages) => {
            for message in messages {
                deliver(handle, &ServerFrame::Message(message));
            }
        }
        Err(error) => warn!(%error, "failed to replay history"),
    }
}

async fn run_client_session<F>(
    frames: F,
    handle: &ConnectionHandle,
    state: &RelayState,
    member: &Member,
    stop: &mut watch::Receiver<bool>,
) -> Result<(), SessionError>
where
    F: Stream<Item = Result<Vec<u8>, FrameError>>,
{
    tokio::pin!(frames);
    let mut budget = MalformedBudget::new(state.config.malformed_frame_threshold);

    loop {
        select! {
            frame = frames.next() => match frame {
                Some(Ok(payload)) => {
                    if !handle_client_frame(&payload, handle, state, member, &mut budget).await? {
                        break;
                    }
                }
                Some(Err(err)) => return Err(err.into()),
                // EOF, or the connection was closed by the router or writer.
                None => break,
            },
            _ = signalled(&mut *stop) => return Err(SessionError::ShuttingDown),
        }
    }

    Ok(())
}

/// Returns `false` once the client asked to leave.
async fn handle_client_frame(
    payload: &[u8],
    handle: &ConnectionHandle,
    state: &RelayState,
    member: &Member,
    budget: &mut MalformedBudget,
) -> Result<bool, SessionError> {
    match decode_frame::<ClientFrame>(payload) {
        Ok(ClientFrame::Chat { body }) => {
            if let Err(err) = state.router.publish(member.id, &member.username, body).await {
                debug!(session = %member.id, error = %err, "rejected message");
                deliver(handle, &ServerFrame::error(ErrorKind::Validation, err));
            }
            Ok(true)
        }
        Ok(ClientFrame::Join { .. }) => {
            deliver(
                handle,
                &ServerFrame::error(ErrorKind::Protocol, "already joined"),
            );
            Ok(true)
        }
        Ok(ClientFrame::Quit) => Ok(false),
        Err(err) => {
            let count = budget.record()?;
            warn!(session = %member.id, count, error = %err, "dropping malformed frame");
            Ok(true)
        }
    }
}

async fn cleanup_client_disconnect(state: &RelayState, member: &Member, peer: &str, stopping: bool) {
    // Already gone if the router dropped it as a dead recipient.
    let online_secs = state
        .registry
        .remove(member.id)
        .await
        .map(|session| (Local::now() - session.joined_at()).num_seconds());
    info!(peer = %peer, session = %member.id, username = %member.username, ?online_secs, "client disconnected");

    if !stopping {
        state
            .router
            .announce(
                None,
                &ServerFrame::Left {
                    username: member.username.clone(),
                },
            )
            .await;
    }
}

/// Best-effort error frame explaining why the connection is going away.
fn reject(handle: &ConnectionHandle, err: &SessionError) {
    let kind = match err {
        SessionError::HandshakeTimeout(_) => ErrorKind::HandshakeTimeout,
        SessionError::UnexpectedFrame => ErrorKind::Protocol,
        SessionError::ProtocolAbuse { .. } => ErrorKind::ProtocolAbuse,
        SessionError::ShuttingDown => ErrorKind::ShuttingDown,
        SessionError::Decode(DecodeError::Validation(_)) => ErrorKind::Validation,
        SessionError::Decode(_) => ErrorKind::Malformed,
        SessionError::Registry(RegistryError::DuplicateUsername(_)) => ErrorKind::DuplicateUsername,
        // The peer is gone or the stream is unusable.
        SessionError::ClosedBeforeHandshake | SessionError::Frame(_) => return,
    };
    deliver(handle, &ServerFrame::error(kind, err));
}

fn deliver(handle: &ConnectionHandle, frame: &ServerFrame) {
    if let Err(err) = handle.send_frame(frame) {
        debug!(peer = %handle.peer(), error = %err, "failed to queue frame");
    }
}

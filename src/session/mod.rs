//! Session driver.
//!
//! One task per connection owns the socket, the [`Framer`], the
//! [`SessionMachine`] and the [`Correlator`]. Everything else talks to it
//! through a cloneable [`SessionHandle`]:
//!
//! ```text
//! socket ──read──> Framer ─> decode ─> SessionMachine ─> Dispatcher ─> callbacks
//!    ^                                      │                 └──> Correlator ─> ResponseHandle
//!    └──────────────write─────────── actions / commands <── SessionHandle (mpsc)
//! ```
//!
//! Stanza payloads are logged at `debug` under this module's target, except
//! sensitive requests which are logged as id and length only.

pub mod state;
pub mod transport;

pub use state::{
    DisconnectReason, Notification, SendKind, SessionAction, SessionMachine, SessionState,
};
pub use transport::SessionStream;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::callbacks::SessionCallbacks;
use crate::clock::{system_time_millis, ServerClock};
use crate::config::{Credentials, SessionConfig};
use crate::correlator::{Correlator, ResponseHandle};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::events::LoginSuccess;
use crate::framing::{Frame, Framer};
use crate::requests::{Outbound, Ping, Request, StreamInit};
use crate::stanza::{decode, Stanza};

/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 8 * 1024;

/// Bound on queued commands before senders wait.
const COMMAND_QUEUE: usize = 64;

/// Best-effort limit for writing the closing `</k>`.
const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything one connection needs. Created on connect, dropped on disconnect.
pub struct SessionContext {
    pub config: SessionConfig,
    pub credentials: Arc<Credentials>,
    pub clock: ServerClock,
    pub callbacks: Arc<dyn SessionCallbacks>,
}

enum Command {
    Send {
        outbound: Outbound,
        kind: SendKind,
        reply: oneshot::Sender<Result<()>>,
    },
    Request {
        outbound: Outbound,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<ResponseHandle>>,
    },
    Cancel {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    AnswerCaptcha {
        response: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Entry point for applications: holds what is needed to (re)connect.
pub struct KikClient {
    config: SessionConfig,
    credentials: Arc<Credentials>,
    callbacks: Arc<dyn SessionCallbacks>,
}

impl KikClient {
    pub fn new(
        config: SessionConfig,
        credentials: Credentials,
        callbacks: Arc<dyn SessionCallbacks>,
    ) -> Self {
        Self {
            config,
            credentials: Arc::new(credentials),
            callbacks,
        }
    }

    /// Open a new session. Calling it again after a disconnect reconnects.
    pub async fn connect(&self) -> Result<SessionHandle> {
        let endpoint = self.config.endpoint()?;
        info!(host = %endpoint.host, port = endpoint.port, mode = ?endpoint.mode, "Connecting");

        let mut machine = SessionMachine::new(self.credentials.clone(), self.config.device.clone());
        machine.connect_requested()?;

        let stream = match transport::connect(
            &endpoint,
            self.config.connect_timeout(),
            self.config.dangerous_insecure_tls,
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                notify_failed_start(&mut machine, &*self.callbacks, &e);
                return Err(e);
            }
        };

        Session::start(
            stream,
            SessionContext {
                config: self.config.clone(),
                credentials: self.credentials.clone(),
                clock: ServerClock::new(),
                callbacks: self.callbacks.clone(),
            },
            machine,
        )
        .await
    }

    /// Replace the login stream `previous` with a node-based authenticated one.
    ///
    /// A password login ends with the server handing out the account's node;
    /// the session the application keeps is a new connection whose stream
    /// init carries that node. The node is kept for later reconnects.
    pub async fn establish_authenticated_session(
        &mut self,
        previous: &SessionHandle,
    ) -> Result<SessionHandle> {
        let credentials = hand_over(previous, &self.credentials).await?;
        self.credentials = Arc::new(credentials);
        self.connect().await
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }
}

/// Close `previous` once it has logged in and return credentials for its node.
async fn hand_over(previous: &SessionHandle, credentials: &Credentials) -> Result<Credentials> {
    let Some(success) = previous.login_success() else {
        return Err(Error::SessionNotReady(previous.state()));
    };
    info!(node = %success.node, "Closing the login stream, reconnecting as the account node");
    previous.shutdown();
    previous.closed().await;
    Ok(credentials.clone().with_node(success.node))
}

fn notify_failed_start(machine: &mut SessionMachine, callbacks: &dyn SessionCallbacks, err: &Error) {
    let reason = match err {
        Error::Io(e) => DisconnectReason::Io(e.to_string()),
        other => DisconnectReason::Protocol(other.to_string()),
    };
    for action in machine.disconnected(reason) {
        if let SessionAction::Notify(Notification::Disconnected(reason)) = action {
            callbacks.on_disconnected(&reason);
        }
    }
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
    clock: watch::Receiver<ServerClock>,
    login: watch::Receiver<Option<LoginSuccess>>,
    shutdown: broadcast::Sender<()>,
}

impl SessionHandle {
    async fn command<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Write a request without waiting for a response.
    pub async fn send(&self, request: &dyn Request) -> Result<()> {
        let outbound = Outbound::from_request(request);
        self.command(|reply| Command::Send {
            outbound,
            kind: SendKind::Application,
            reply,
        })
        .await?
    }

    /// Write a request and register for its response. `timeout` defaults to
    /// the configured request timeout.
    pub async fn start_request(
        &self,
        request: &dyn Request,
        timeout: Option<Duration>,
    ) -> Result<ResponseHandle> {
        let outbound = Outbound::from_request(request);
        self.command(|reply| Command::Request {
            outbound,
            timeout,
            reply,
        })
        .await?
    }

    /// Write a request and wait for the stanza answering it.
    pub async fn request(&self, request: &dyn Request, timeout: Option<Duration>) -> Result<Stanza> {
        self.start_request(request, timeout).await?.wait().await
    }

    /// Complete a pending request with [`Error::Cancelled`]. Returns whether it was pending.
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.command(|reply| Command::Cancel { id, reply }).await
    }

    pub async fn answer_captcha(&self, response: impl Into<String>) -> Result<()> {
        let response = response.into();
        self.command(|reply| Command::AnswerCaptcha { response, reply })
            .await?
    }

    pub async fn ping(&self) -> Result<()> {
        let outbound = Outbound::from_request(&Ping);
        self.command(|reply| Command::Send {
            outbound,
            kind: SendKind::Ping,
            reply,
        })
        .await?
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait for the outcome of authentication.
    pub async fn wait_authenticated(&self) -> Result<()> {
        let mut state = self.state.clone();
        let settled = state
            .wait_for(|s| {
                matches!(
                    s,
                    SessionState::Authenticated
                        | SessionState::CaptchaRequired
                        | SessionState::TempBanned
                        | SessionState::Disconnected
                )
            })
            .await
            .map(|s| *s)
            .unwrap_or(SessionState::Disconnected);
        match settled {
            SessionState::Authenticated => Ok(()),
            SessionState::CaptchaRequired => Err(Error::CaptchaRequired),
            SessionState::Disconnected => Err(Error::SessionClosed),
            other => Err(Error::SessionNotReady(other)),
        }
    }

    /// Result of the password login on this stream, once it succeeded.
    pub fn login_success(&self) -> Option<LoginSuccess> {
        self.login.borrow().clone()
    }

    /// Current server time estimate, for stamping outgoing messages.
    pub fn server_time_millis(&self) -> i64 {
        self.clock.borrow().server_time_millis()
    }

    /// Ask the session to close. Returns immediately; see [`closed`](Self::closed).
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Resolves once the session task has finished.
    pub async fn closed(&self) {
        self.commands.closed().await
    }
}

/// The per-connection task.
pub struct Session<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    framer: Framer,
    machine: SessionMachine,
    correlator: Correlator,
    dispatcher: Dispatcher,
    context: SessionContext,
    state_tx: watch::Sender<SessionState>,
    clock_tx: watch::Sender<ServerClock>,
    login_tx: watch::Sender<Option<LoginSuccess>>,
    commands: mpsc::Receiver<Command>,
    shutdown: broadcast::Receiver<()>,
}

impl<S: SessionStream> Session<S> {
    /// Run a session over an already-open stream.
    pub async fn spawn(
        stream: S,
        config: SessionConfig,
        credentials: Arc<Credentials>,
        callbacks: Arc<dyn SessionCallbacks>,
    ) -> Result<SessionHandle> {
        let mut machine = SessionMachine::new(credentials.clone(), config.device.clone());
        machine.connect_requested()?;
        let context = SessionContext {
            config,
            credentials,
            clock: ServerClock::new(),
            callbacks,
        };
        Self::start(stream, context, machine).await
    }

    /// Close `previous` after its login and run a node-authenticated session over `stream`.
    pub async fn spawn_authenticated(
        previous: &SessionHandle,
        stream: S,
        config: SessionConfig,
        credentials: &Credentials,
        callbacks: Arc<dyn SessionCallbacks>,
    ) -> Result<SessionHandle> {
        let credentials = hand_over(previous, credentials).await?;
        Self::spawn(stream, config, Arc::new(credentials), callbacks).await
    }

    async fn start(
        stream: S,
        context: SessionContext,
        mut machine: SessionMachine,
    ) -> Result<SessionHandle> {
        let (reader, mut writer) = tokio::io::split(stream);

        if let Err(e) = open_stream(&mut writer, &context, &mut machine).await {
            notify_failed_start(&mut machine, &*context.callbacks, &e);
            return Err(e);
        }

        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (state_tx, state_rx) = watch::channel(machine.state());
        let (clock_tx, clock_rx) = watch::channel(context.clock);
        let (login_tx, login_rx) = watch::channel(None);
        let (shutdown_tx, shutdown) = broadcast::channel(1);

        let session = Session {
            reader,
            writer,
            framer: Framer::with_handshake(context.config.max_stanza_size),
            machine,
            correlator: Correlator::new(),
            dispatcher: Dispatcher::new(context.callbacks.clone()),
            context,
            state_tx,
            clock_tx,
            login_tx,
            commands,
            shutdown,
        };
        tokio::spawn(session.run());

        Ok(SessionHandle {
            commands: command_tx,
            state: state_rx,
            clock: clock_rx,
            login: login_rx,
            shutdown: shutdown_tx,
        })
    }

    async fn run(mut self) {
        let mut read_buf = vec![0u8; READ_CHUNK];

        let reason = loop {
            let deadline = self.correlator.next_deadline();
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!("Session shutdown requested");
                    break DisconnectReason::Shutdown;
                }
                read = self.reader.read(&mut read_buf) => match read {
                    Ok(0) => {
                        info!("Connection closed by server");
                        break DisconnectReason::StreamClosed;
                    }
                    Ok(n) => {
                        self.framer.feed(&read_buf[..n]);
                        if let Err(reason) = self.drain_frames().await {
                            break reason;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Socket read failed");
                        break DisconnectReason::Io(e.to_string());
                    }
                },
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Err(reason) = self.handle_command(command).await {
                            break reason;
                        }
                    }
                    // Every handle is gone.
                    None => break DisconnectReason::Shutdown,
                },
                _ = wait_deadline(deadline) => {
                    if let Err(reason) = self.expire_requests().await {
                        break reason;
                    }
                }
            }
        };

        self.teardown(reason).await;
    }

    async fn drain_frames(&mut self) -> std::result::Result<(), DisconnectReason> {
        loop {
            match self.framer.next_frame() {
                Ok(Frame::Incomplete) => return Ok(()),
                Ok(Frame::Stanza(bytes)) => self.on_frame(&bytes).await?,
                Ok(Frame::StreamClosed) => {
                    info!("Server closed the stream");
                    return Err(DisconnectReason::StreamClosed);
                }
                Err(e) => {
                    warn!(error = %e, buffered = self.framer.buffered(), "Framing error");
                    return Err(DisconnectReason::Protocol(e.to_string()));
                }
            }
        }
    }

    async fn on_frame(&mut self, bytes: &[u8]) -> std::result::Result<(), DisconnectReason> {
        debug!(data = %String::from_utf8_lossy(bytes), "RECV");

        let stanza = match decode(bytes) {
            Ok(stanza) => stanza,
            Err(e) if e.is_fatal() => return Err(DisconnectReason::Protocol(e.to_string())),
            Err(e) => {
                warn!(error = %e, "Dropping undecodable stanza");
                return Ok(());
            }
        };

        let actions = self.machine.on_stanza(&stanza, SystemTime::now());
        self.apply(actions).await?;
        self.dispatcher
            .dispatch(stanza, &mut self.correlator, Instant::now());
        Ok(())
    }

    /// Execute state machine actions. `Err` ends the session.
    async fn apply(&mut self, actions: Vec<SessionAction>) -> std::result::Result<(), DisconnectReason> {
        let mut result = Ok(());
        for action in actions {
            match action {
                SessionAction::Send { outbound, track } => {
                    if track {
                        let timeout = self.context.config.request_timeout();
                        // Nobody awaits engine-owned requests; the entry only drives expiry.
                        if let Err(e) = self
                            .correlator
                            .register(outbound.id.clone(), Some((Instant::now() + timeout, timeout)))
                        {
                            warn!(error = %e, "Cannot track request");
                        }
                    }
                    if let Err(e) = self.write(&outbound).await {
                        result = Err(DisconnectReason::Io(e.to_string()));
                        break;
                    }
                }
                SessionAction::SyncClock(server_millis) => {
                    let offset = self.context.clock.recalculate(server_millis);
                    debug!(offset_millis = offset, "Server clock synchronised");
                    self.clock_tx.send_replace(self.context.clock);
                }
                SessionAction::Notify(notification) => {
                    if let Notification::LoginEnded(success) = &notification {
                        self.login_tx.send_replace(Some(success.clone()));
                    }
                    self.dispatcher.notify(&notification);
                }
                SessionAction::Close { reason } => {
                    result = Err(reason);
                    break;
                }
            }
        }
        self.publish_state();
        result
    }

    fn publish_state(&self) {
        let next = self.machine.state();
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    async fn write(&mut self, outbound: &Outbound) -> std::io::Result<()> {
        if outbound.sensitive {
            debug!(id = %outbound.id, len = outbound.bytes.len(), "SEND (sensitive)");
        } else {
            debug!(data = %String::from_utf8_lossy(&outbound.bytes), "SEND");
        }
        self.writer.write_all(&outbound.bytes).await?;
        self.writer.flush().await
    }

    async fn handle_command(&mut self, command: Command) -> std::result::Result<(), DisconnectReason> {
        match command {
            Command::Send {
                outbound,
                kind,
                reply,
            } => {
                if let Err(e) = self.machine.check_send(kind, SystemTime::now()) {
                    let _ = reply.send(Err(e));
                    return Ok(());
                }
                if let Err(e) = self.write(&outbound).await {
                    let _ = reply.send(Err(Error::SessionClosed));
                    return Err(DisconnectReason::Io(e.to_string()));
                }
                if kind == SendKind::Ping {
                    self.dispatcher.ping_sent(Instant::now());
                }
                let _ = reply.send(Ok(()));
            }
            Command::Request {
                outbound,
                timeout,
                reply,
            } => {
                if let Err(e) = self.machine.check_send(SendKind::Application, SystemTime::now()) {
                    let _ = reply.send(Err(e));
                    return Ok(());
                }
                let timeout = timeout.unwrap_or_else(|| self.context.config.request_timeout());
                let handle = match self
                    .correlator
                    .register(outbound.id.clone(), Some((Instant::now() + timeout, timeout)))
                {
                    Ok(handle) => handle,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return Ok(());
                    }
                };
                if let Err(e) = self.write(&outbound).await {
                    // The handle completes with Cancelled during teardown.
                    let _ = reply.send(Ok(handle));
                    return Err(DisconnectReason::Io(e.to_string()));
                }
                let _ = reply.send(Ok(handle));
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.correlator.cancel(&id));
            }
            Command::AnswerCaptcha { response, reply } => {
                match self.machine.answer_captcha(&response) {
                    Ok(actions) => {
                        let _ = reply.send(Ok(()));
                        self.apply(actions).await?;
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
        }
        Ok(())
    }

    async fn expire_requests(&mut self) -> std::result::Result<(), DisconnectReason> {
        for id in self.correlator.expire(Instant::now()) {
            let actions = self.machine.on_request_expired(&id);
            self.apply(actions).await?;
        }
        Ok(())
    }

    async fn teardown(mut self, reason: DisconnectReason) {
        self.correlator.fail_all(|| Error::Cancelled);

        if !matches!(reason, DisconnectReason::Io(_)) {
            let close = async {
                self.writer.write_all(b"</k>").await?;
                self.writer.shutdown().await
            };
            if let Ok(Err(e)) = tokio::time::timeout(CLOSE_WRITE_TIMEOUT, close).await {
                debug!(error = %e, "Closing tag not written");
            }
        }

        for action in self.machine.disconnected(reason) {
            if let SessionAction::Notify(notification) = action {
                self.dispatcher.notify(&notification);
            }
        }
        self.publish_state();
    }
}

/// Write the stream-opening `<k>` and move the machine to AwaitingHandshake.
async fn open_stream<W: AsyncWrite + Unpin>(
    writer: &mut W,
    context: &SessionContext,
    machine: &mut SessionMachine,
) -> Result<()> {
    let init = StreamInit::for_credentials(
        &context.credentials,
        &context.config.device,
        system_time_millis(),
    )?;
    let outbound = Outbound::from_request(&init);
    debug!(id = %outbound.id, len = outbound.bytes.len(), "Opening stream");
    writer.write_all(&outbound.bytes).await?;
    writer.flush().await?;
    machine.socket_established()
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

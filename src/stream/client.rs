//! Persistent websocket connections to Komodo Core.
//!
//! Each connection runs the login [`Handshake`], then forwards authenticated
//! traffic to the application as [`ConnectionEvent`]s. Reconnects are owned
//! by [`subscribe`]; a connection here lives for exactly one socket.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use crate::auth::Session;
use crate::rpc::KomodoClient;
use crate::stream::handshake::{
    Handshake, HandshakeAction, HandshakeError, InboundFrame, Payload, PayloadFraming,
};
use crate::stream::proto::{
    ConnectContainerExecQuery, ConnectDeploymentExecQuery, ConnectStackExecQuery,
    ConnectTerminalQuery, ResizeDimensions, TerminalInput, Update,
};
use crate::stream::supervisor::{subscribe, CloseSignal, SubscribeOptions};
use crate::terminal::ExecResource;

/// Lifecycle and traffic of a persistent connection, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent<T> {
    /// Socket open and login message sent.
    Opened,
    /// Server accepted the login. Fired once per connection.
    LoggedIn,
    /// Authenticated application message.
    Message(T),
    /// Connection finished. Fired once per connection attempt.
    Closed,
}

/// Event on the update feed.
pub type UpdateEvent = ConnectionEvent<Update>;
/// Raw pty output.
pub type TerminalEvent = ConnectionEvent<Vec<u8>>;

/// Errors ending a single connection attempt.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid connection query: {0}")]
    Query(#[from] serde_urlencoded::ser::Error),

    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),
}

/// Cloneable sender for terminal input.
#[derive(Clone, Debug)]
pub struct TerminalSender {
    tx: mpsc::UnboundedSender<TerminalInput>,
}

impl TerminalSender {
    /// Sender plus the receiver to hand to a terminal connection.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TerminalInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues input. Returns `false` once the connection is gone.
    pub fn send(&self, input: TerminalInput) -> bool {
        self.tx.send(input).is_ok()
    }

    /// Queues raw bytes for the pty.
    pub fn write(&self, bytes: impl Into<Vec<u8>>) -> bool {
        self.send(TerminalInput::Data(bytes.into()))
    }

    /// Queues a terminal resize.
    pub fn resize(&self, rows: u16, cols: u16) -> bool {
        self.send(TerminalInput::Resize(ResizeDimensions { rows, cols }))
    }
}

/// Terminal input surviving across reconnects.
///
/// Input is only read while a connection is authenticated, so anything
/// queued during login or between connections waits in the channel.
/// Frames that failed to send are retried first on the next connection.
#[derive(Debug)]
struct InputQueue {
    rx: mpsc::UnboundedReceiver<TerminalInput>,
    pending: VecDeque<TerminalInput>,
    closed: bool,
}

impl InputQueue {
    fn new(rx: mpsc::UnboundedReceiver<TerminalInput>) -> Self {
        Self {
            rx,
            pending: VecDeque::new(),
            closed: false,
        }
    }

    async fn next(&mut self) -> TerminalInput {
        if let Some(input) = self.pending.pop_front() {
            return input;
        }
        if !self.closed {
            match self.rx.recv().await {
                Some(input) => return input,
                None => self.closed = true,
            }
        }
        std::future::pending().await
    }
}

/// Decodes an authenticated payload into the channel's message type.
type Decode<T> = fn(Payload) -> Option<T>;

fn decode_update(payload: Payload) -> Option<Update> {
    let parsed = match &payload {
        Payload::Text(text) => serde_json::from_str(text),
        Payload::Bytes(bytes) => serde_json::from_slice(bytes),
    };
    match parsed {
        Ok(update) => Some(update),
        Err(err) => {
            warn!(event = "update_decode_failed", error = %err);
            None
        }
    }
}

fn decode_terminal(payload: Payload) -> Option<Vec<u8>> {
    match payload {
        Payload::Text(text) => Some(text.into_bytes()),
        Payload::Bytes(bytes) => Some(bytes),
    }
}

impl KomodoClient {
    /// Streams task updates into `events` until `options.cancel` fires,
    /// reconnecting after every close.
    pub async fn subscribe_to_update_websocket(
        &self,
        events: mpsc::UnboundedSender<UpdateEvent>,
        options: SubscribeOptions,
    ) {
        let url = format!("{}/ws/update", self.ws_address());
        let session = self.session().clone();
        let settings = AttemptSettings {
            framing: PayloadFraming::Text,
            login_timeout: options.login_timeout,
        };

        subscribe(
            |close| {
                run_connection(
                    url.clone(),
                    session.clone(),
                    settings,
                    decode_update as Decode<Update>,
                    events.clone(),
                    None,
                    close,
                )
            },
            options,
        )
        .await
    }

    /// Attaches to a server terminal. Output is sent to `events`; `input`
    /// is written to the pty once logged in.
    ///
    /// Fails only if the query cannot be encoded.
    pub async fn connect_terminal(
        &self,
        query: &ConnectTerminalQuery,
        input: mpsc::UnboundedReceiver<TerminalInput>,
        events: mpsc::UnboundedSender<TerminalEvent>,
        options: SubscribeOptions,
    ) -> Result<(), ConnectionError> {
        let url = self.terminal_url("/ws/terminal", query)?;
        self.run_terminal(url, input, events, options).await;
        Ok(())
    }

    /// Attaches to a shell inside a container on a server.
    pub async fn connect_container_exec(
        &self,
        query: &ConnectContainerExecQuery,
        input: mpsc::UnboundedReceiver<TerminalInput>,
        events: mpsc::UnboundedSender<TerminalEvent>,
        options: SubscribeOptions,
    ) -> Result<(), ConnectionError> {
        self.connect_exec(ExecResource::Container, query, input, events, options)
            .await
    }

    /// Attaches to a shell inside a deployment's container.
    pub async fn connect_deployment_exec(
        &self,
        query: &ConnectDeploymentExecQuery,
        input: mpsc::UnboundedReceiver<TerminalInput>,
        events: mpsc::UnboundedSender<TerminalEvent>,
        options: SubscribeOptions,
    ) -> Result<(), ConnectionError> {
        self.connect_exec(ExecResource::Deployment, query, input, events, options)
            .await
    }

    /// Attaches to a shell inside a stack service container.
    pub async fn connect_stack_exec(
        &self,
        query: &ConnectStackExecQuery,
        input: mpsc::UnboundedReceiver<TerminalInput>,
        events: mpsc::UnboundedSender<TerminalEvent>,
        options: SubscribeOptions,
    ) -> Result<(), ConnectionError> {
        self.connect_exec(ExecResource::Stack, query, input, events, options)
            .await
    }

    async fn connect_exec<Q: Serialize>(
        &self,
        resource: ExecResource,
        query: &Q,
        input: mpsc::UnboundedReceiver<TerminalInput>,
        events: mpsc::UnboundedSender<TerminalEvent>,
        options: SubscribeOptions,
    ) -> Result<(), ConnectionError> {
        let path = format!("/ws/{}/terminal", resource.as_str());
        let url = self.terminal_url(&path, query)?;
        self.run_terminal(url, input, events, options).await;
        Ok(())
    }

    fn terminal_url<Q: Serialize>(&self, path: &str, query: &Q) -> Result<String, ConnectionError> {
        let query = serde_urlencoded::to_string(query)?;
        Ok(format!("{}{}?{}", self.ws_address(), path, query))
    }

    async fn run_terminal(
        &self,
        url: String,
        input: mpsc::UnboundedReceiver<TerminalInput>,
        events: mpsc::UnboundedSender<TerminalEvent>,
        options: SubscribeOptions,
    ) {
        let session = self.session().clone();
        let input = Arc::new(Mutex::new(InputQueue::new(input)));
        let settings = AttemptSettings {
            framing: PayloadFraming::Binary,
            login_timeout: options.login_timeout,
        };

        subscribe(
            |close| {
                run_connection(
                    url.clone(),
                    session.clone(),
                    settings,
                    decode_terminal as Decode<Vec<u8>>,
                    events.clone(),
                    Some(Arc::clone(&input)),
                    close,
                )
            },
            options,
        )
        .await
    }
}

/// Per-attempt settings read from [`SubscribeOptions`].
#[derive(Clone, Copy, Debug)]
struct AttemptSettings {
    framing: PayloadFraming,
    login_timeout: Option<Duration>,
}

/// Runs one connection from open to close.
///
/// [`ConnectionEvent::Closed`] is emitted exactly once whatever the
/// outcome, including a failed open.
async fn run_connection<T>(
    url: String,
    session: Session,
    settings: AttemptSettings,
    decode: Decode<T>,
    events: mpsc::UnboundedSender<ConnectionEvent<T>>,
    input: Option<Arc<Mutex<InputQueue>>>,
    close: CloseSignal,
) -> Result<(), ConnectionError> {
    let mut handshake = Handshake::new(settings.framing);
    let result = drive_connection(
        &url,
        &session,
        &mut handshake,
        settings.login_timeout,
        decode,
        &events,
        input,
        close,
    )
    .await;

    if handshake.on_close() == HandshakeAction::Closed {
        let _ = events.send(ConnectionEvent::Closed);
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn drive_connection<T>(
    url: &str,
    session: &Session,
    handshake: &mut Handshake,
    login_timeout: Option<Duration>,
    decode: Decode<T>,
    events: &mpsc::UnboundedSender<ConnectionEvent<T>>,
    input: Option<Arc<Mutex<InputQueue>>>,
    mut close: CloseSignal,
) -> Result<(), ConnectionError> {
    // A stalled upgrade must still honour a close request.
    let (mut socket, _) = tokio::select! {
        _ = close.requested() => {
            debug!(event = "ws_close_requested_while_opening");
            return Ok(());
        }
        connected = connect_async(url) => connected?,
    };

    // Credentials are read now, so a rotation applies from the next connect.
    let login = match handshake.on_open(session.login_message()) {
        Ok(HandshakeAction::SendLogin(login)) => login,
        Ok(_) => return Ok(()),
        Err(err) => {
            let _ = socket.close(None).await;
            return Err(err.into());
        }
    };
    let text = serde_json::to_string(&login)?;
    tokio::select! {
        _ = close.requested() => {
            debug!(event = "ws_close_requested_while_opening");
            return Ok(());
        }
        sent = socket.send(Message::Text(text)) => sent?,
    }
    let _ = events.send(ConnectionEvent::Opened);
    debug!(event = "ws_opened", path = %redact_query(url));

    let login_deadline = login_timeout.map(|timeout| Instant::now() + timeout);
    let mut input = match input {
        Some(queue) => Some(queue.lock_owned().await),
        None => None,
    };

    loop {
        let authenticated = handshake.is_authenticated();
        tokio::select! {
            _ = close.requested() => {
                debug!(event = "ws_close_requested");
                let _ = socket.close(None).await;
                return Ok(());
            }
            _ = login_deadline_elapsed(login_deadline, authenticated) => {
                let _ = socket.close(None).await;
                return Err(HandshakeError::LoginTimedOut.into());
            }
            outbound = next_input(input.as_deref_mut(), authenticated) => {
                let frame = match outbound.encode() {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(event = "terminal_input_encode_failed", error = %err);
                        continue;
                    }
                };
                if let Err(err) = socket.send(Message::Binary(frame)).await {
                    if let Some(queue) = input.as_deref_mut() {
                        queue.pending.push_front(outbound);
                    }
                    return Err(err.into());
                }
            }
            inbound = socket.next() => {
                // tungstenite answers pings itself.
                let frame = match inbound {
                    Some(Ok(Message::Text(text))) => InboundFrame::Text(text),
                    Some(Ok(Message::Binary(bytes))) => InboundFrame::Binary(bytes),
                    Some(Ok(Message::Ping(_)))
                    | Some(Ok(Message::Pong(_)))
                    | Some(Ok(Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => return closed_by_peer(handshake),
                    Some(Err(err)) => return Err(err.into()),
                };

                match handshake.on_frame(frame) {
                    Ok(HandshakeAction::LoggedIn) => {
                        debug!(event = "ws_logged_in");
                        let _ = events.send(ConnectionEvent::LoggedIn);
                    }
                    Ok(HandshakeAction::Deliver(payload)) => {
                        if let Some(message) = decode(payload) {
                            let _ = events.send(ConnectionEvent::Message(message));
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        let _ = socket.close(None).await;
                        return Err(err.into());
                    }
                }
            }
        }
    }
}

/// A peer close before login that came with a reason is a rejected login.
fn closed_by_peer(handshake: &Handshake) -> Result<(), ConnectionError> {
    match handshake.login_rejection() {
        Some(reason) if !handshake.is_authenticated() => {
            Err(HandshakeError::LoginRejected(reason.to_string()).into())
        }
        _ => Ok(()),
    }
}

/// Completes once `deadline` passes while still unauthenticated.
async fn login_deadline_elapsed(deadline: Option<Instant>, authenticated: bool) {
    match deadline {
        Some(deadline) if !authenticated => tokio::time::sleep_until(deadline).await,
        _ => std::future::pending().await,
    }
}

async fn next_input(queue: Option<&mut InputQueue>, authenticated: bool) -> TerminalInput {
    match queue {
        Some(queue) if authenticated => queue.next().await,
        _ => std::future::pending().await,
    }
}

/// Terminal queries can carry names worth keeping out of logs.
fn redact_query(url: &str) -> &str {
    url.split_once('?').map(|(path, _)| path).unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::{timeout, Instant};

    use super::{
        closed_by_peer, decode_terminal, decode_update, login_deadline_elapsed, redact_query,
        ConnectionError, InputQueue, TerminalSender,
    };
    use crate::auth::Session;
    use crate::rpc::KomodoClient;
    use crate::stream::handshake::{
        Handshake, HandshakeError, InboundFrame, Payload, PayloadFraming,
    };
    use crate::stream::proto::LoginMessage;
    use crate::stream::proto::{
        ConnectContainerExecQuery, ConnectTerminalQuery, ResizeDimensions, TerminalInput,
        UpdateStatus,
    };

    #[test]
    fn terminal_url_encodes_query() {
        let client =
            KomodoClient::new("https://komodo.example.com", Session::anonymous()).expect("client");
        let url = client
            .terminal_url(
                "/ws/terminal",
                &ConnectTerminalQuery {
                    server: "prod 1".to_string(),
                    terminal: "main".to_string(),
                    init: None,
                },
            )
            .expect("url");
        assert_eq!(url, "wss://komodo.example.com/ws/terminal?server=prod+1&terminal=main");

        let url = client
            .terminal_url(
                "/ws/container/terminal",
                &ConnectContainerExecQuery {
                    server: "prod".to_string(),
                    container: "web".to_string(),
                    shell: "sh".to_string(),
                },
            )
            .expect("url");
        assert_eq!(
            url,
            "wss://komodo.example.com/ws/container/terminal?server=prod&container=web&shell=sh"
        );
    }

    #[test]
    fn update_payloads_are_decoded_and_garbage_skipped() {
        let update = decode_update(Payload::Text(
            r#"{"_id":{"$oid":"u1"},"status":"Complete"}"#.to_string(),
        ))
        .expect("decode update");
        assert_eq!(update.id(), Some("u1"));
        assert_eq!(update.status, UpdateStatus::Complete);

        assert!(decode_update(Payload::Text("not json".to_string())).is_none());
    }

    #[test]
    fn terminal_payloads_are_raw_bytes() {
        assert_eq!(
            decode_terminal(Payload::Text("$ ".to_string())),
            Some(b"$ ".to_vec())
        );
        assert_eq!(decode_terminal(Payload::Bytes(vec![0, 1])), Some(vec![0, 1]));
    }

    #[test]
    fn redact_query_drops_everything_after_question_mark() {
        assert_eq!(
            redact_query("ws://host/ws/terminal?server=a&terminal=b"),
            "ws://host/ws/terminal"
        );
        assert_eq!(redact_query("ws://host/ws/update"), "ws://host/ws/update");
    }

    #[tokio::test]
    async fn input_queue_replays_pending_before_channel() {
        let (sender, rx) = TerminalSender::channel();
        let mut queue = InputQueue::new(rx);

        assert!(sender.write(b"ls\n".to_vec()));
        queue.pending.push_back(TerminalInput::Data(b"retry".to_vec()));

        assert_eq!(queue.next().await, TerminalInput::Data(b"retry".to_vec()));
        assert_eq!(queue.next().await, TerminalInput::Data(b"ls\n".to_vec()));

        assert!(sender.resize(40, 120));
        assert_eq!(
            queue.next().await,
            TerminalInput::Resize(ResizeDimensions { rows: 40, cols: 120 })
        );
    }

    #[test]
    fn terminal_sender_reports_dropped_connection() {
        let (sender, rx) = TerminalSender::channel();
        drop(rx);
        assert!(!sender.write("echo hi"));
    }

    #[tokio::test(start_paused = true)]
    async fn login_deadline_fires_only_while_unauthenticated() {
        let started = Instant::now();
        let deadline = Some(started + Duration::from_secs(3));

        login_deadline_elapsed(deadline, false).await;
        assert!(started.elapsed() >= Duration::from_secs(3));

        let after_login = timeout(
            Duration::from_secs(60),
            login_deadline_elapsed(Some(Instant::now()), true),
        )
        .await;
        assert!(after_login.is_err());

        let no_deadline = timeout(Duration::from_secs(60), login_deadline_elapsed(None, false)).await;
        assert!(no_deadline.is_err());
    }

    #[test]
    fn peer_close_before_login_reports_server_reason() {
        let mut handshake = Handshake::new(PayloadFraming::Text);
        handshake
            .on_open(Some(LoginMessage::Jwt {
                jwt: "expired".to_string(),
            }))
            .expect("open");
        assert!(closed_by_peer(&handshake).is_ok());

        handshake
            .on_frame(InboundFrame::Text("failed to get login message".to_string()))
            .expect("reason frame");
        let err = closed_by_peer(&handshake).expect_err("rejected login");
        assert!(matches!(
            err,
            ConnectionError::Handshake(HandshakeError::LoginRejected(ref reason))
                if reason == "failed to get login message"
        ));

        let mut accepted = Handshake::new(PayloadFraming::Text);
        accepted
            .on_open(Some(LoginMessage::Jwt {
                jwt: "ok".to_string(),
            }))
            .expect("open");
        accepted
            .on_frame(InboundFrame::Text("LOGGED_IN".to_string()))
            .expect("ack");
        assert!(closed_by_peer(&accepted).is_ok());
    }
}

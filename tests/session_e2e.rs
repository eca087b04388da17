//! End-to-end session tests against a scripted server over an in-memory pipe.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use kik_session::crypto::derive_key;
use kik_session::events::{
    CaptchaChallenge, ConnectionFailure, IncomingMessage, LoginFailure, LoginSuccess, TempBan,
};
use kik_session::framing::{Frame, Framer, MAX_STANZA_SIZE};
use kik_session::requests::{ChatMessage, RosterRequest};
use kik_session::stanza::decode;
use kik_session::{
    Credentials, DeviceProfile, DisconnectReason, Error, Session, SessionCallbacks,
    SessionConfig, SessionHandle, SessionState, Stanza,
};

const WAIT: Duration = Duration::from_secs(5);

async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(WAIT, fut).await.expect("timed out")
}

/// Records callbacks as short strings, in invocation order.
struct Recorder {
    events: mpsc::UnboundedSender<String>,
}

impl Recorder {
    fn push(&self, event: String) {
        let _ = self.events.send(event);
    }
}

impl SessionCallbacks for Recorder {
    fn on_authenticated(&self) {
        self.push("authenticated".into());
    }
    fn on_login_ended(&self, success: &LoginSuccess) {
        self.push(format!("login_ended:{}", success.node));
    }
    fn on_login_error(&self, failure: &LoginFailure) {
        self.push(format!("login_error:{}", failure.message));
    }
    fn on_connection_failed(&self, failure: &ConnectionFailure) {
        self.push(format!("connection_failed:{}", failure.is_bad_version));
    }
    fn on_captcha_received(&self, _: &CaptchaChallenge) {
        self.push("captcha".into());
    }
    fn on_temp_ban_received(&self, _: &TempBan) {
        self.push("temp_ban".into());
    }
    fn on_disconnected(&self, reason: &DisconnectReason) {
        self.push(format!("disconnected:{:?}", reason));
    }
    fn on_chat_message(&self, message: &IncomingMessage) {
        self.push(format!("chat:{}", message.message_id));
    }
    fn on_iq_response(&self, stanza: &Stanza) {
        self.push(format!("iq_response:{}", stanza.id().unwrap_or_default()));
    }
}

/// The server end of the pipe.
struct Server {
    io: DuplexStream,
    framer: Framer,
}

impl Server {
    /// Read the client's stream-opening `<k ...>`.
    async fn accept(mut io: DuplexStream) -> (Server, Stanza) {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b">") {
            within(io.read_exact(&mut byte)).await.unwrap();
            head.push(byte[0]);
        }
        let init = decode(&head).unwrap();
        let server = Server {
            io,
            framer: Framer::new(MAX_STANZA_SIZE),
        };
        (server, init)
    }

    async fn send(&mut self, xml: &str) {
        self.io.write_all(xml.as_bytes()).await.unwrap();
    }

    async fn next(&mut self) -> Frame {
        let mut buf = [0u8; 4096];
        loop {
            match self.framer.next_frame().unwrap() {
                Frame::Incomplete => {
                    let n = within(self.io.read(&mut buf)).await.unwrap();
                    assert!(n > 0, "client closed the pipe");
                    self.framer.feed(&buf[..n]);
                }
                frame => return frame,
            }
        }
    }

    async fn recv(&mut self) -> Stanza {
        match self.next().await {
            Frame::Stanza(bytes) => decode(&bytes).unwrap(),
            other => panic!("expected a stanza, got {:?}", other),
        }
    }

    async fn expect_close(&mut self) {
        assert_eq!(self.next().await, Frame::StreamClosed);
    }
}

struct Harness {
    handle: SessionHandle,
    server: Server,
    init: Stanza,
    events: mpsc::UnboundedReceiver<String>,
}

impl Harness {
    async fn event(&mut self) -> String {
        within(self.events.recv()).await.expect("callbacks dropped")
    }

    async fn wait_state(&self, target: SessionState) {
        let mut state = self.handle.subscribe_state();
        within(state.wait_for(|s| *s == target)).await.unwrap();
    }
}

fn config() -> SessionConfig {
    SessionConfig {
        device: DeviceProfile {
            device_id: "dev0".into(),
            android_id: "and0".into(),
            ..DeviceProfile::default()
        },
        ..SessionConfig::default()
    }
}

async fn start(credentials: Credentials) -> Harness {
    let (client_io, server_io) = duplex(64 * 1024);
    let (tx, events) = mpsc::unbounded_channel();
    let handle = Session::spawn(
        client_io,
        config(),
        Arc::new(credentials),
        Arc::new(Recorder { events: tx }),
    )
    .await
    .unwrap();
    let (server, init) = Server::accept(server_io).await;
    Harness {
        handle,
        server,
        init,
        events,
    }
}

/// Handshake, login, success. Returns a harness in the Authenticated state.
async fn authenticated() -> Harness {
    let mut h = start(Credentials::password("alice", "pw")).await;
    h.server.send("<k ok=\"1\" />").await;
    let login = h.server.recv().await;
    let id = login.id().unwrap().to_string();
    h.server
        .send(&format!(
            "<iq type=\"result\" id=\"{}\"><query xmlns=\"jabber:iq:register\"><node>alice_n</node></query></iq>",
            id
        ))
        .await;
    within(h.handle.wait_authenticated()).await.unwrap();
    assert_eq!(h.event().await, "login_ended:alice_n");
    assert_eq!(h.event().await, "authenticated");
    assert_eq!(h.event().await, format!("iq_response:{}", id));
    h
}

fn millis_from_now(offset: Duration) -> u128 {
    (SystemTime::now() + offset)
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis()
}

#[tokio::test]
async fn test_handshake_then_login() {
    let mut h = start(Credentials::password("alice", "pw")).await;
    assert_eq!(h.init.name, "k");
    assert_eq!(h.init.attr("anon"), Some(""));
    assert_eq!(h.init.attr("dev"), Some("CANdev0"));
    assert_eq!(h.handle.state(), SessionState::AwaitingHandshake);

    h.server.send("<k ok=\"1\" />").await;
    h.wait_state(SessionState::Authenticating).await;

    let login = h.server.recv().await;
    assert_eq!(login.name, "iq");
    assert_eq!(login.attr("type"), Some("set"));
    let query = login.child("query").unwrap();
    assert_eq!(query.attr("xmlns"), Some("jabber:iq:register"));
    assert_eq!(query.child_text("passkey-u"), Some(derive_key("alice", "pw").unwrap()));

    // Application traffic waits for authentication.
    let msg = ChatMessage::new("bob@talk.kik.com", "early", 0);
    assert!(matches!(
        h.handle.send(&msg).await,
        Err(Error::SessionNotReady(SessionState::Authenticating))
    ));
    assert!(matches!(
        h.handle.ping().await,
        Err(Error::SessionNotReady(SessionState::Authenticating))
    ));

    h.server
        .send(&format!(
            "<iq type=\"result\" id=\"{}\"><query xmlns=\"jabber:iq:register\"><node>alice_n</node></query></iq>",
            login.id().unwrap()
        ))
        .await;
    h.wait_state(SessionState::Authenticated).await;
    assert_eq!(h.event().await, "login_ended:alice_n");
    assert_eq!(h.event().await, "authenticated");
}

#[tokio::test]
async fn test_node_stream_skips_login() {
    let creds = Credentials::password("alice", "pw").with_node("alice_n");
    let mut h = start(creds).await;
    assert_eq!(h.init.attr("from"), Some("alice_n@talk.kik.com/CANdev0"));
    assert_eq!(h.init.attr("p"), Some(derive_key("alice", "pw").unwrap().as_str()));

    let server_ts = millis_from_now(Duration::from_secs(3600));
    h.server
        .send(&format!("<k ok=\"1\" ts=\"{}\">", server_ts))
        .await;
    within(h.handle.wait_authenticated()).await.unwrap();
    assert_eq!(h.event().await, "authenticated");

    let skew = h.handle.server_time_millis() as i128 - millis_from_now(Duration::ZERO) as i128;
    assert!((3_590_000..=3_610_000).contains(&skew), "skew {}", skew);
}

#[tokio::test]
async fn test_login_hands_over_to_node_stream() {
    let mut h = authenticated().await;
    let success = h.handle.login_success().unwrap();
    assert_eq!(success.node, "alice_n");

    let (client_io, server_io) = duplex(64 * 1024);
    let (tx, mut events) = mpsc::unbounded_channel();
    let next = within(Session::spawn_authenticated(
        &h.handle,
        client_io,
        config(),
        &Credentials::password("alice", "pw"),
        Arc::new(Recorder { events: tx }),
    ))
    .await
    .unwrap();

    // The login stream is closed before the new one opens.
    assert_eq!(h.handle.state(), SessionState::Disconnected);
    h.server.expect_close().await;
    assert_eq!(h.event().await, "disconnected:Shutdown");

    let (mut server, init) = Server::accept(server_io).await;
    assert_eq!(init.attr("from"), Some("alice_n@talk.kik.com/CANdev0"));
    assert_eq!(init.attr("p"), Some(derive_key("alice", "pw").unwrap().as_str()));
    assert_eq!(init.attr("anon"), None);

    server
        .send(&format!("<k ok=\"1\" ts=\"{}\">", millis_from_now(Duration::ZERO)))
        .await;
    within(next.wait_authenticated()).await.unwrap();
    assert_eq!(within(events.recv()).await.unwrap(), "authenticated");
    assert!(next.login_success().is_none());

    next.send(&ChatMessage::new("bob@talk.kik.com", "hi", 0)).await.unwrap();
    assert_eq!(server.recv().await.name, "message");
}

#[tokio::test]
async fn test_hand_over_requires_login() {
    let creds = Credentials::password("alice", "pw").with_node("alice_n");
    let mut h = start(creds.clone()).await;
    h.server.send("<k ok=\"1\" ts=\"1\">").await;
    within(h.handle.wait_authenticated()).await.unwrap();
    assert_eq!(h.event().await, "authenticated");

    let (client_io, _server_io) = duplex(1024);
    let result = Session::spawn_authenticated(
        &h.handle,
        client_io,
        config(),
        &creds,
        Arc::new(kik_session::NoopCallbacks),
    )
    .await;
    assert!(matches!(
        result,
        Err(Error::SessionNotReady(SessionState::Authenticated))
    ));
    // The existing session is left running.
    assert_eq!(h.handle.state(), SessionState::Authenticated);
}

#[tokio::test]
async fn test_request_response_and_stanzas_in_one_read() {
    let mut h = authenticated().await;

    let handle = h.handle.clone();
    let roster = RosterRequest::new();
    let waiter = tokio::spawn(async move { handle.request(&roster, None).await });

    let sent = h.server.recv().await;
    let id = sent.id().unwrap().to_string();
    assert_eq!(
        sent.child("query").and_then(|q| q.attr("xmlns")),
        Some("jabber:iq:roster")
    );

    // Response and two chat messages in a single write.
    h.server
        .send(&format!(
            "<iq type=\"result\" id=\"{id}\"><query xmlns=\"jabber:iq:roster\"/></iq>\
             <message type=\"chat\" from=\"bob@talk.kik.com\" id=\"m1\"><body>one</body></message>\
             <message type=\"chat\" from=\"bob@talk.kik.com\" id=\"m2\"><body>two</body></message>"
        ))
        .await;

    let response = within(waiter).await.unwrap().unwrap();
    assert_eq!(response.id(), Some(id.as_str()));
    assert_eq!(h.event().await, format!("iq_response:{}", id));
    assert_eq!(h.event().await, "chat:m1");
    assert_eq!(h.event().await, "chat:m2");
}

#[tokio::test]
async fn test_request_timeout() {
    let h = authenticated().await;
    let result = h
        .handle
        .request(&RosterRequest::new(), Some(Duration::from_millis(50)))
        .await;
    assert!(matches!(result, Err(Error::TimedOut(d)) if d == Duration::from_millis(50)));
    assert_eq!(h.handle.state(), SessionState::Authenticated);
}

#[tokio::test]
async fn test_temp_ban_blocks_sends_without_writing() {
    let mut h = authenticated().await;
    let expires = millis_from_now(Duration::from_secs(600));
    h.server
        .send(&format!(
            "<stc id=\"ban1\"><stp type=\"bn\" expires=\"{}\"/></stc>",
            expires
        ))
        .await;
    h.wait_state(SessionState::TempBanned).await;
    assert_eq!(h.event().await, "temp_ban");

    let msg = ChatMessage::new("bob@talk.kik.com", "hello", 0);
    assert!(matches!(h.handle.send(&msg).await, Err(Error::TempBanned(_))));
    assert!(matches!(h.handle.ping().await, Err(Error::TempBanned(_))));

    // Nothing reached the socket before the closing tag.
    h.handle.shutdown();
    h.server.expect_close().await;
}

#[tokio::test]
async fn test_login_captcha_then_success() {
    let mut h = start(Credentials::password("alice", "pw")).await;
    h.server.send("<k ok=\"1\">").await;
    let login = h.server.recv().await;
    h.server
        .send(&format!(
            "<iq type=\"error\" id=\"{}\"><error code=\"406\" type=\"modify\"><challenge><captcha-url>https://captcha.kik.com/c?id=7</captcha-url></challenge></error></iq>",
            login.id().unwrap()
        ))
        .await;

    assert!(matches!(
        within(h.handle.wait_authenticated()).await,
        Err(Error::CaptchaRequired)
    ));
    assert_eq!(h.event().await, "captcha");
    let msg = ChatMessage::new("bob@talk.kik.com", "hello", 0);
    assert!(matches!(
        h.handle.send(&msg).await,
        Err(Error::SessionNotReady(SessionState::CaptchaRequired))
    ));

    h.handle.answer_captcha("solved").await.unwrap();
    let retry = h.server.recv().await;
    assert_ne!(retry.id(), login.id());
    assert_eq!(
        retry
            .child("query")
            .and_then(|q| q.child("challenge"))
            .and_then(|c| c.child_text("response"))
            .as_deref(),
        Some("solved")
    );

    h.server
        .send(&format!(
            "<iq type=\"result\" id=\"{}\"><query xmlns=\"jabber:iq:register\"><node>alice_n</node></query></iq>",
            retry.id().unwrap()
        ))
        .await;
    within(h.handle.wait_authenticated()).await.unwrap();
}

#[tokio::test]
async fn test_login_error_disconnects() {
    let mut h = start(Credentials::password("alice", "wrong")).await;
    h.server.send("<k ok=\"1\">").await;
    let login = h.server.recv().await;
    h.server
        .send(&format!(
            "<iq type=\"error\" id=\"{}\"><error code=\"406\"><password-mismatch/></error></iq>",
            login.id().unwrap()
        ))
        .await;

    assert_eq!(h.event().await, "login_error:password mismatch");
    assert_eq!(h.event().await, "disconnected:LoginFailed");
    h.server.expect_close().await;
    within(h.handle.closed()).await;
    assert_eq!(h.handle.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_handshake_rejected() {
    let mut h = start(Credentials::password("alice", "pw")).await;
    h.server
        .send("<k ok=\"0\"><msg>Client version too old</msg></k>")
        .await;
    assert_eq!(h.event().await, "connection_failed:true");
    assert_eq!(h.event().await, "disconnected:HandshakeRejected");
    within(h.handle.closed()).await;
}

#[tokio::test]
async fn test_shutdown_cancels_pending_and_notifies_once() {
    let mut h = authenticated().await;
    let pending = h
        .handle
        .start_request(&RosterRequest::new(), None)
        .await
        .unwrap();
    h.server.recv().await;

    h.handle.shutdown();
    assert!(matches!(within(pending.wait()).await, Err(Error::Cancelled)));
    h.server.expect_close().await;
    within(h.handle.closed()).await;

    assert_eq!(h.event().await, "disconnected:Shutdown");
    assert!(h.events.try_recv().is_err());
    assert_eq!(h.handle.state(), SessionState::Disconnected);
    assert!(matches!(
        h.handle.send(&ChatMessage::new("bob@talk.kik.com", "late", 0)).await,
        Err(Error::SessionClosed)
    ));
}

#[tokio::test]
async fn test_mismatched_close_disconnects() {
    let mut h = authenticated().await;
    h.server
        .send("<message type=\"chat\" from=\"bob@talk.kik.com\" id=\"m1\"><body>hi</message>")
        .await;
    let event = h.event().await;
    assert!(event.starts_with("disconnected:Protocol"), "{}", event);
    within(h.handle.closed()).await;
}

#[tokio::test]
async fn test_peer_stream_close() {
    let mut h = authenticated().await;
    h.server.send("</k>").await;
    assert_eq!(h.event().await, "disconnected:StreamClosed");
    within(h.handle.closed()).await;
}

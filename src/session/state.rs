//! Connection and authentication state machine.
//!
//! # Architecture: action-based state machine
//!
//! - No I/O; wall-clock time is passed in by the caller.
//! - Methods return the [`SessionAction`]s the session task must execute
//!   (write bytes, notify callbacks, close the socket).
//!
//! # States
//!
//! ```text
//! Disconnected ─connect─> Connecting ─socket─> AwaitingHandshake
//!                                                │ ok="1"        │ ok="1" ts=..
//!                                                ↓               ↓
//!        CaptchaRequired <──captcha── Authenticating ──ok──> Authenticated
//!               └──────────answer──────────┘     │ ban            │ ban / stc captcha
//!                                                ↓                ↓
//!                                            TempBanned <─────────┘
//! ```
//!
//! A ban received while a captcha is pending also lands in `TempBanned`.
//! Every state reaches `Disconnected` on socket error, peer close, framing
//! error or explicit shutdown. `Disconnected` and `TempBanned` never recover
//! on their own: the caller reconnects.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::config::{Credentials, DeviceProfile};
use crate::error::{Error, Result};
use crate::events::{
    CaptchaChallenge, CaptchaToken, ConnectionFailure, FromStanza, LoginFailure, LoginSuccess,
    TempBan,
};
use crate::requests::{auth_request, CaptchaAnswer, Outbound};
use crate::stanza::{Stanza, StanzaKind};

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingHandshake,
    Authenticating,
    Authenticated,
    CaptchaRequired,
    TempBanned,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Local shutdown.
    Shutdown,
    /// The peer closed the stream.
    StreamClosed,
    /// The server rejected the stream-opening handshake.
    HandshakeRejected,
    LoginFailed,
    LoginTimedOut,
    /// Structural violation of the stream (framing error, unexpected element).
    Protocol(String),
    /// Socket read or write failure.
    Io(String),
}

/// Events for the application callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Authenticated,
    LoginEnded(LoginSuccess),
    LoginError(LoginFailure),
    ConnectionFailed(ConnectionFailure),
    CaptchaReceived(CaptchaChallenge),
    TempBanReceived(TempBan),
    Disconnected(DisconnectReason),
}

/// Work for the session task.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Write a stanza. `track` registers its id with the correlator.
    Send { outbound: Outbound, track: bool },
    /// Server clock reading (epoch milliseconds) from the handshake.
    SyncClock(i64),
    Notify(Notification),
    Close { reason: DisconnectReason },
}

/// Sends subject to the state gate. Both kinds need `Authenticated`; a ping
/// also starts the pong latency measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    Application,
    Ping,
}

#[derive(Debug, Clone)]
struct PendingCaptcha {
    challenge: CaptchaChallenge,
    /// State to return to once an `stc` captcha is answered.
    resume: SessionState,
}

/// Session state machine. One per connection attempt.
#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
    credentials: Arc<Credentials>,
    device: DeviceProfile,
    /// Id of the in-flight login or registration request.
    auth_id: Option<String>,
    captcha: Option<PendingCaptcha>,
    ban_expiry: Option<SystemTime>,
    disconnect_notified: bool,
}

impl SessionMachine {
    pub fn new(credentials: Arc<Credentials>, device: DeviceProfile) -> Self {
        Self {
            state: SessionState::Disconnected,
            credentials,
            device,
            auth_id: None,
            captcha: None,
            ban_expiry: None,
            disconnect_notified: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Id of the pending authentication request, if any.
    pub fn auth_id(&self) -> Option<&str> {
        self.auth_id.as_deref()
    }

    pub fn captcha(&self) -> Option<&CaptchaChallenge> {
        self.captcha.as_ref().map(|c| &c.challenge)
    }

    pub fn ban_expiry(&self) -> Option<SystemTime> {
        self.ban_expiry
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Session state change");
            self.state = next;
        }
    }

    /// Disconnected → Connecting.
    pub fn connect_requested(&mut self) -> Result<()> {
        if self.state != SessionState::Disconnected || self.disconnect_notified {
            return Err(Error::SessionNotReady(self.state));
        }
        self.set_state(SessionState::Connecting);
        Ok(())
    }

    /// Connecting → AwaitingHandshake. The stream-opening `<k>` has been written.
    pub fn socket_established(&mut self) -> Result<()> {
        if self.state != SessionState::Connecting {
            return Err(Error::SessionNotReady(self.state));
        }
        self.set_state(SessionState::AwaitingHandshake);
        Ok(())
    }

    /// Feed a decoded inbound stanza.
    pub fn on_stanza(&mut self, stanza: &Stanza, now: SystemTime) -> Vec<SessionAction> {
        match (self.state, stanza.kind()) {
            (SessionState::AwaitingHandshake, StanzaKind::Handshake) => self.on_handshake(stanza),
            (SessionState::AwaitingHandshake, kind) => {
                self.close(DisconnectReason::Protocol(format!(
                    "expected handshake, received {:?}",
                    kind
                )))
            }
            (SessionState::Authenticating, StanzaKind::Iq { iq_type, .. })
                if stanza.id().is_some() && stanza.id() == self.auth_id.as_deref() =>
            {
                self.auth_id = None;
                match iq_type.as_deref() {
                    Some("result") => self.on_login_success(stanza),
                    _ => self.on_login_failure(stanza),
                }
            }
            (
                state @ (SessionState::Authenticating | SessionState::Authenticated),
                StanzaKind::Captcha,
            ) => match CaptchaChallenge::from_stanza(stanza) {
                Ok(challenge) => self.require_captcha(challenge, state),
                Err(e) => {
                    warn!(error = %e, "Ignoring unparseable captcha element");
                    Vec::new()
                }
            },
            (
                SessionState::Authenticating
                | SessionState::Authenticated
                | SessionState::CaptchaRequired,
                StanzaKind::TempBan,
            ) => {
                let ban = TempBan::from_stanza(stanza).unwrap_or_else(|e| {
                    warn!(error = %e, "Temp-ban element without details");
                    TempBan::default()
                });
                self.on_temp_ban(ban, now)
            }
            _ => Vec::new(),
        }
    }

    fn on_temp_ban(&mut self, ban: TempBan, now: SystemTime) -> Vec<SessionAction> {
        match ban.expiry {
            Some(expiry) => {
                warn!(expires_in = ?expiry.duration_since(now).ok(), "Account temporarily banned")
            }
            None => warn!("Account temporarily banned, no expiry given"),
        }
        self.ban_expiry = ban.expiry;
        self.auth_id = None;
        self.captcha = None;
        self.set_state(SessionState::TempBanned);
        vec![SessionAction::Notify(Notification::TempBanReceived(ban))]
    }

    fn on_handshake(&mut self, stanza: &Stanza) -> Vec<SessionAction> {
        if stanza.attr("ok") != Some("1") {
            let failure = match ConnectionFailure::from_stanza(stanza) {
                Ok(failure) => failure,
                Err(e) => {
                    return self.close(DisconnectReason::Protocol(e.to_string()));
                }
            };
            warn!(message = %failure.message, backoff = ?failure.backoff, "Server rejected the stream");
            let mut actions = vec![SessionAction::Notify(Notification::ConnectionFailed(failure))];
            actions.extend(self.close(DisconnectReason::HandshakeRejected));
            return actions;
        }

        // `ts` means the node-based stream init was accepted as-is.
        if let Some(ts) = stanza.attr("ts") {
            let mut actions = Vec::new();
            match ts.parse::<i64>() {
                Ok(ts) => actions.push(SessionAction::SyncClock(ts)),
                Err(_) => warn!(ts, "Ignoring unparseable handshake timestamp"),
            }
            info!("Stream authenticated");
            self.set_state(SessionState::Authenticated);
            actions.push(SessionAction::Notify(Notification::Authenticated));
            return actions;
        }

        self.set_state(SessionState::Authenticating);
        self.send_auth(None)
    }

    fn send_auth(&mut self, captcha_response: Option<&str>) -> Vec<SessionAction> {
        match auth_request(&self.credentials, &self.device, captcha_response) {
            Ok(outbound) => {
                info!(id = %outbound.id, registration = self.credentials.registration.is_some(), "Sending authentication request");
                self.auth_id = Some(outbound.id.clone());
                vec![SessionAction::Send {
                    outbound,
                    track: true,
                }]
            }
            Err(e) => {
                warn!(error = %e, "Cannot build authentication request");
                self.close(DisconnectReason::LoginFailed)
            }
        }
    }

    fn on_login_success(&mut self, stanza: &Stanza) -> Vec<SessionAction> {
        match LoginSuccess::from_stanza(stanza) {
            Ok(success) => {
                info!(node = %success.node, "Logged in");
                self.set_state(SessionState::Authenticated);
                vec![
                    SessionAction::Notify(Notification::LoginEnded(success)),
                    SessionAction::Notify(Notification::Authenticated),
                ]
            }
            Err(e) => {
                warn!(error = %e, "Unparseable login response");
                self.close(DisconnectReason::LoginFailed)
            }
        }
    }

    fn on_login_failure(&mut self, stanza: &Stanza) -> Vec<SessionAction> {
        let failure = match LoginFailure::from_stanza(stanza) {
            Ok(failure) => failure,
            Err(e) => {
                warn!(error = %e, "Unparseable login error");
                return self.close(DisconnectReason::LoginFailed);
            }
        };
        if let Some(challenge) = failure.captcha {
            return self.require_captcha(challenge, SessionState::Authenticating);
        }
        warn!(code = ?failure.code, message = %failure.message, "Login failed");
        let mut actions = vec![SessionAction::Notify(Notification::LoginError(failure))];
        actions.extend(self.close(DisconnectReason::LoginFailed));
        actions
    }

    fn require_captcha(
        &mut self,
        challenge: CaptchaChallenge,
        resume: SessionState,
    ) -> Vec<SessionAction> {
        info!(url = %challenge.url, "Captcha required");
        self.captcha = Some(PendingCaptcha {
            challenge: challenge.clone(),
            resume,
        });
        self.set_state(SessionState::CaptchaRequired);
        vec![SessionAction::Notify(Notification::CaptchaReceived(challenge))]
    }

    /// Answer the pending captcha with the token obtained from the captcha page.
    pub fn answer_captcha(&mut self, response: &str) -> Result<Vec<SessionAction>> {
        if self.state != SessionState::CaptchaRequired {
            return Err(Error::SessionNotReady(self.state));
        }
        let Some(pending) = self.captcha.take() else {
            return Err(Error::SessionNotReady(self.state));
        };
        match pending.challenge.token {
            CaptchaToken::Login => {
                self.set_state(SessionState::Authenticating);
                Ok(self.send_auth(Some(response)))
            }
            CaptchaToken::Stc(id) => {
                self.set_state(pending.resume);
                let answer = CaptchaAnswer::new(id, response);
                Ok(vec![SessionAction::Send {
                    outbound: Outbound::from_request(&answer),
                    track: false,
                }])
            }
        }
    }

    /// A tracked request expired without a response.
    pub fn on_request_expired(&mut self, id: &str) -> Vec<SessionAction> {
        if self.state == SessionState::Authenticating && self.auth_id.as_deref() == Some(id) {
            warn!(id, "Authentication request timed out");
            self.auth_id = None;
            return self.close(DisconnectReason::LoginTimedOut);
        }
        Vec::new()
    }

    /// Gate for outbound traffic. Fails without side effects.
    pub fn check_send(&self, kind: SendKind, now: SystemTime) -> Result<()> {
        match (self.state, kind) {
            (SessionState::Authenticated, _) => Ok(()),
            (SessionState::TempBanned, _) => match self.ban_expiry {
                Some(expiry) if now < expiry => Err(Error::TempBanned(expiry)),
                _ => Err(Error::SessionNotReady(SessionState::TempBanned)),
            },
            (state, _) => Err(Error::SessionNotReady(state)),
        }
    }

    fn close(&mut self, reason: DisconnectReason) -> Vec<SessionAction> {
        vec![SessionAction::Close { reason }]
    }

    /// Any state → Disconnected. Emits the disconnect notification the first time only.
    pub fn disconnected(&mut self, reason: DisconnectReason) -> Vec<SessionAction> {
        self.set_state(SessionState::Disconnected);
        self.auth_id = None;
        self.captcha = None;
        if self.disconnect_notified {
            return Vec::new();
        }
        self.disconnect_notified = true;
        info!(reason = ?reason, "Disconnected");
        vec![SessionAction::Notify(Notification::Disconnected(reason))]
    }
}

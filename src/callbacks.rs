//! Application-facing event sink.
//!
//! All methods are invoked from the session task, in stanza arrival order.
//! Implementations must not block; hand work to another task instead.

use tracing::debug;

use crate::events::{
    CaptchaChallenge, ConnectionFailure, IncomingMessage, LoginFailure, LoginSuccess,
    MessageError, Pong, Receipt, RosterPush, TempBan, TypingEvent,
};
use crate::session::DisconnectReason;
use crate::stanza::Stanza;

#[allow(unused_variables)]
pub trait SessionCallbacks: Send + Sync {
    /// The session may now send application stanzas.
    fn on_authenticated(&self) {}

    /// Login or registration succeeded. Fired before `on_authenticated`.
    fn on_login_ended(&self, success: &LoginSuccess) {}

    fn on_login_error(&self, failure: &LoginFailure) {}

    /// The server refused the stream-opening handshake.
    fn on_connection_failed(&self, failure: &ConnectionFailure) {}

    /// Answer through `SessionHandle::answer_captcha`.
    fn on_captcha_received(&self, captcha: &CaptchaChallenge) {}

    fn on_temp_ban_received(&self, ban: &TempBan) {}

    /// Fired exactly once per session.
    fn on_disconnected(&self, reason: &DisconnectReason) {}

    fn on_chat_message(&self, message: &IncomingMessage) {}

    fn on_group_message(&self, message: &IncomingMessage) {}

    fn on_message_delivered(&self, receipt: &Receipt) {}

    fn on_message_read(&self, receipt: &Receipt) {}

    fn on_typing(&self, event: &TypingEvent) {}

    fn on_group_typing(&self, event: &TypingEvent) {}

    fn on_message_error(&self, error: &MessageError) {}

    fn on_roster_push(&self, push: &RosterPush) {}

    fn on_pong(&self, pong: &Pong) {}

    /// A stanza that completed a pending request. The requester also receives it.
    fn on_iq_response(&self, stanza: &Stanza) {}

    /// An `iq` nobody asked for and no typed handler recognises.
    fn on_unsolicited_iq(&self, stanza: &Stanza) {}

    fn on_unhandled_stanza(&self, stanza: &Stanza) {
        debug!(name = %stanza.name, id = ?stanza.id(), "Unhandled stanza");
    }
}

/// Callbacks that ignore everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCallbacks;

impl SessionCallbacks for NoopCallbacks {}

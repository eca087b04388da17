//! Typed views of inbound stanzas.
//!
//! Each parser only checks the fields it exposes; unknown children are
//! ignored so server-side additions do not break routing.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::stanza::{Element, Stanza};

/// Suffix the captcha page needs to hand back a solvable response token.
pub const CAPTCHA_CALLBACK_PARAMETER: &str = "&callback_url=https://kik.com/captcha-url";

/// Parse a typed event out of a decoded stanza.
pub trait FromStanza: Sized {
    /// Fails with [`Error::MalformedResponse`] when a field this type needs is missing.
    fn from_stanza(stanza: &Stanza) -> Result<Self>;
}

fn malformed(what: &str, stanza: &Stanza) -> Error {
    Error::MalformedResponse(format!("<{}> without {}", stanza.name, what))
}

fn required_attr(stanza: &Stanza, name: &str) -> Result<String> {
    stanza
        .attr(name)
        .map(str::to_string)
        .ok_or_else(|| malformed(&format!("{} attribute", name), stanza))
}

fn group_jid(element: &Element) -> Option<String> {
    element
        .child("g")
        .and_then(|g| g.attr("jid"))
        .map(str::to_string)
}

fn millis_to_system_time(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}

/// A `chat` or `groupchat` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub message_id: String,
    pub from_jid: String,
    pub to_jid: Option<String>,
    pub body: Option<String>,
    /// Set for group messages.
    pub group_jid: Option<String>,
    /// Sender timestamp in server milliseconds.
    pub timestamp: Option<i64>,
    /// Whether the sender asked for a read receipt.
    pub request_read_receipt: bool,
}

impl FromStanza for IncomingMessage {
    fn from_stanza(stanza: &Stanza) -> Result<Self> {
        let timestamp = stanza
            .child("kik")
            .and_then(|kik| kik.attr("timestamp"))
            .and_then(|ts| ts.parse().ok());
        let request_read_receipt = stanza
            .child("request")
            .and_then(|r| r.attr("r"))
            .is_some_and(|r| r == "true");

        Ok(Self {
            message_id: required_attr(stanza, "id")?,
            from_jid: required_attr(stanza, "from")?,
            to_jid: stanza.attr("to").map(str::to_string),
            body: stanza.child_text("body"),
            group_jid: group_jid(stanza),
            timestamp,
            request_read_receipt,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptKind {
    Delivered,
    Read,
}

/// Delivery or read confirmation for messages this account sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub kind: ReceiptKind,
    pub from_jid: String,
    pub message_ids: Vec<String>,
    pub group_jid: Option<String>,
}

impl FromStanza for Receipt {
    fn from_stanza(stanza: &Stanza) -> Result<Self> {
        let receipt = stanza
            .child("receipt")
            .ok_or_else(|| malformed("receipt child", stanza))?;
        let kind = match receipt.attr("type") {
            Some("delivered") => ReceiptKind::Delivered,
            Some("read") => ReceiptKind::Read,
            other => {
                return Err(Error::MalformedResponse(format!(
                    "unknown receipt type {:?}",
                    other
                )))
            }
        };
        Ok(Self {
            kind,
            from_jid: required_attr(stanza, "from")?,
            message_ids: receipt
                .children_named("msgid")
                .filter_map(|m| m.attr("id"))
                .map(str::to_string)
                .collect(),
            group_jid: group_jid(stanza),
        })
    }
}

/// Typing indicator, direct or inside a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEvent {
    pub from_jid: String,
    pub group_jid: Option<String>,
    pub is_typing: bool,
}

impl FromStanza for TypingEvent {
    fn from_stanza(stanza: &Stanza) -> Result<Self> {
        let val = stanza
            .child("is-typing")
            .and_then(|t| t.attr("val"))
            .ok_or_else(|| malformed("is-typing value", stanza))?;
        Ok(Self {
            from_jid: required_attr(stanza, "from")?,
            group_jid: group_jid(stanza),
            is_typing: val == "true",
        })
    }
}

/// A `message` of type `error` bouncing one of ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageError {
    pub message_id: Option<String>,
    pub from_jid: Option<String>,
    /// Names of the conditions inside `<error>`.
    pub conditions: Vec<String>,
}

impl FromStanza for MessageError {
    fn from_stanza(stanza: &Stanza) -> Result<Self> {
        let conditions: Vec<String> = stanza
            .child("error")
            .map(|e| e.elements().map(|c| c.name.clone()).collect())
            .unwrap_or_default();
        Ok(Self {
            message_id: stanza.id().map(str::to_string),
            from_jid: stanza.attr("from").map(str::to_string),
            conditions,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterItem {
    pub jid: String,
    pub display_name: Option<String>,
    pub username: Option<String>,
}

/// Server-initiated `jabber:iq:roster` update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterPush {
    pub id: Option<String>,
    pub items: Vec<RosterItem>,
}

impl FromStanza for RosterPush {
    fn from_stanza(stanza: &Stanza) -> Result<Self> {
        let query = stanza
            .child("query")
            .ok_or_else(|| malformed("query child", stanza))?;
        let items = query
            .elements()
            .filter(|e| e.name == "item" || e.name == "g")
            .filter_map(|item| {
                Some(RosterItem {
                    jid: item.attr("jid")?.to_string(),
                    display_name: item.child_text("display-name"),
                    username: item.child_text("username"),
                })
            })
            .collect();
        Ok(Self {
            id: stanza.id().map(str::to_string),
            items,
        })
    }
}

/// Successful `jabber:iq:register` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginSuccess {
    /// JID local part; pass it back as `Credentials::node` to skip the login next time.
    pub node: String,
    pub username: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl FromStanza for LoginSuccess {
    fn from_stanza(stanza: &Stanza) -> Result<Self> {
        let query = stanza
            .child("query")
            .ok_or_else(|| malformed("query child", stanza))?;
        let node = query
            .child_text("node")
            .filter(|n| !n.is_empty())
            .ok_or_else(|| malformed("node", stanza))?;
        Ok(Self {
            node,
            username: query.child_text("username"),
            email: query.child_text("email"),
            first_name: query.child_text("first"),
            last_name: query.child_text("last"),
        })
    }
}

/// How a captcha answer must be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptchaToken {
    /// Re-send the login with the response as a challenge answer.
    Login,
    /// Answer with an `stc` solve element carrying this id.
    Stc(String),
}

/// A captcha the account holder must solve before the session continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaChallenge {
    pub url: String,
    pub token: CaptchaToken,
}

impl CaptchaChallenge {
    /// Challenge embedded in an auth error (`error/challenge/captcha-url`).
    pub fn from_auth_error(stanza: &Stanza) -> Option<Self> {
        let url = stanza
            .child("error")?
            .child("challenge")?
            .child_text("captcha-url")?;
        Some(Self {
            url: format!("{}{}", url.trim(), CAPTCHA_CALLBACK_PARAMETER),
            token: CaptchaToken::Login,
        })
    }
}

impl FromStanza for CaptchaChallenge {
    /// `<stc id=".."><stp type="ca">url</stp></stc>`
    fn from_stanza(stanza: &Stanza) -> Result<Self> {
        if let Some(challenge) = Self::from_auth_error(stanza) {
            return Ok(challenge);
        }
        let id = required_attr(stanza, "id")?;
        let url = stanza
            .child("stp")
            .map(Element::text)
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| malformed("captcha url", stanza))?;
        Ok(Self {
            url: format!("{}{}", url.trim(), CAPTCHA_CALLBACK_PARAMETER),
            token: CaptchaToken::Stc(id),
        })
    }
}

/// Failed authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginFailure {
    pub code: Option<u32>,
    pub error_type: Option<String>,
    /// Names of the conditions inside `<error>`.
    pub conditions: Vec<String>,
    pub captcha: Option<CaptchaChallenge>,
    /// Human-readable summary.
    pub message: String,
}

impl LoginFailure {
    pub fn is_captcha(&self) -> bool {
        self.captcha.is_some()
    }
}

impl FromStanza for LoginFailure {
    fn from_stanza(stanza: &Stanza) -> Result<Self> {
        let error = stanza
            .child("error")
            .ok_or_else(|| malformed("error child", stanza))?;
        let conditions: Vec<String> = error.elements().map(|c| c.name.clone()).collect();
        let captcha = CaptchaChallenge::from_auth_error(stanza);
        let has = |name: &str| conditions.iter().any(|c| c == name);

        let message = if let Some(dialog) = error.child("dialog") {
            format!(
                "{}: {}",
                dialog.child_text("dialog-title").unwrap_or_default(),
                dialog.child_text("dialog-body").unwrap_or_default()
            )
        } else if let Some(captcha) = &captcha {
            format!("a captcha is required to log in: {}", captcha.url)
        } else if has("not-registered") {
            "not registered".to_string()
        } else if has("password-mismatch") {
            "password mismatch".to_string()
        } else if has("device-change-timeout") {
            "device change timeout".to_string()
        } else if has("acct-terminated") {
            "account permanently banned or deactivated".to_string()
        } else if let Some(text) = error.child_text("message") {
            text
        } else {
            format!("login failed: {}", conditions.join(","))
        };

        Ok(Self {
            code: error.attr("code").and_then(|c| c.parse().ok()),
            error_type: error.attr("type").map(str::to_string),
            conditions,
            captcha,
            message,
        })
    }
}

/// Temporary account suspension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TempBan {
    /// `None` when the server gave no readable end time.
    pub expiry: Option<SystemTime>,
    pub title: Option<String>,
    pub body: Option<String>,
}

impl FromStanza for TempBan {
    /// Expiry is read, in epoch milliseconds, from an `expires` attribute on
    /// `stp` or from a `ban-end-time` / `end-time` descendant.
    fn from_stanza(stanza: &Stanza) -> Result<Self> {
        let stp = stanza
            .child("stp")
            .ok_or_else(|| malformed("stp child", stanza))?;
        let expiry = stp
            .attr("expires")
            .map(str::to_string)
            .or_else(|| stanza.find("ban-end-time").map(Element::text))
            .or_else(|| stanza.find("end-time").map(Element::text))
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map(millis_to_system_time);

        Ok(Self {
            expiry,
            title: stanza.find("dialog-title").map(Element::text),
            body: stanza.find("dialog-body").map(Element::text),
        })
    }
}

/// The server refused the stream (`<k ok="0">`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionFailure {
    pub message: String,
    /// Server-requested wait before reconnecting.
    pub backoff: Option<Duration>,
    pub is_auth_revoked: bool,
    pub is_bad_version: bool,
}

impl FromStanza for ConnectionFailure {
    fn from_stanza(stanza: &Stanza) -> Result<Self> {
        if stanza.name != "k" {
            return Err(malformed("handshake", stanza));
        }
        let message = stanza.child_text("msg").unwrap_or_default();
        let backoff = stanza
            .child("wait")
            .and_then(|w| w.attr("t").map(str::to_string).or_else(|| Some(w.text())))
            .and_then(|t| t.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let lower = message.to_ascii_lowercase();
        Ok(Self {
            is_auth_revoked: lower.contains("auth revoked"),
            is_bad_version: lower.contains("version"),
            backoff,
            message,
        })
    }
}

/// Reply to a ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    /// Round trip since the last ping, when one was sent on this session.
    pub latency: Option<Duration>,
}

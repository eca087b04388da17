//! Outbound stanzas.
//!
//! Everything written to the socket goes through [`Request`]. Values are
//! escaped with quick-xml; ids are random unless the caller supplies one.

use std::fmt::Write as _;

use quick_xml::escape::escape;

use crate::config::{Credentials, DeviceProfile, Secret};
use crate::crypto::new_message_id;
use crate::error::{Error, Result};

/// Domain of every user and group JID.
pub const KIK_DOMAIN: &str = "talk.kik.com";

/// An element the session can write.
pub trait Request: Send + Sync {
    /// Correlation id; a response carrying the same `id` completes the request.
    fn id(&self) -> &str;

    fn serialize(&self) -> Vec<u8>;

    /// Sensitive requests carry credentials: only their id and length are logged.
    fn is_sensitive(&self) -> bool {
        false
    }
}

/// A serialized request, ready for the single writer.
#[derive(Clone, PartialEq, Eq)]
pub struct Outbound {
    pub id: String,
    pub bytes: Vec<u8>,
    pub sensitive: bool,
}

impl Outbound {
    pub fn from_request(request: &dyn Request) -> Self {
        Self {
            id: request.id().to_string(),
            bytes: request.serialize(),
            sensitive: request.is_sensitive(),
        }
    }
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Outbound");
        s.field("id", &self.id).field("len", &self.bytes.len());
        if !self.sensitive {
            s.field("bytes", &String::from_utf8_lossy(&self.bytes));
        }
        s.finish()
    }
}

fn push_attr(out: &mut String, key: &str, value: &str) {
    let _ = write!(out, " {}=\"{}\"", key, escape(value));
}

fn push_text_element(out: &mut String, name: &str, text: &str) {
    let _ = write!(out, "<{name}>{}</{name}>", escape(text));
}

/// The `<k>` element that opens the stream. It is never closed until teardown.
#[derive(Debug, Clone)]
pub struct StreamInit {
    sid: String,
    attrs: Vec<(String, String)>,
    sensitive: bool,
}

impl StreamInit {
    /// Anonymous stream; authentication follows with a login or registration.
    pub fn anonymous(device: &DeviceProfile, timestamp_millis: i64) -> Self {
        let sid = new_message_id();
        let mut attrs = vec![("anon".to_string(), String::new())];
        attrs.extend(Self::common_attrs(device, &sid, timestamp_millis));
        attrs.push(("dev".to_string(), format!("CAN{}", device.device_id)));
        Self::finish(sid, attrs, device, false)
    }

    /// Stream opened on behalf of `node`; the server answers with `ts` when the
    /// passkey is accepted, and the session is authenticated without a login.
    pub fn authenticated(
        node: &str,
        passkey: &str,
        device: &DeviceProfile,
        timestamp_millis: i64,
    ) -> Self {
        let sid = new_message_id();
        let mut attrs = vec![
            (
                "from".to_string(),
                format!("{}@{}/CAN{}", node, KIK_DOMAIN, device.device_id),
            ),
            ("to".to_string(), KIK_DOMAIN.to_string()),
            ("p".to_string(), passkey.to_string()),
        ];
        attrs.extend(Self::common_attrs(device, &sid, timestamp_millis));
        Self::finish(sid, attrs, device, true)
    }

    /// Build the stream init matching `credentials`.
    pub fn for_credentials(
        credentials: &Credentials,
        device: &DeviceProfile,
        timestamp_millis: i64,
    ) -> Result<Self> {
        match &credentials.node {
            Some(node) => Ok(Self::authenticated(
                node,
                &credentials.passkey()?,
                device,
                timestamp_millis,
            )),
            None => Ok(Self::anonymous(device, timestamp_millis)),
        }
    }

    fn common_attrs(
        device: &DeviceProfile,
        sid: &str,
        timestamp_millis: i64,
    ) -> Vec<(String, String)> {
        vec![
            ("v".to_string(), device.version.clone()),
            ("sid".to_string(), sid.to_string()),
            ("n".to_string(), "1".to_string()),
            ("conn".to_string(), "WIFI".to_string()),
            ("ts".to_string(), timestamp_millis.to_string()),
            ("lang".to_string(), device.lang.clone()),
        ]
    }

    fn finish(
        sid: String,
        mut attrs: Vec<(String, String)>,
        device: &DeviceProfile,
        sensitive: bool,
    ) -> Self {
        for (key, value) in &device.extra_init_attrs {
            match attrs.iter_mut().find(|(k, _)| k == key) {
                Some(existing) => existing.1 = value.clone(),
                None => attrs.push((key.clone(), value.clone())),
            }
        }
        Self {
            sid,
            attrs,
            sensitive,
        }
    }
}

impl Request for StreamInit {
    fn id(&self) -> &str {
        &self.sid
    }

    fn serialize(&self) -> Vec<u8> {
        let mut out = String::from("<k");
        for (key, value) in &self.attrs {
            push_attr(&mut out, key, value);
        }
        out.push('>');
        out.into_bytes()
    }

    fn is_sensitive(&self) -> bool {
        self.sensitive
    }
}

fn push_device_fields(out: &mut String, device: &DeviceProfile) {
    push_text_element(out, "device-id", &device.device_id);
    push_text_element(out, "install-referrer", "utm_source=google-play&utm_medium=organic");
    push_text_element(out, "device-type", "android");
    push_text_element(out, "brand", "generic");
    push_text_element(out, "version", &device.version);
    push_text_element(out, "lang", &device.lang);
    push_text_element(out, "android-sdk", "19");
    push_text_element(out, "prefix", "CAN");
    push_text_element(out, "android-id", &device.android_id);
}

fn push_challenge(out: &mut String, captcha_response: Option<&str>) {
    if let Some(response) = captcha_response {
        out.push_str("<challenge>");
        push_text_element(out, "response", response);
        out.push_str("</challenge>");
    }
}

/// `jabber:iq:register` login with a derived passkey.
#[derive(Clone)]
pub struct LoginRequest {
    id: String,
    username: String,
    passkey: String,
    is_email: bool,
    device: DeviceProfile,
    captcha_response: Option<String>,
}

impl LoginRequest {
    pub fn new(
        credentials: &Credentials,
        device: &DeviceProfile,
        captcha_response: Option<&str>,
    ) -> Result<Self> {
        Ok(Self {
            id: new_message_id(),
            username: credentials.username.clone(),
            passkey: credentials.passkey()?,
            is_email: credentials.is_email(),
            device: device.clone(),
            captcha_response: captcha_response.map(str::to_string),
        })
    }
}

impl Request for LoginRequest {
    fn id(&self) -> &str {
        &self.id
    }

    fn serialize(&self) -> Vec<u8> {
        let mut out = String::from("<iq type=\"set\"");
        push_attr(&mut out, "id", &self.id);
        out.push_str("><query xmlns=\"jabber:iq:register\">");
        push_challenge(&mut out, self.captcha_response.as_deref());
        if self.is_email {
            push_text_element(&mut out, "email", &self.username);
            push_text_element(&mut out, "passkey-e", &self.passkey);
        } else {
            push_text_element(&mut out, "username", &self.username);
            push_text_element(&mut out, "passkey-u", &self.passkey);
        }
        push_device_fields(&mut out, &self.device);
        out.push_str("</query></iq>");
        out.into_bytes()
    }

    fn is_sensitive(&self) -> bool {
        true
    }
}

/// `jabber:iq:register` account creation.
#[derive(Clone)]
pub struct RegisterRequest {
    id: String,
    email: String,
    username: String,
    passkey_e: String,
    passkey_u: String,
    first_name: String,
    last_name: String,
    birthday: String,
    device: DeviceProfile,
    captcha_response: Option<String>,
}

impl RegisterRequest {
    pub fn new(
        credentials: &Credentials,
        device: &DeviceProfile,
        captcha_response: Option<&str>,
    ) -> Result<Self> {
        let registration = credentials
            .registration
            .as_ref()
            .ok_or_else(|| Error::Config("registration details missing".into()))?;
        if !matches!(credentials.secret, Secret::Password(_)) {
            return Err(Error::Config("registration needs a raw password".into()));
        }
        Ok(Self {
            id: new_message_id(),
            email: registration.email.clone(),
            username: credentials.username.clone(),
            passkey_e: credentials.passkey_for(&registration.email)?,
            passkey_u: credentials.passkey_for(&credentials.username)?,
            first_name: registration.first_name.clone(),
            last_name: registration.last_name.clone(),
            birthday: registration.birthday.clone(),
            device: device.clone(),
            captcha_response: captcha_response.map(str::to_string),
        })
    }
}

impl Request for RegisterRequest {
    fn id(&self) -> &str {
        &self.id
    }

    fn serialize(&self) -> Vec<u8> {
        let mut out = String::from("<iq type=\"set\"");
        push_attr(&mut out, "id", &self.id);
        out.push_str("><query xmlns=\"jabber:iq:register\">");
        push_challenge(&mut out, self.captcha_response.as_deref());
        push_text_element(&mut out, "email", &self.email);
        push_text_element(&mut out, "passkey-e", &self.passkey_e);
        push_text_element(&mut out, "passkey-u", &self.passkey_u);
        push_text_element(&mut out, "username", &self.username);
        push_text_element(&mut out, "first", &self.first_name);
        push_text_element(&mut out, "last", &self.last_name);
        push_text_element(&mut out, "birthday", &self.birthday);
        push_device_fields(&mut out, &self.device);
        out.push_str("</query></iq>");
        out.into_bytes()
    }

    fn is_sensitive(&self) -> bool {
        true
    }
}

/// Build the authentication request the credentials call for.
pub fn auth_request(
    credentials: &Credentials,
    device: &DeviceProfile,
    captcha_response: Option<&str>,
) -> Result<Outbound> {
    if credentials.registration.is_some() {
        let request = RegisterRequest::new(credentials, device, captcha_response)?;
        Ok(Outbound::from_request(&request))
    } else {
        let request = LoginRequest::new(credentials, device, captcha_response)?;
        Ok(Outbound::from_request(&request))
    }
}

/// Answer to an `stc` captcha challenge.
#[derive(Debug, Clone)]
pub struct CaptchaAnswer {
    stc_id: String,
    response: String,
}

impl CaptchaAnswer {
    pub fn new(stc_id: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            stc_id: stc_id.into(),
            response: response.into(),
        }
    }
}

impl Request for CaptchaAnswer {
    fn id(&self) -> &str {
        &self.stc_id
    }

    fn serialize(&self) -> Vec<u8> {
        let mut out = String::from("<stc");
        push_attr(&mut out, "id", &self.stc_id);
        out.push('>');
        push_text_element(&mut out, "sts", &self.response);
        out.push_str("</stc>");
        out.into_bytes()
    }
}

/// Keep-alive; the server answers with `<pong/>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ping;

impl Request for Ping {
    fn id(&self) -> &str {
        "ping"
    }

    fn serialize(&self) -> Vec<u8> {
        b"<ping/>".to_vec()
    }
}

/// Text message to a user or a group.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    id: String,
    to: String,
    body: String,
    timestamp_millis: i64,
}

impl ChatMessage {
    /// `timestamp_millis` should come from the session's server clock.
    pub fn new(to: impl Into<String>, body: impl Into<String>, timestamp_millis: i64) -> Self {
        Self {
            id: new_message_id(),
            to: to.into(),
            body: body.into(),
            timestamp_millis,
        }
    }

    fn is_group(&self) -> bool {
        self.to.contains("_g@")
    }
}

impl Request for ChatMessage {
    fn id(&self) -> &str {
        &self.id
    }

    fn serialize(&self) -> Vec<u8> {
        let ts = self.timestamp_millis.to_string();
        let mut out = String::from("<message");
        push_attr(
            &mut out,
            "type",
            if self.is_group() { "groupchat" } else { "chat" },
        );
        push_attr(&mut out, "to", &self.to);
        push_attr(&mut out, "id", &self.id);
        push_attr(&mut out, "cts", &ts);
        out.push('>');
        push_text_element(&mut out, "body", &self.body);
        let preview: String = self.body.chars().take(20).collect();
        push_text_element(&mut out, "preview", &preview);
        out.push_str("<kik push=\"true\" qos=\"true\"");
        push_attr(&mut out, "timestamp", &ts);
        out.push_str("/><request xmlns=\"kik:message:receipt\" r=\"true\" d=\"true\"/><ri/>");
        if self.is_group() {
            out.push_str("<pb/>");
        }
        out.push_str("</message>");
        out.into_bytes()
    }
}

/// Read receipt for one or more received messages.
#[derive(Debug, Clone)]
pub struct ReadReceipt {
    id: String,
    to: String,
    message_ids: Vec<String>,
    group_jid: Option<String>,
    timestamp_millis: i64,
}

impl ReadReceipt {
    pub fn new(
        to: impl Into<String>,
        message_ids: Vec<String>,
        group_jid: Option<String>,
        timestamp_millis: i64,
    ) -> Self {
        Self {
            id: new_message_id(),
            to: to.into(),
            message_ids,
            group_jid,
            timestamp_millis,
        }
    }
}

impl Request for ReadReceipt {
    fn id(&self) -> &str {
        &self.id
    }

    fn serialize(&self) -> Vec<u8> {
        let ts = self.timestamp_millis.to_string();
        let mut out = String::from("<message type=\"receipt\"");
        push_attr(&mut out, "id", &self.id);
        push_attr(&mut out, "to", &self.to);
        push_attr(&mut out, "cts", &ts);
        out.push_str("><kik push=\"false\" qos=\"true\"");
        push_attr(&mut out, "timestamp", &ts);
        out.push_str("/>");
        if let Some(group) = &self.group_jid {
            out.push_str("<g");
            push_attr(&mut out, "jid", group);
            out.push_str("/>");
        }
        out.push_str("<receipt xmlns=\"kik:message:receipt\" type=\"read\">");
        for id in &self.message_ids {
            out.push_str("<msgid");
            push_attr(&mut out, "id", id);
            out.push_str("/>");
        }
        out.push_str("</receipt></message>");
        out.into_bytes()
    }
}

/// Fetch the contact list.
#[derive(Debug, Clone)]
pub struct RosterRequest {
    id: String,
}

impl RosterRequest {
    pub fn new() -> Self {
        Self {
            id: new_message_id(),
        }
    }
}

impl Default for RosterRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl Request for RosterRequest {
    fn id(&self) -> &str {
        &self.id
    }

    fn serialize(&self) -> Vec<u8> {
        let mut out = String::from("<iq type=\"get\"");
        push_attr(&mut out, "id", &self.id);
        out.push_str("><query p=\"8\" xmlns=\"jabber:iq:roster\"/></iq>");
        out.into_bytes()
    }
}

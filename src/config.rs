//! Session configuration, device profile and credentials.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use rand::RngCore;
use serde::Deserialize;

use crate::crypto::{derive_key, host_name};
use crate::error::{Error, Result};
use crate::framing::MAX_STANZA_SIZE;

/// Port the server listens on for direct TLS.
pub const DEFAULT_PORT: u16 = 5223;

/// Timeout for establishing the TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default per-request response timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client version announced to the server.
pub const DEFAULT_CLIENT_VERSION: &str = "17.0.0.31357";

/// Transport used to reach the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Unencrypted TCP (local test servers only).
    Plain,
    /// TLS from the first byte.
    DirectTls,
}

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub mode: ConnectionMode,
    /// Name used for TLS SNI and certificate verification when it differs from `host`.
    pub domain: Option<String>,
}

impl Endpoint {
    /// Hostname for TLS SNI and certificate verification.
    pub fn tls_name(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.host)
    }
}

/// Extract optional `?domain=` parameter from a URI path.
fn split_domain_param(input: &str) -> (&str, Option<String>) {
    match input.split_once('?') {
        Some((host_port, query)) => (host_port, query.strip_prefix("domain=").map(str::to_string)),
        None => (input, None),
    }
}

fn split_port(host_port: &str) -> Result<(&str, Option<u16>)> {
    match host_port.rsplit_once(':') {
        // IPv6 literals keep their colons inside brackets.
        Some((host, port)) if !port.contains(']') => {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("invalid port in {:?}", host_port)))?;
            Ok((host, Some(port)))
        }
        _ => Ok((host_port, None)),
    }
}

/// Parse the server input string into an endpoint.
///
/// Supported formats:
/// - `tls://host:port` or `tls://host`  → direct TLS (port 5223 by default)
/// - `tcp://host:port`                  → plain TCP
/// - `host:port`, `host`                → direct TLS
///
/// An optional `?domain=name` suffix overrides the TLS server name.
pub fn parse_server_input(server: &str) -> Result<Endpoint> {
    let trimmed = server.trim();

    let (mode, rest) = if let Some(rest) = trimmed.strip_prefix("tls://") {
        (ConnectionMode::DirectTls, rest)
    } else if let Some(rest) = trimmed.strip_prefix("tcp://") {
        (ConnectionMode::Plain, rest)
    } else if trimmed.contains("://") {
        return Err(Error::Config(format!("unsupported scheme in {:?}", trimmed)));
    } else {
        (ConnectionMode::DirectTls, trimmed)
    };

    let (host_port, domain) = split_domain_param(rest);
    let (host, port) = split_port(host_port)?;
    if host.is_empty() {
        return Err(Error::Config(format!("missing host in {:?}", trimmed)));
    }
    if mode == ConnectionMode::Plain && port.is_none() {
        return Err(Error::Config("tcp:// endpoints need an explicit port".into()));
    }

    Ok(Endpoint {
        host: host.to_string(),
        port: port.unwrap_or(DEFAULT_PORT),
        mode,
        domain,
    })
}

/// Device identity presented to the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    pub device_id: String,
    pub android_id: String,
    pub version: String,
    pub lang: String,
    /// Extra attributes copied verbatim onto the stream-opening `<k>` element.
    pub extra_init_attrs: BTreeMap<String, String>,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            device_id: random_hex(16),
            android_id: random_hex(8),
            version: DEFAULT_CLIENT_VERSION.to_string(),
            lang: "en_US".to_string(),
            extra_init_attrs: BTreeMap::new(),
        }
    }
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Connection and protocol settings for one session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Server input string; empty means the version-derived default host.
    pub server: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub max_stanza_size: usize,
    /// Skip certificate verification (self-signed test servers).
    pub dangerous_insecure_tls: bool,
    pub device: DeviceProfile,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            connect_timeout_secs: CONNECT_TIMEOUT.as_secs(),
            request_timeout_secs: REQUEST_TIMEOUT.as_secs(),
            max_stanza_size: MAX_STANZA_SIZE,
            dangerous_insecure_tls: false,
            device: DeviceProfile::default(),
        }
    }
}

impl SessionConfig {
    pub fn endpoint(&self) -> Result<Endpoint> {
        if self.server.trim().is_empty() {
            return parse_server_input(&host_name(&self.device.version));
        }
        parse_server_input(&self.server)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// The account secret.
#[derive(Clone)]
pub enum Secret {
    /// Raw password; the passkey is derived on demand.
    Password(String),
    /// Passkey previously derived for the login identity.
    Passkey(String),
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::Password(_) => f.write_str("Password(<redacted>)"),
            Secret::Passkey(_) => f.write_str("Passkey(<redacted>)"),
        }
    }
}

/// Profile details sent with a registration instead of a login.
#[derive(Debug, Clone)]
pub struct Registration {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    /// `YYYY-MM-DD`
    pub birthday: String,
}

/// Account credentials. Immutable for the lifetime of a session.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Username or email used to log in.
    pub username: String,
    pub secret: Secret,
    /// JID local part from a previous successful login. When present the
    /// stream is opened already authenticated.
    pub node: Option<String>,
    pub registration: Option<Registration>,
}

impl Credentials {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: Secret::Password(password.into()),
            node: None,
            registration: None,
        }
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn with_registration(mut self, registration: Registration) -> Self {
        self.registration = Some(registration);
        self
    }

    /// True when the login identity is an email address.
    pub fn is_email(&self) -> bool {
        self.username.contains('@')
    }

    /// Passkey for `username`.
    pub fn passkey(&self) -> Result<String> {
        self.passkey_for(&self.username)
    }

    /// Passkey salted with an arbitrary identity (registration needs one per identity).
    pub fn passkey_for(&self, identity: &str) -> Result<String> {
        match &self.secret {
            Secret::Password(password) => derive_key(identity, password),
            Secret::Passkey(key) if identity == self.username => Ok(key.clone()),
            Secret::Passkey(_) => Err(Error::Config(
                "a raw password is needed to derive a passkey for a second identity".into(),
            )),
        }
    }
}

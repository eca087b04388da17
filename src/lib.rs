//! Session engine for the Kik messaging protocol.
//!
//! [`KikClient::connect`] opens a TLS socket, runs the stream handshake and
//! authentication, and returns a [`SessionHandle`]. Inbound stanzas are framed
//! incrementally, decoded, interpreted by the session state machine, and
//! delivered to a [`SessionCallbacks`] implementation or to the task awaiting
//! the matching response.

pub mod callbacks;
pub mod clock;
pub mod config;
pub mod correlator;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod framing;
pub mod requests;
pub mod session;
pub mod stanza;

pub use callbacks::{NoopCallbacks, SessionCallbacks};
pub use config::{Credentials, DeviceProfile, Registration, Secret, SessionConfig};
pub use error::{Error, FramingError, Result};
pub use requests::{Outbound, Request};
pub use session::{DisconnectReason, KikClient, Session, SessionHandle, SessionState};
pub use stanza::{Element, Stanza, StanzaKind};

//! Password-derived credentials and identifier generation.
//!
//! The passkey scheme must match the server bit for bit: any deviation makes
//! every login fail with a password mismatch.

use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// Salt suffix appended to the lower-cased identity.
const PASSKEY_SALT: &str = "niCRwL7isZHny24qgLvy";

/// PBKDF2 rounds used by the server.
const PASSKEY_ROUNDS: u32 = 8192;

/// Derived key length in bytes (128 bit).
const PASSKEY_LEN: usize = 16;

/// Derive the passkey for `identity` (username or email) and `password`.
///
/// `PBKDF2-HMAC-SHA1(hex(SHA1(password)), lower(identity) + salt, 8192, 16)`,
/// returned as lower-case hex.
pub fn derive_key(identity: impl AsRef<[u8]>, password: impl AsRef<[u8]>) -> Result<String> {
    let identity = std::str::from_utf8(identity.as_ref())
        .map_err(|e| Error::Encoding(format!("identity is not UTF-8: {}", e)))?;
    let password = std::str::from_utf8(password.as_ref())
        .map_err(|e| Error::Encoding(format!("password is not UTF-8: {}", e)))?;

    let password_digest = hex::encode(Sha1::digest(password.as_bytes()));
    let salt = format!("{}{}", identity.to_lowercase(), PASSKEY_SALT);

    let mut key = [0u8; PASSKEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha1>(
        password_digest.as_bytes(),
        salt.as_bytes(),
        PASSKEY_ROUNDS,
        &mut key,
    );
    Ok(hex::encode(key))
}

/// Generate a random identifier for an outgoing stanza, formatted like a UUID.
pub fn new_message_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    // version 4, RFC 4122 variant
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Default server host for an emulated client version (`"17.0.0.31357"` → `talk1700an.kik.com`).
pub fn host_name(client_version: &str) -> String {
    let mut parts = client_version.split('.');
    let major = parts.next().unwrap_or_default();
    let minor = parts.next().unwrap_or_default();
    format!("talk{}{}0an.kik.com", major, minor)
}

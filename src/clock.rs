//! Client/server clock offset, learned from the handshake `ts` attribute.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch on the local clock.
pub fn system_time_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Per-session estimate of the server's clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerClock {
    offset_millis: i64,
}

impl ServerClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the offset from a server timestamp observed at local time `local_millis`.
    /// Non-positive server timestamps are ignored.
    pub fn recalculate_at(&mut self, server_millis: i64, local_millis: i64) -> i64 {
        if server_millis > 0 {
            self.offset_millis = server_millis - local_millis;
        }
        self.offset_millis
    }

    pub fn recalculate(&mut self, server_millis: i64) -> i64 {
        self.recalculate_at(server_millis, system_time_millis())
    }

    pub fn offset_millis(&self) -> i64 {
        self.offset_millis
    }

    /// Current server time in milliseconds, for stamping outgoing stanzas.
    pub fn server_time_millis(&self) -> i64 {
        system_time_millis() + self.offset_millis
    }
}

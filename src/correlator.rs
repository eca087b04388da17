//! Request/response correlation by stanza id.
//!
//! Owned by the session task; never shared. Every pending entry is completed
//! exactly once: by a matching response, a cancellation, its deadline, or the
//! session going away.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};
use crate::stanza::Stanza;

type Completion = oneshot::Sender<Result<Stanza>>;

#[derive(Debug)]
struct PendingRequest {
    completion: Completion,
    deadline: Option<Instant>,
    timeout: Duration,
}

/// Receiving side of a pending request.
#[derive(Debug)]
pub struct ResponseHandle {
    id: String,
    rx: oneshot::Receiver<Result<Stanza>>,
}

impl ResponseHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the response stanza.
    pub async fn wait(self) -> Result<Stanza> {
        // A dropped sender means the correlator went away with the session.
        self.rx.await.unwrap_or(Err(Error::Cancelled))
    }

    /// Take the response if it has already been completed, without waiting.
    pub fn try_wait(&mut self) -> Option<Result<Stanza>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::Cancelled)),
        }
    }
}

/// Table of requests awaiting a response, keyed by stanza id.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: HashMap<String, PendingRequest>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Register `id` as awaiting a response. `deadline` is `(now + timeout, timeout)`.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        deadline: Option<(Instant, Duration)>,
    ) -> Result<ResponseHandle> {
        let id = id.into();
        if self.pending.contains_key(&id) {
            return Err(Error::DuplicateId(id));
        }
        let (tx, rx) = oneshot::channel();
        let (deadline, timeout) = match deadline {
            Some((at, timeout)) => (Some(at), timeout),
            None => (None, Duration::ZERO),
        };
        self.pending.insert(
            id.clone(),
            PendingRequest {
                completion: tx,
                deadline,
                timeout,
            },
        );
        Ok(ResponseHandle { id, rx })
    }

    /// Complete the entry for `id` with `stanza`.
    ///
    /// Returns the stanza back when nothing is pending under `id`, so it can
    /// continue to unsolicited dispatch.
    pub fn resolve(&mut self, id: &str, stanza: Stanza) -> Option<Stanza> {
        match self.pending.remove(id) {
            Some(entry) => {
                if entry.completion.send(Ok(stanza)).is_err() {
                    debug!(id, "Requester gone, dropping response");
                }
                None
            }
            None => Some(stanza),
        }
    }

    /// Complete `id` with [`Error::Cancelled`]. Returns whether it was pending.
    pub fn cancel(&mut self, id: &str) -> bool {
        match self.pending.remove(id) {
            Some(entry) => {
                let _ = entry.completion.send(Err(Error::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Fail every entry whose deadline is at or before `now`. Returns the expired ids.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(entry) = self.pending.remove(id) {
                debug!(id = %id, timeout = ?entry.timeout, "Request timed out");
                let _ = entry.completion.send(Err(Error::TimedOut(entry.timeout)));
            }
        }
        expired
    }

    /// Earliest deadline among pending entries.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().filter_map(|entry| entry.deadline).min()
    }

    /// Fail every pending entry; `err` is rebuilt per entry.
    pub fn fail_all(&mut self, err: impl Fn() -> Error) {
        for (_, entry) in self.pending.drain() {
            let _ = entry.completion.send(Err(err()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::decode;
    use proptest::prelude::*;

    fn iq(id: &str) -> Stanza {
        decode(format!("<iq type=\"result\" id=\"{}\"/>", id).as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_resolve_completes_once() {
        let mut correlator = Correlator::new();
        let handle = correlator.register("a1", None).unwrap();

        assert!(correlator.resolve("a1", iq("a1")).is_none());
        assert!(correlator.is_empty());

        let response = handle.wait().await.unwrap();
        assert_eq!(response.id(), Some("a1"));

        // A second response with the same id is unsolicited.
        assert!(correlator.resolve("a1", iq("a1")).is_some());
    }

    #[test]
    fn test_try_wait_before_and_after_resolve() {
        let mut correlator = Correlator::new();
        let mut handle = correlator.register("t1", None).unwrap();
        assert!(handle.try_wait().is_none());
        correlator.resolve("t1", iq("t1"));
        assert_eq!(handle.try_wait().unwrap().unwrap().id(), Some("t1"));

        let mut dropped = correlator.register("t2", None).unwrap();
        drop(correlator);
        assert!(matches!(dropped.try_wait(), Some(Err(Error::Cancelled))));
    }

    #[test]
    fn test_duplicate_register_fails() {
        let mut correlator = Correlator::new();
        let _handle = correlator.register("dup", None).unwrap();
        let err = correlator.register("dup", None).unwrap_err();
        assert!(matches!(err, Error::DuplicateId(id) if id == "dup"));
        assert_eq!(correlator.len(), 1);
    }

    #[test]
    fn test_unknown_id_passes_through() {
        let mut correlator = Correlator::new();
        let stanza = iq("nobody");
        assert_eq!(correlator.resolve("nobody", stanza.clone()), Some(stanza));
    }

    #[tokio::test]
    async fn test_cancel() {
        let mut correlator = Correlator::new();
        let handle = correlator.register("c1", None).unwrap();
        assert!(correlator.cancel("c1"));
        assert!(!correlator.cancel("c1"));
        assert!(matches!(handle.wait().await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_expire_only_past_deadlines() {
        let mut correlator = Correlator::new();
        let now = Instant::now();
        let short = Duration::from_secs(1);
        let long = Duration::from_secs(60);

        let soon = correlator.register("soon", Some((now + short, short))).unwrap();
        let _later = correlator.register("later", Some((now + long, long))).unwrap();
        let _never = correlator.register("never", None).unwrap();

        assert_eq!(correlator.next_deadline(), Some(now + short));
        assert!(correlator.expire(now).is_empty());

        let expired = correlator.expire(now + Duration::from_secs(2));
        assert_eq!(expired, vec!["soon".to_string()]);
        assert!(matches!(soon.wait().await, Err(Error::TimedOut(d)) if d == short));
        assert_eq!(correlator.next_deadline(), Some(now + long));
        assert_eq!(correlator.len(), 2);
    }

    #[tokio::test]
    async fn test_fail_all_and_dropped_correlator() {
        let mut correlator = Correlator::new();
        let a = correlator.register("a", None).unwrap();
        let b = correlator.register("b", None).unwrap();
        correlator.fail_all(|| Error::SessionClosed);
        assert!(matches!(a.wait().await, Err(Error::SessionClosed)));
        assert!(matches!(b.wait().await, Err(Error::SessionClosed)));

        let mut correlator = Correlator::new();
        let c = correlator.register("c", None).unwrap();
        drop(correlator);
        assert!(matches!(c.wait().await, Err(Error::Cancelled)));
    }

    proptest! {
        #[test]
        fn prop_each_registered_id_resolves_exactly_once(ids in proptest::collection::hash_set("[a-z0-9]{1,8}", 1..20)) {
            let mut correlator = Correlator::new();
            let mut handles = Vec::new();
            for id in &ids {
                handles.push(correlator.register(id.clone(), None).unwrap());
            }
            for id in &ids {
                prop_assert!(correlator.resolve(id, iq(id)).is_none());
                prop_assert!(correlator.resolve(id, iq(id)).is_some());
            }
            prop_assert!(correlator.is_empty());
        }
    }
}

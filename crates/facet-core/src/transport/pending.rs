//! In-flight request bookkeeping for the client.
//!
//! Removing an entry from [`PendingCalls`] is the only way to complete a
//! call, so whichever path removes it (response, timeout, teardown) decides
//! the single outcome the caller sees.

use crate::cancel::CancellationToken;
use crate::{FacetError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// Outcome delivered to a waiting caller.
pub(crate) type CallOutcome = Result<Value>;

/// One request awaiting its terminal outcome.
#[derive(Debug)]
pub(crate) struct PendingCall {
    tx: oneshot::Sender<CallOutcome>,
    pub(crate) operation: String,
    pub(crate) timeout: Duration,
    pub(crate) deadline: Instant,
    /// Cancelled when the link that carried the request goes away.
    pub(crate) link: CancellationToken,
}

impl PendingCall {
    pub(crate) fn new(
        operation: impl Into<String>,
        timeout: Duration,
        link: CancellationToken,
    ) -> (Self, oneshot::Receiver<CallOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx,
                operation: operation.into(),
                timeout,
                deadline: deadline_after(timeout),
                link,
            },
            rx,
        )
    }

    /// Deliver the outcome. The caller may already have gone away.
    pub(crate) fn resolve(self, outcome: CallOutcome) {
        let _ = self.tx.send(outcome);
    }

    /// Whether the deadline has passed, even if the timer has not fired yet.
    pub(crate) fn is_overdue(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Deadline `timeout` from now. Timeouts too large to represent never expire.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86400 * 365 * 30))
}

/// Correlation table from request id to pending call.
#[derive(Debug, Default)]
pub(crate) struct PendingCalls {
    calls: Mutex<HashMap<String, PendingCall>>,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a call under `id`. Ids may not be reused while pending.
    pub(crate) fn register(&self, id: String, call: PendingCall) -> Result<()> {
        let mut calls = self.lock();
        if calls.contains_key(&id) {
            return Err(FacetError::Other(format!("Request id {} is already pending", id)));
        }
        calls.insert(id, call);
        Ok(())
    }

    pub(crate) fn remove(&self, id: &str) -> Option<PendingCall> {
        self.lock().remove(id)
    }

    /// Drop the call registered under `id` once the returned guard goes away.
    ///
    /// Held by the waiting caller, so a call whose future is dropped early
    /// does not linger in the table.
    pub(crate) fn guard(&self, id: &str) -> PendingGuard<'_> {
        PendingGuard {
            calls: self,
            id: id.to_string(),
        }
    }

    /// Reject every pending call and leave the table empty.
    ///
    /// Returns how many calls were rejected.
    pub(crate) fn fail_all(&self, error: impl Fn() -> FacetError) -> usize {
        let drained: Vec<PendingCall> = self.lock().drain().map(|(_, call)| call).collect();
        let count = drained.len();
        for call in drained {
            call.resolve(Err(error()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

pub(crate) struct PendingGuard<'a> {
    calls: &'a PendingCalls,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(call) = self.calls.remove(&self.id) {
            debug!("Call {} ({}) abandoned by its caller", self.id, call.operation);
        }
    }
}

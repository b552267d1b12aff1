//! Pending call registry.
//!
//! Maps in-flight request ids to the oneshot sender of the waiting caller.
//! Every entry is removed exactly once: by the reader when the response
//! arrives, by [`PendingGuard`] when the caller gives up (timeout, cancel,
//! dropped future), or by [`PendingCalls::close`] when the worker goes away.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::error::{OffloadError, Result};
use crate::protocol::ResponseEnvelope;

/// What a waiting caller receives.
pub(crate) type Delivery = Result<ResponseEnvelope>;

/// Why the registry stopped accepting calls.
#[derive(Debug, Clone)]
pub(crate) enum CloseReason {
    Crashed(String),
    ClientClosed,
}

impl CloseReason {
    fn to_error(&self) -> OffloadError {
        match self {
            CloseReason::Crashed(msg) => OffloadError::WorkerCrashed(msg.clone()),
            CloseReason::ClientClosed => OffloadError::ClientClosed,
        }
    }
}

#[derive(Default)]
struct State {
    waiters: HashMap<u64, oneshot::Sender<Delivery>>,
    closed: Option<CloseReason>,
}

/// Registry of calls waiting for a response from one worker.
#[derive(Default)]
pub(crate) struct PendingCalls {
    state: Mutex<State>,
}

impl PendingCalls {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter for `request_id`.
    ///
    /// Fails with the close reason if the registry has been closed.
    pub(crate) fn register(
        self: &Arc<Self>,
        request_id: u64,
    ) -> Result<(PendingGuard, oneshot::Receiver<Delivery>)> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(reason.to_error());
        }
        state.waiters.insert(request_id, tx);
        drop(state);

        let guard = PendingGuard {
            calls: Arc::clone(self),
            request_id,
        };
        Ok((guard, rx))
    }

    /// Hand a response to its waiter.
    ///
    /// Returns false if nobody is waiting for that id any more (the caller
    /// timed out or cancelled); the response is dropped.
    pub(crate) fn fulfill(&self, response: ResponseEnvelope) -> bool {
        let waiter = self.lock().waiters.remove(&response.request_id);
        match waiter {
            Some(tx) => tx.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    /// Fail one waiter with `error`.
    ///
    /// Returns false if nobody is waiting for that id.
    pub(crate) fn fail(&self, request_id: u64, error: OffloadError) -> bool {
        let waiter = self.lock().waiters.remove(&request_id);
        match waiter {
            Some(tx) => tx.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Remove a waiter without delivering anything. Idempotent.
    pub(crate) fn remove(&self, request_id: u64) -> bool {
        self.lock().waiters.remove(&request_id).is_some()
    }

    /// Fail every waiter and refuse new registrations.
    ///
    /// The first reason wins; later calls only drain waiters that raced in.
    /// Returns the number of waiters failed.
    pub(crate) fn close(&self, reason: CloseReason) -> usize {
        let (waiters, reason) = {
            let mut state = self.lock();
            let reason = state.closed.get_or_insert(reason).clone();
            (std::mem::take(&mut state.waiters), reason)
        };

        let count = waiters.len();
        for (_, tx) in waiters {
            let _ = tx.send(Err(reason.to_error()));
        }
        count
    }

    /// The error new calls get, once closed.
    pub(crate) fn closed_error(&self) -> Option<OffloadError> {
        self.lock().closed.as_ref().map(CloseReason::to_error)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().waiters.len()
    }
}

/// Removes the registry entry when the call finishes, however it finishes.
pub(crate) struct PendingGuard {
    calls: Arc<PendingCalls>,
    request_id: u64,
}

impl PendingGuard {
    pub(crate) fn request_id(&self) -> u64 {
        self.request_id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.calls.remove(self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PayloadCodec;

    fn response(id: u64) -> ResponseEnvelope {
        ResponseEnvelope::ok(id, PayloadCodec::Raw, &b"ok"[..])
    }

    #[tokio::test]
    async fn test_fulfill_routes_by_id() {
        let calls = PendingCalls::new();
        let (_g1, rx1) = calls.register(1).unwrap();
        let (_g2, rx2) = calls.register(2).unwrap();

        assert!(calls.fulfill(response(2)));
        assert!(calls.fulfill(response(1)));

        assert_eq!(rx1.await.unwrap().unwrap().request_id, 1);
        assert_eq!(rx2.await.unwrap().unwrap().request_id, 2);
        assert_eq!(calls.len(), 0);
    }

    #[test]
    fn test_fulfill_without_waiter_is_discarded() {
        let calls = PendingCalls::new();
        assert!(!calls.fulfill(response(99)));
    }

    #[test]
    fn test_guard_drop_removes_entry() {
        let calls = PendingCalls::new();
        let (guard, _rx) = calls.register(5).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(guard.request_id(), 5);

        drop(guard);
        assert_eq!(calls.len(), 0);
        // Late response for the abandoned id finds nobody.
        assert!(!calls.fulfill(response(5)));
    }

    #[tokio::test]
    async fn test_fail_reaches_only_that_waiter() {
        let calls = PendingCalls::new();
        let (_g1, rx1) = calls.register(1).unwrap();
        let (_g2, _rx2) = calls.register(2).unwrap();

        assert!(calls.fail(1, OffloadError::Protocol("bad envelope".into())));
        assert!(!calls.fail(1, OffloadError::Protocol("again".into())));
        assert!(matches!(rx1.await.unwrap(), Err(OffloadError::Protocol(_))));
        assert_eq!(calls.len(), 1);
        assert!(calls.closed_error().is_none());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let calls = PendingCalls::new();
        let (_guard, _rx) = calls.register(3).unwrap();
        assert!(calls.remove(3));
        assert!(!calls.remove(3));
    }

    #[tokio::test]
    async fn test_close_fails_waiters_and_new_registrations() {
        let calls = PendingCalls::new();
        let (_g1, rx1) = calls.register(1).unwrap();
        let (_g2, rx2) = calls.register(2).unwrap();

        assert_eq!(calls.close(CloseReason::Crashed("eof".into())), 2);
        assert!(calls.is_closed());

        assert!(matches!(
            rx1.await.unwrap(),
            Err(OffloadError::WorkerCrashed(_))
        ));
        assert!(matches!(
            rx2.await.unwrap(),
            Err(OffloadError::WorkerCrashed(_))
        ));
        assert!(matches!(
            calls.register(3),
            Err(OffloadError::WorkerCrashed(_))
        ));
    }

    #[test]
    fn test_first_close_reason_wins() {
        let calls = PendingCalls::new();
        calls.close(CloseReason::ClientClosed);
        calls.close(CloseReason::Crashed("eof".into()));
        assert!(matches!(calls.register(1), Err(OffloadError::ClientClosed)));
    }
}

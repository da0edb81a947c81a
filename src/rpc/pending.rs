//! Client-side table of calls awaiting a response.
//!
//! Each entry owns the oneshot sender for one call id. Completion removes the
//! entry, so every call resolves exactly once: by its response, or by
//! `ConnectionClosed` when the table is shut down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::core::error::{BridgeError, Result};
use crate::rpc::envelope::{CallId, Response};

type Completion = oneshot::Sender<Result<Response>>;

#[derive(Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<CallId, Completion>>,
    closed: AtomicBool,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `id` and return the receiver its response will be delivered on
    pub fn register(&self, id: CallId) -> Result<oneshot::Receiver<Result<Response>>> {
        let (tx, rx) = oneshot::channel();

        {
            let mut calls = self.calls.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(BridgeError::connection_closed());
            }
            if calls.contains_key(&id) {
                return Err(BridgeError::InvalidRequest(format!(
                    "Call id {id} is already in flight"
                )));
            }
            calls.insert(id, tx);
        }

        Ok(rx)
    }

    /// Deliver a response. Returns false if nobody is waiting for this id.
    pub fn complete(&self, response: Response) -> bool {
        let Some(tx) = self.calls.lock().remove(&response.id) else {
            log::warn!("Dropping response for unknown call id {}", response.id);
            return false;
        };
        // The caller may have given up already; nothing to do then.
        let _ = tx.send(Ok(response));
        true
    }

    /// Fail a single call, e.g. because its request could not be sent
    pub fn fail(&self, id: CallId, error: BridgeError) {
        if let Some(tx) = self.calls.lock().remove(&id) {
            let _ = tx.send(Err(error));
        }
    }

    /// Drop the entry for `id` without completing it. Returns false if it was already gone.
    pub fn forget(&self, id: CallId) -> bool {
        self.calls.lock().remove(&id).is_some()
    }

    /// Stop accepting calls and fail everything in flight with `ConnectionClosed`
    pub fn close(&self) -> usize {
        let drained: Vec<Completion> = {
            let mut calls = self.calls.lock();
            self.closed.store(true, Ordering::Release);
            calls.drain().map(|(_, tx)| tx).collect()
        };

        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(BridgeError::connection_closed()));
        }
        if count > 0 {
            log::info!("Failed {count} pending call(s): connection closed");
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

use krpc_encoding::{Envelope, TransactionId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::task::Waker;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("no transaction registered for id {0:?}")]
    NotFound(TransactionId),
    #[error("transaction map lock poisoned")]
    LockPoisoned,
}

enum TxState {
    AwaitingResponse { waker: Option<Waker> },
    GotResponse { envelope: Envelope },
}

/// Tracks outbound KRPC calls awaiting exactly one response, keyed by
/// transaction id. Adapted from
/// `packages/dht_crawler/src/transport/response_future.rs`'s
/// `TransactionMap`, ported from `tokio::prelude`'s 0.1-style polling to
/// a `Waker`-driven `Future`.
///
/// Only the DHT engine's bootstrap `find_node` calls use this -- every
/// other outbound query in this system is fire-and-forget, matched back
/// to state (a live searcher, the candidate pool) by the engine itself
/// rather than by awaiting a specific reply.
#[derive(Clone)]
pub struct ActiveTransactions {
    inner: Arc<Mutex<HashMap<TransactionId, TxState>>>,
}

impl ActiveTransactions {
    pub fn new() -> ActiveTransactions {
        ActiveTransactions {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn add_transaction(&self, id: TransactionId) -> Result<(), TransactionError> {
        let mut map = self.inner.lock().map_err(|_| TransactionError::LockPoisoned)?;
        map.insert(id, TxState::AwaitingResponse { waker: None });
        Ok(())
    }

    pub fn drop_transaction(&self, id: &TransactionId) -> Result<(), TransactionError> {
        let mut map = self.inner.lock().map_err(|_| TransactionError::LockPoisoned)?;
        map.remove(id);
        Ok(())
    }

    /// Called by the receive loop when an envelope arrives. Returns
    /// `None` if a registered transaction was waiting for it (it is now
    /// fulfilled and the envelope has been handed off), or hands the
    /// envelope back when nobody was waiting -- the caller should route
    /// it elsewhere.
    pub fn fulfill(&self, id: &TransactionId, envelope: Envelope) -> Result<Option<Envelope>, TransactionError> {
        let mut map = self.inner.lock().map_err(|_| TransactionError::LockPoisoned)?;
        match map.remove(id) {
            Some(TxState::AwaitingResponse { waker }) => {
                map.insert(id.clone(), TxState::GotResponse { envelope });
                if let Some(waker) = waker {
                    waker.wake();
                }
                Ok(None)
            }
            Some(other) => {
                map.insert(id.clone(), other);
                Ok(Some(envelope))
            }
            None => Ok(Some(envelope)),
        }
    }

    pub fn poll_response(
        &self,
        id: &TransactionId,
        waker: &Waker,
    ) -> std::task::Poll<Result<Envelope, TransactionError>> {
        use std::task::Poll;

        let mut map = match self.inner.lock() {
            Ok(map) => map,
            Err(_) => return Poll::Ready(Err(TransactionError::LockPoisoned)),
        };

        match map.remove(id) {
            None => Poll::Ready(Err(TransactionError::NotFound(id.clone()))),
            Some(TxState::GotResponse { envelope }) => Poll::Ready(Ok(envelope)),
            Some(TxState::AwaitingResponse { .. }) => {
                map.insert(id.clone(), TxState::AwaitingResponse {
                    waker: Some(waker.clone()),
                });
                Poll::Pending
            }
        }
    }
}

impl Default for ActiveTransactions {
    fn default() -> ActiveTransactions {
        ActiveTransactions::new()
    }
}

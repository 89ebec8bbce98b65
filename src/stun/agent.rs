//! In-flight STUN transaction bookkeeping.
//!
//! The [`Agent`] maps 96-bit transaction ids to completion handlers. A
//! handler is invoked exactly once, with the matching response, a stop error,
//! a timeout (via [`Agent::collect`]) or [`TransactionError::AgentClosed`].
//! The internal mutex is held only across map operations; handlers always run
//! with the lock released.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Instant;

use thiserror::Error;

use super::{Message, TransactionId};

/// Errors returned by [`Agent`] operations themselves.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("agent is closed")]
    Closed,
    #[error("transaction with the same id already exists")]
    TransactionExists,
    #[error("transaction does not exist")]
    TransactionNotExists,
}

/// Terminal outcomes delivered to a transaction handler instead of a
/// response.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransactionError {
    #[error("transaction timed out")]
    TimedOut,
    #[error("transaction was stopped")]
    Stopped,
    #[error("agent is closed")]
    AgentClosed,
}

/// What a transaction resolved to: the response and its source address, or a
/// terminal error.
pub type TransactionResult = Result<(Message, SocketAddr), TransactionError>;

type Handler = Box<dyn FnOnce(TransactionResult) + Send + 'static>;

struct Transaction {
    deadline: Instant,
    handler: Handler,
}

#[derive(Default)]
struct Inner {
    transactions: HashMap<TransactionId, Transaction>,
    closed: bool,
}

/// Registry of in-flight transactions, keyed by transaction id.
#[derive(Default)]
pub struct Agent {
    inner: Mutex<Inner>,
    default_handler: Option<Box<dyn Fn(Message, SocketAddr) + Send + Sync>>,
}

impl Agent {
    pub fn new() -> Self {
        Agent::default()
    }

    /// An agent whose unmatched messages go to `handler` instead of being
    /// handed back by [`Agent::process`].
    pub fn with_default_handler(
        handler: impl Fn(Message, SocketAddr) + Send + Sync + 'static,
    ) -> Self {
        Agent {
            inner: Mutex::default(),
            default_handler: Some(Box::new(handler)),
        }
    }

    /// Registers a transaction. The handler is guaranteed to be called
    /// exactly once.
    pub fn start(
        &self,
        id: TransactionId,
        deadline: Instant,
        handler: impl FnOnce(TransactionResult) + Send + 'static,
    ) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().expect("agent mutex poisoned");
        if inner.closed {
            return Err(AgentError::Closed);
        }
        if inner.transactions.contains_key(&id) {
            return Err(AgentError::TransactionExists);
        }
        inner.transactions.insert(
            id,
            Transaction {
                deadline,
                handler: Box::new(handler),
            },
        );
        Ok(())
    }

    /// Routes a message to the transaction with a matching id.
    ///
    /// Returns `Ok(Some(message))` when no transaction matched and no default
    /// handler is installed, handing the message back to the caller.
    pub fn process(
        &self,
        message: Message,
        from: SocketAddr,
    ) -> Result<Option<Message>, AgentError> {
        let transaction = {
            let mut inner = self.inner.lock().expect("agent mutex poisoned");
            if inner.closed {
                return Err(AgentError::Closed);
            }
            inner.transactions.remove(&message.transaction_id())
        };

        match transaction {
            Some(transaction) => {
                (transaction.handler)(Ok((message, from)));
                Ok(None)
            }
            None => match &self.default_handler {
                Some(handler) => {
                    handler(message, from);
                    Ok(None)
                }
                None => Ok(Some(message)),
            },
        }
    }

    /// Removes a transaction and resolves it with `error`.
    pub fn stop_with_error(
        &self,
        id: TransactionId,
        error: TransactionError,
    ) -> Result<(), AgentError> {
        let transaction = {
            let mut inner = self.inner.lock().expect("agent mutex poisoned");
            if inner.closed {
                return Err(AgentError::Closed);
            }
            inner.transactions.remove(&id)
        };

        let transaction = transaction.ok_or(AgentError::TransactionNotExists)?;
        (transaction.handler)(Err(error));
        Ok(())
    }

    pub fn stop(&self, id: TransactionId) -> Result<(), AgentError> {
        self.stop_with_error(id, TransactionError::Stopped)
    }

    /// Expires every transaction whose deadline lies before `now`.
    pub fn collect(&self, now: Instant) -> Result<(), AgentError> {
        let expired: Vec<Transaction> = {
            let mut inner = self.inner.lock().expect("agent mutex poisoned");
            if inner.closed {
                return Err(AgentError::Closed);
            }
            let ids: Vec<TransactionId> = inner
                .transactions
                .iter()
                .filter(|(_, t)| t.deadline < now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.transactions.remove(&id))
                .collect()
        };

        for transaction in expired {
            (transaction.handler)(Err(TransactionError::TimedOut));
        }
        Ok(())
    }

    /// Rejects every outstanding transaction with
    /// [`TransactionError::AgentClosed`] and refuses all further operations.
    pub fn close(&self) {
        let drained: Vec<Transaction> = {
            let mut inner = self.inner.lock().expect("agent mutex poisoned");
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.transactions.drain().map(|(_, t)| t).collect()
        };

        for transaction in drained {
            (transaction.handler)(Err(TransactionError::AgentClosed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stun::{MessageClass, Method};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn from_addr() -> SocketAddr {
        "127.0.0.1:3478".parse().unwrap()
    }

    fn response(id: TransactionId) -> Message {
        Message::new(MessageClass::SuccessResponse, Method::BINDING, id)
    }

    #[test]
    fn routes_response_to_handler_once() {
        let agent = Agent::new();
        let id = TransactionId::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls2 = calls.clone();
        agent
            .start(id, Instant::now() + Duration::from_secs(5), move |result| {
                assert!(result.is_ok());
                calls2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(agent.process(response(id), from_addr()).unwrap().is_none());
        // A duplicate response no longer matches and is handed back.
        assert!(agent.process(response(id), from_addr()).unwrap().is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let agent = Agent::new();
        let id = TransactionId::new();
        let deadline = Instant::now() + Duration::from_secs(5);

        agent.start(id, deadline, |_| {}).unwrap();
        assert_eq!(
            agent.start(id, deadline, |_| {}),
            Err(AgentError::TransactionExists)
        );
    }

    #[test]
    fn concurrent_start_with_same_id_yields_one_success() {
        let agent = Arc::new(Agent::new());
        let id = TransactionId::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let successes = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..2)
            .map(|_| {
                let agent = agent.clone();
                let successes = successes.clone();
                std::thread::spawn(move || {
                    if agent.start(id, deadline, |_| {}).is_ok() {
                        successes.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(successes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn collect_expires_only_past_deadlines() {
        let agent = Agent::new();
        let now = Instant::now();
        let expired_calls = Arc::new(AtomicUsize::new(0));
        let live_calls = Arc::new(AtomicUsize::new(0));

        let expired = TransactionId::new();
        let live = TransactionId::new();

        let c = expired_calls.clone();
        agent
            .start(expired, now, move |result| {
                assert_eq!(result.unwrap_err(), TransactionError::TimedOut);
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let c = live_calls.clone();
        agent
            .start(live, now + Duration::from_secs(60), move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        agent.collect(now + Duration::from_millis(1)).unwrap();

        assert_eq!(expired_calls.load(Ordering::SeqCst), 1);
        assert_eq!(live_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stop_resolves_with_error_and_is_not_idempotent() {
        let agent = Agent::new();
        let id = TransactionId::new();

        agent
            .start(id, Instant::now() + Duration::from_secs(5), |result| {
                assert_eq!(result.unwrap_err(), TransactionError::Stopped);
            })
            .unwrap();

        agent.stop(id).unwrap();
        assert_eq!(agent.stop(id), Err(AgentError::TransactionNotExists));
    }

    #[test]
    fn close_rejects_outstanding_and_future_transactions() {
        let agent = Agent::new();
        let id = TransactionId::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        agent
            .start(id, Instant::now() + Duration::from_secs(5), move |result| {
                assert_eq!(result.unwrap_err(), TransactionError::AgentClosed);
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        agent.close();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(
            agent.start(TransactionId::new(), Instant::now(), |_| {}),
            Err(AgentError::Closed)
        );
        assert_eq!(
            agent.process(response(id), from_addr()),
            Err(AgentError::Closed)
        );
    }

    #[test]
    fn unmatched_message_goes_to_default_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let agent = Agent::with_default_handler(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let consumed = agent
            .process(response(TransactionId::new()), from_addr())
            .unwrap();
        assert!(consumed.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

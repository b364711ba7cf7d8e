//! Request/response correlation.
//!
//! # How replies find their caller (for beginners)
//!
//! ```text
//! prepare(Ping)                       on_reply_received(Ok{Id:7})
//!   id = 7                              pending[7] found
//!   pending[7] = oneshot tx   ───►      tx.send(Ok)  ───►  PendingReply resolves
//!   return (text, PendingReply)
//! ```
//!
//! The slot is inserted before the encoded text is handed back, so a reply
//! can never arrive for an id that is not yet registered.  Id allocation and
//! insertion happen under one lock: concurrent callers get strictly
//! increasing ids in the same order the table sees them.  A `PendingReply`
//! dropped before its reply arrives takes its slot out of the table.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use tactile_core::protocol::MessageIdCounter;
use tactile_core::{encode_message, ErrorCode, Message, MessageVersion, SERVER_MESSAGE_ID};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Why a request did not produce a successful reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The server answered with an `Error` message.
    #[error("server error {code}: {message}")]
    Server { code: ErrorCode, message: String },

    /// The connection closed before the reply arrived.
    #[error("connection closed before request {id} was answered")]
    ConnectionClosed { id: u32 },

    /// The reply arrived but could not be decoded.
    #[error("reply to request {id} could not be decoded: {reason}")]
    InvalidReply { id: u32, reason: String },

    /// The tracker was already closed when the request was prepared.
    #[error("not connected")]
    NotConnected,
}

type ReplySlot = oneshot::Sender<Result<Message, RequestError>>;

struct Table {
    pending: HashMap<u32, ReplySlot>,
    closed: bool,
}

/// Assigns ids to outgoing requests and routes replies back to them.
pub struct RequestTracker {
    ids: MessageIdCounter,
    table: Arc<Mutex<Table>>,
    version: MessageVersion,
}

impl RequestTracker {
    /// A tracker that encodes requests for a peer speaking `version`.
    pub fn new(version: MessageVersion) -> Self {
        Self {
            ids: MessageIdCounter::new(),
            table: Arc::new(Mutex::new(Table {
                pending: HashMap::new(),
                closed: false,
            })),
            version,
        }
    }

    /// Stamps `msg` with a fresh id, registers a reply slot, and returns the
    /// encoded frame together with the future that resolves on reply.
    ///
    /// # Errors
    ///
    /// [`RequestError::NotConnected`] after [`close`](Self::close).
    pub fn prepare(&self, mut msg: Message) -> Result<(String, PendingReply), RequestError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut table = self.lock();
            if table.closed {
                return Err(RequestError::NotConnected);
            }
            let id = self.ids.next();
            table.pending.insert(id, tx);
            id
        };
        msg.set_id(id);
        debug!("prepared {} with id {id}", msg.name());
        let text = encode_message(&msg, self.version);
        Ok((
            text,
            PendingReply {
                id,
                rx,
                table: Arc::downgrade(&self.table),
            },
        ))
    }

    /// Routes one inbound message.
    ///
    /// Returns the message back when it is not a reply to a pending request:
    /// id 0 events are returned as-is; a nonzero id nobody is waiting for is
    /// turned into an `ERROR_MSG` error event.
    pub fn on_reply_received(&self, msg: Message) -> Option<Message> {
        let id = msg.id();
        if id == SERVER_MESSAGE_ID {
            return Some(msg);
        }

        let slot = self.lock().pending.remove(&id);
        let Some(slot) = slot else {
            warn!("{} with id {id} matches no pending request", msg.name());
            return Some(Message::error(
                SERVER_MESSAGE_ID,
                ErrorCode::Message,
                format!("reply {} has unknown id {id}", msg.name()),
            ));
        };

        let outcome = match msg {
            Message::Error(e) => Err(RequestError::Server {
                code: e.error_code,
                message: e.error_message,
            }),
            other => Ok(other),
        };
        // The caller may have given up on the reply; that is fine.
        let _ = slot.send(outcome);
        None
    }

    /// Fails the pending request `id` with `error`.  Returns `false` if no
    /// request with that id is waiting.
    pub fn fail(&self, id: u32, error: RequestError) -> bool {
        let Some(slot) = self.lock().pending.remove(&id) else {
            return false;
        };
        let _ = slot.send(Err(error));
        true
    }

    /// Fails every pending request and refuses new ones.
    pub fn close(&self) {
        let drained: Vec<(u32, ReplySlot)> = {
            let mut table = self.lock();
            table.closed = true;
            table.pending.drain().collect()
        };
        for (id, slot) in drained {
            let _ = slot.send(Err(RequestError::ConnectionClosed { id }));
        }
    }

    /// Number of requests still awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        lock_table(&self.table)
    }
}

fn lock_table(table: &Mutex<Table>) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Drop for RequestTracker {
    fn drop(&mut self) {
        self.close();
    }
}

/// Resolves with the reply to one request.
#[derive(Debug)]
pub struct PendingReply {
    id: u32,
    rx: oneshot::Receiver<Result<Message, RequestError>>,
    table: Weak<Mutex<Table>>,
}

impl PendingReply {
    /// Id the request was sent with.
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            lock_table(&table).pending.remove(&self.id);
        }
    }
}

impl Future for PendingReply {
    type Output = Result<Message, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RequestError::ConnectionClosed { id })))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

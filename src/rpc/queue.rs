//! Inbound messages and the deferred message queue.
//!
//! While a blocking request waits at top level, requests and notifications
//! from the peer cannot be handed to user handlers yet. They are appended here
//! and replayed in arrival order by the next `run` (or `next_message`).

use std::collections::VecDeque;
use std::fmt;

use rmpv::Value;

use crate::rpc::async_session::AsyncSession;

/// Sends the single Response owed for an inbound request.
///
/// Consumed by `send`/`send_error`, so a request can be answered at most once.
pub struct Responder {
    id: u64,
    session: AsyncSession,
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder").field("id", &self.id).finish()
    }
}

impl Responder {
    pub(crate) fn new(id: u64, session: AsyncSession) -> Self {
        Self { id, session }
    }

    /// Id of the request being answered.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Reply with a result.
    pub fn send(self, value: Value) {
        self.session.respond(self.id, Ok(value));
    }

    /// Reply with an error payload, sent verbatim.
    pub fn send_error(self, error: Value) {
        self.session.respond(self.id, Err(error));
    }

    pub(crate) fn respond(self, outcome: Result<Value, Value>) {
        self.session.respond(self.id, outcome);
    }
}

/// A request or notification received from the peer.
#[derive(Debug)]
pub enum InboundMessage {
    Request {
        method: String,
        args: Vec<Value>,
        responder: Responder,
    },
    Notification {
        method: String,
        args: Vec<Value>,
    },
}

impl InboundMessage {
    pub fn method(&self) -> &str {
        match self {
            InboundMessage::Request { method, .. } | InboundMessage::Notification { method, .. } => {
                method
            }
        }
    }

    pub fn args(&self) -> &[Value] {
        match self {
            InboundMessage::Request { args, .. } | InboundMessage::Notification { args, .. } => args,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, InboundMessage::Request { .. })
    }
}

/// FIFO of inbound messages waiting for a dispatcher.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    messages: VecDeque<InboundMessage>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_request(&mut self, method: String, args: Vec<Value>, responder: Responder) {
        self.messages.push_back(InboundMessage::Request {
            method,
            args,
            responder,
        });
    }

    pub fn push_notification(&mut self, method: String, args: Vec<Value>) {
        self.messages
            .push_back(InboundMessage::Notification { method, args });
    }

    /// Oldest buffered message.
    pub fn pop(&mut self) -> Option<InboundMessage> {
        self.messages.pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

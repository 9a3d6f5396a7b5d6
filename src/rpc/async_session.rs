//! Non-blocking msgpack-RPC plumbing over one transport connection.
//!
//! `AsyncSession` owns the transport, the outbound queue and the pending call
//! table. It never blocks: `request` and `post` only queue bytes, and
//! everything else happens inside `run`, which reads the transport, classifies
//! each message and hands it to the caller's callbacks.
//!
//! All state lives behind `Rc<RefCell<..>>` and is only touched from the
//! thread driving `run`. Borrows are never held across an `.await`.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use rmpv::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::{RemoteError, SessionError};
use crate::rpc::codec::{Message, MessageDecoder};
use crate::rpc::queue::Responder;
use crate::transport::Transport;

/// Callback resolving one outbound request. Invoked exactly once.
pub type Completion = Box<dyn FnOnce(Result<Value, SessionError>)>;

struct State {
    next_request_id: u64,
    pending: HashMap<u64, Completion>,
    outbound: VecDeque<Vec<u8>>,
    decoder: MessageDecoder,
    stop_requested: bool,
    running: bool,
    closed: bool,
    /// First fatal error seen; every later `run` fails with it.
    terminal: Option<SessionError>,
}

struct Inner {
    state: RefCell<State>,
    /// `None` while `run` has it checked out, or after close.
    transport: RefCell<Option<Transport>>,
    /// Wakes a `run` blocked on the transport (stop, new outbound data).
    wake: Notify,
    read_buffer_size: usize,
    handle_signals: bool,
}

/// Asynchronous msgpack-RPC session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AsyncSession {
    inner: Rc<Inner>,
}

/// Weak handle that can stop a session's loop without keeping it alive.
#[derive(Clone)]
pub struct Stopper {
    inner: Weak<Inner>,
}

impl Stopper {
    pub fn stop(&self) {
        if let Some(inner) = self.inner.upgrade() {
            AsyncSession { inner }.stop();
        }
    }
}

impl AsyncSession {
    pub fn new(transport: Transport, config: &SessionConfig) -> Self {
        Self {
            inner: Rc::new(Inner {
                state: RefCell::new(State {
                    next_request_id: 1,
                    pending: HashMap::new(),
                    outbound: VecDeque::new(),
                    decoder: MessageDecoder::new(config.max_message_size),
                    stop_requested: false,
                    running: false,
                    closed: false,
                    terminal: None,
                }),
                transport: RefCell::new(Some(transport)),
                wake: Notify::new(),
                read_buffer_size: config.read_buffer_size.max(1),
                handle_signals: config.handle_signals,
            }),
        }
    }

    /// Get a weak stop handle.
    pub fn stopper(&self) -> Stopper {
        Stopper {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Whether `run` is currently active.
    pub fn is_running(&self) -> bool {
        self.inner.state.borrow().running
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().closed
    }

    /// Number of outbound requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.state.borrow().pending.len()
    }

    fn check_usable(state: &State) -> Result<(), SessionError> {
        if state.closed {
            return Err(SessionError::Closed);
        }
        if let Some(err) = &state.terminal {
            return Err(err.clone());
        }
        Ok(())
    }

    fn enqueue(&self, message: &Message) -> Result<(), SessionError> {
        let bytes = message.encode()?;
        {
            let mut state = self.inner.state.borrow_mut();
            Self::check_usable(&state)?;
            state.outbound.push_back(bytes);
        }
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Queue a notification. Never blocks.
    pub fn post(&self, method: &str, args: Vec<Value>) -> Result<(), SessionError> {
        debug!("sending notification: {} {:?}", method, args);
        self.enqueue(&Message::Notification {
            method: method.to_string(),
            args,
        })
    }

    /// Queue a request and register `completion` for its response.
    ///
    /// Returns the allocated request id. `completion` runs on the loop thread
    /// when the response arrives, or with an error if the connection is torn
    /// down first.
    pub fn request<F>(&self, method: &str, args: Vec<Value>, completion: F) -> Result<u64, SessionError>
    where
        F: FnOnce(Result<Value, SessionError>) + 'static,
    {
        let mut state = self.inner.state.borrow_mut();
        Self::check_usable(&state)?;

        let id = state.next_request_id;
        let bytes = Message::Request {
            id,
            method: method.to_string(),
            args,
        }
        .encode()?;
        state.next_request_id = id + 1;
        state.pending.insert(id, Box::new(completion));
        state.outbound.push_back(bytes);
        drop(state);

        debug!("sent request {}: {}", id, method);
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// Queue the response to an inbound request.
    pub(crate) fn respond(&self, id: u64, outcome: Result<Value, Value>) {
        let (error, result) = match outcome {
            Ok(value) => (None, value),
            Err(err) => (Some(err), Value::Nil),
        };
        debug!("sending response to request {}: error={:?}", id, error);
        if let Err(e) = self.enqueue(&Message::Response { id, error, result }) {
            warn!("Dropping response to request {}: {}", id, e);
        }
    }

    /// Make the active `run` return as soon as possible. Idempotent.
    ///
    /// A stop requested while no loop is running is kept, and the next `run`
    /// returns before reading anything.
    pub fn stop(&self) {
        self.inner.state.borrow_mut().stop_requested = true;
        self.inner.wake.notify_one();
        debug!("Stopped event loop");
    }

    /// Run the loop until `stop()` or a fatal error.
    ///
    /// Requests go to `on_request(method, args, responder)`, notifications to
    /// `on_notification(method, args)`; responses resolve their pending call.
    ///
    /// # Errors
    ///
    /// - `SessionError::Usage` if a `run` is already active
    /// - `SessionError::Closed` after `close()`
    /// - `SessionError::Eof`, `Io` or `Framing` when the connection dies; every
    ///   pending call is failed with the same error first
    pub async fn run<R, N>(&self, mut on_request: R, mut on_notification: N) -> Result<(), SessionError>
    where
        R: FnMut(String, Vec<Value>, Responder),
        N: FnMut(String, Vec<Value>),
    {
        let mut transport = {
            let mut state = self.inner.state.borrow_mut();
            if state.running {
                return Err(SessionError::Usage("event loop already running"));
            }
            Self::check_usable(&state)?;
            let transport = self
                .inner
                .transport
                .borrow_mut()
                .take()
                .ok_or(SessionError::Closed)?;
            state.running = true;
            transport
        };

        debug!("Entering event loop");
        let result = self
            .drive(&mut transport, &mut on_request, &mut on_notification)
            .await;
        debug!("Exited event loop");

        let closed = {
            let mut state = self.inner.state.borrow_mut();
            state.running = false;
            state.stop_requested = false;
            if state.closed {
                state.outbound.clear();
            }
            state.closed
        };
        if closed {
            transport.shutdown().await;
        } else {
            *self.inner.transport.borrow_mut() = Some(transport);
        }
        result
    }

    async fn drive(
        &self,
        transport: &mut Transport,
        on_request: &mut dyn FnMut(String, Vec<Value>, Responder),
        on_notification: &mut dyn FnMut(String, Vec<Value>),
    ) -> Result<(), SessionError> {
        let mut chunk = vec![0u8; self.inner.read_buffer_size];

        loop {
            // Dispatch whatever is already buffered before reading more.
            loop {
                if self.stop_requested() {
                    return self.flush_to(transport).await.map_err(|e| self.fail(e));
                }
                let next = self.inner.state.borrow_mut().decoder.next_message();
                match next {
                    Ok(Some(message)) => self.dispatch(message, on_request, on_notification).await,
                    Ok(None) => break,
                    Err(e) => return Err(self.fail(e.into())),
                }
            }

            if let Err(e) = self.flush_to(transport).await {
                return Err(self.fail(e));
            }
            if self.stop_requested() {
                // Pick up anything queued while the write above was pending.
                return self.flush_to(transport).await.map_err(|e| self.fail(e));
            }

            let watch_signals = self.inner.handle_signals;
            let is_stdio = transport.is_stdio();
            tokio::select! {
                biased;
                _ = self.inner.wake.notified() => {}
                signal = tokio::signal::ctrl_c(), if watch_signals => {
                    if let Err(e) = signal {
                        warn!("Failed to listen for Ctrl-C: {}", e);
                    } else if is_stdio {
                        // The editor owns the terminal when we are its child.
                        debug!("Ignoring Ctrl-C on stdio transport");
                    } else {
                        info!("Received Ctrl-C, stopping event loop");
                        return Err(SessionError::Interrupted);
                    }
                }
                read = transport.reader.read(&mut chunk) => match read {
                    Ok(0) => {
                        info!("Connection closed by peer");
                        return Err(self.fail(SessionError::Eof));
                    }
                    Ok(n) => self.inner.state.borrow_mut().decoder.feed(&chunk[..n]),
                    Err(e) => return Err(self.fail(e.into())),
                },
            }
        }
    }

    /// Drop a stop requested while no loop was running.
    pub(crate) fn clear_stop(&self) {
        self.inner.state.borrow_mut().stop_requested = false;
    }

    fn stop_requested(&self) -> bool {
        self.inner.state.borrow().stop_requested
    }

    async fn dispatch(
        &self,
        message: Message,
        on_request: &mut dyn FnMut(String, Vec<Value>, Responder),
        on_notification: &mut dyn FnMut(String, Vec<Value>),
    ) {
        match message {
            Message::Request { id, method, args } => {
                debug!("received request {}: {} {:?}", id, method, args);
                on_request(method, args, Responder::new(id, self.clone()));
            }
            Message::Notification { method, args } => {
                debug!("received notification: {} {:?}", method, args);
                on_notification(method, args);
            }
            Message::Response { id, error, result } => {
                debug!("received response {}: error={:?}", id, error);
                let completion = self.inner.state.borrow_mut().pending.remove(&id);
                match completion {
                    Some(completion) => {
                        completion(match error {
                            Some(err) => Err(SessionError::Remote(RemoteError::new(err))),
                            None => Ok(result),
                        });
                        // Let the resumed caller run before the next message.
                        tokio::task::yield_now().await;
                    }
                    None => warn!("Received response for unknown request id {}", id),
                }
            }
        }
    }

    async fn flush_to(&self, transport: &mut Transport) -> Result<(), SessionError> {
        let mut wrote = false;
        loop {
            let next = self.inner.state.borrow_mut().outbound.pop_front();
            let Some(bytes) = next else { break };
            transport.writer.write_all(&bytes).await?;
            wrote = true;
        }
        if wrote {
            transport.writer.flush().await?;
        }
        Ok(())
    }

    /// Write queued messages without running the loop.
    ///
    /// Used at top level, where nothing else is driving the transport.
    pub async fn flush(&self) -> Result<(), SessionError> {
        let taken = self.inner.transport.borrow_mut().take();
        let Some(mut transport) = taken else {
            // Either `run` owns the transport and will flush, or we are closed.
            return if self.is_closed() {
                Err(SessionError::Closed)
            } else {
                Ok(())
            };
        };
        let result = self.flush_to(&mut transport).await;
        *self.inner.transport.borrow_mut() = Some(transport);
        result.map_err(|e| self.fail(e))
    }

    /// Record a fatal error and fail every pending call with it.
    ///
    /// Queued outbound bytes survive `Closed` so `close` can still write them.
    fn fail(&self, err: SessionError) -> SessionError {
        let pending = {
            let mut state = self.inner.state.borrow_mut();
            if !matches!(err, SessionError::Closed) {
                if state.terminal.is_none() {
                    state.terminal = Some(err.clone());
                }
                state.outbound.clear();
            }
            let mut pending: Vec<(u64, Completion)> = state.pending.drain().collect();
            pending.sort_by_key(|(id, _)| *id);
            pending
        };

        if matches!(err, SessionError::Closed) {
            info!("Session closed with {} pending call(s)", pending.len());
        } else {
            error!("Session failed: {} ({} pending call(s))", err, pending.len());
        }
        for (_, completion) in pending {
            completion(Err(err.clone()));
        }
        err
    }

    /// Close the session and release the transport.
    ///
    /// Pending calls fail with `SessionError::Closed`. Messages already queued,
    /// such as replies to inbound requests, are written before the transport is
    /// shut down. If `run` is active it stops, flushes and releases the
    /// transport on its way out.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.fail(SessionError::Closed);
        self.stop();

        let taken = self.inner.transport.borrow_mut().take();
        if let Some(mut transport) = taken {
            if let Err(e) = self.flush_to(&mut transport).await {
                warn!("Failed to flush queued messages on close: {}", e);
            }
            self.inner.state.borrow_mut().outbound.clear();
            transport.shutdown().await;
        }
        info!("Closed event loop");
    }
}

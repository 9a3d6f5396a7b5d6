//! Synchronous façade over `AsyncSession`.
//!
//! `Session` owns a current-thread tokio runtime and a `LocalSet`. Every public
//! method blocks the calling thread while it drives the loop, so callers never
//! need a runtime of their own:
//!
//! ```ignore
//! let session = Session::connect(&TransportKind::from_address("127.0.0.1:6666"), SessionConfig::default())?;
//! let reply = session.request("echo", vec![Value::from("hi")])?;
//!
//! session.run(
//!     |handle, method, args| async move {
//!         // Yields to the loop until the editor answers
//!         let line = handle.request("get_current_line", vec![]).await?;
//!         Ok(line)
//!     },
//!     |_handle, method, _args| async move {
//!         tracing::info!("notification {}", method);
//!         Ok(())
//!     },
//! )?;
//! ```
//!
//! Inbound requests and notifications are each handled in their own
//! `spawn_local` task. A handler that awaits `Handle::request` suspends only
//! its own task; the loop keeps serving other traffic meanwhile.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;

use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;
use rmpv::Value;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;
use tracing::{debug, info, warn};

use crate::config::{ErrorHandler, SessionConfig};
use crate::error::{DispatchError, DispatchKind, HandlerError, SessionError};
use crate::models::{ClientInfo, SET_CLIENT_INFO_METHOD};
use crate::rpc::async_session::AsyncSession;
use crate::rpc::queue::{DeferredQueue, InboundMessage, Responder};
use crate::transport::{Transport, TransportKind};

type RequestCallback =
    Rc<dyn Fn(Handle, String, Vec<Value>) -> LocalBoxFuture<'static, Result<Value, HandlerError>>>;
type NotificationCallback =
    Rc<dyn Fn(Handle, String, Vec<Value>) -> LocalBoxFuture<'static, Result<(), HandlerError>>>;
type SetupCallback = Box<dyn FnOnce(Handle) -> LocalBoxFuture<'static, Result<(), HandlerError>>>;

/// Closure marshalled from another thread onto the loop thread.
pub type ThreadsafeCall =
    Box<dyn FnOnce(Handle) -> LocalBoxFuture<'static, anyhow::Result<()>> + Send>;

/// What the session's thread is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    /// A top-level `request` is waiting for its response.
    Blocking,
    /// `run` or `next_message` is driving the loop.
    Running,
}

struct Handlers {
    request: RequestCallback,
    notification: NotificationCallback,
}

struct Shared {
    session: AsyncSession,
    deferred: RefCell<DeferredQueue>,
    state: Cell<LoopState>,
    error_handler: Option<ErrorHandler>,
    calls_tx: mpsc::UnboundedSender<ThreadsafeCall>,
    /// Taken while a loop is pumping it.
    calls_rx: RefCell<Option<mpsc::UnboundedReceiver<ThreadsafeCall>>>,
    setup_failure: RefCell<Option<SessionError>>,
}

impl Shared {
    fn report(&self, kind: DispatchKind, method: &str, message: String) {
        let err = DispatchError {
            kind,
            method: method.to_string(),
            message,
        };
        warn!("{}", err);
        if let Some(handler) = &self.error_handler {
            handler(&err);
        }
    }

    /// Run `fut` while executing threadsafe calls as they arrive.
    async fn with_calls<F: Future>(self: &Rc<Self>, fut: F) -> F::Output {
        let taken = self.calls_rx.borrow_mut().take();
        let Some(mut rx) = taken else {
            return fut.await;
        };

        tokio::pin!(fut);
        let output = loop {
            tokio::select! {
                output = &mut fut => break output,
                Some(call) = rx.recv() => self.spawn_call(call),
            }
        };
        *self.calls_rx.borrow_mut() = Some(rx);
        output
    }

    fn handle(self: &Rc<Self>) -> Handle {
        Handle {
            shared: Rc::clone(self),
        }
    }

    fn spawn_call(self: &Rc<Self>, call: ThreadsafeCall) {
        let handle = self.handle();
        let shared = Rc::clone(self);
        tokio::task::spawn_local(async move {
            let outcome = AssertUnwindSafe(async move { call(handle).await })
                .catch_unwind()
                .await;
            let message = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(e)) => format!("{:#}", e),
                Err(panic) => panic_message(panic.as_ref()),
            };
            shared.report(DispatchKind::ThreadsafeCall, "", message);
        });
    }

    fn spawn_setup(self: &Rc<Self>, setup: SetupCallback) {
        let handle = self.handle();
        let shared = Rc::clone(self);
        tokio::task::spawn_local(async move {
            let outcome = AssertUnwindSafe(async move { setup(handle).await })
                .catch_unwind()
                .await;
            let message = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(e)) => format!("{:#}", e),
                Err(panic) => panic_message(panic.as_ref()),
            };
            shared.report(DispatchKind::Setup, "", message.clone());
            *shared.setup_failure.borrow_mut() = Some(SessionError::Setup(message));
            shared.session.stop();
        });
    }

    fn spawn_request(
        self: &Rc<Self>,
        handlers: &Handlers,
        method: String,
        args: Vec<Value>,
        responder: Responder,
    ) {
        let callback = Rc::clone(&handlers.request);
        let handle = self.handle();
        let shared = Rc::clone(self);
        tokio::task::spawn_local(async move {
            let name = method.clone();
            let outcome = AssertUnwindSafe(async move { callback(handle, method, args).await })
                .catch_unwind()
                .await;
            let result = match outcome {
                Ok(result) => result,
                Err(panic) => Err(HandlerError::Other(anyhow::anyhow!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            };
            match result {
                Ok(value) => responder.send(value),
                Err(err) => {
                    if let HandlerError::Response(payload) = &err {
                        debug!("request '{}' answered with error {}", name, payload);
                    } else {
                        shared.report(DispatchKind::Request, &name, format!("{:#}", err));
                    }
                    responder.respond(Err(err.to_wire()));
                }
            }
        });
    }

    fn spawn_notification(self: &Rc<Self>, handlers: &Handlers, method: String, args: Vec<Value>) {
        let callback = Rc::clone(&handlers.notification);
        let handle = self.handle();
        let shared = Rc::clone(self);
        tokio::task::spawn_local(async move {
            let name = method.clone();
            let outcome = AssertUnwindSafe(async move { callback(handle, method, args).await })
                .catch_unwind()
                .await;
            let message = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(e)) => format!("{:#}", e),
                Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
            };
            shared.report(DispatchKind::Notification, &name, message);
        });
    }

    fn dispatch(self: &Rc<Self>, handlers: &Handlers, message: InboundMessage) {
        match message {
            InboundMessage::Request {
                method,
                args,
                responder,
            } => self.spawn_request(handlers, method, args, responder),
            InboundMessage::Notification { method, args } => {
                self.spawn_notification(handlers, method, args)
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Resets the loop state when a driving call returns (or unwinds).
struct StateGuard<'a> {
    state: &'a Cell<LoopState>,
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        self.state.set(LoopState::Idle);
    }
}

/// Blocking msgpack-RPC session.
pub struct Session {
    shared: Rc<Shared>,
    // Declared before the runtime so tasks are dropped while it is alive.
    local: LocalSet,
    runtime: Runtime,
}

impl Session {
    /// Connect over `kind` and announce `config.client_info` if set.
    pub fn connect(kind: &TransportKind, config: SessionConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let runtime = build_runtime()?;
        let transport = runtime
            .block_on(kind.connect())
            .with_context(|| format!("Failed to connect to {}", kind))?;
        let session = Self::with_runtime(transport, &config, runtime);
        session.announce(config.client_info.as_ref())?;
        Ok(session)
    }

    /// Wrap an already open transport.
    ///
    /// The transport must not be bound to another runtime's reactor; use
    /// in-memory streams or `Session::connect`.
    pub fn from_transport(transport: Transport, config: SessionConfig) -> anyhow::Result<Self> {
        let runtime = build_runtime()?;
        let session = Self::with_runtime(transport, &config, runtime);
        session.announce(config.client_info.as_ref())?;
        Ok(session)
    }

    fn with_runtime(transport: Transport, config: &SessionConfig, runtime: Runtime) -> Self {
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let session = AsyncSession::new(transport, config);
        Self {
            shared: Rc::new(Shared {
                session,
                deferred: RefCell::new(DeferredQueue::new()),
                state: Cell::new(LoopState::Idle),
                error_handler: config.error_handler.clone(),
                calls_tx,
                calls_rx: RefCell::new(Some(calls_rx)),
                setup_failure: RefCell::new(None),
            }),
            local: LocalSet::new(),
            runtime,
        }
    }

    fn announce(&self, info: Option<&ClientInfo>) -> anyhow::Result<()> {
        use anyhow::Context;

        let Some(info) = info else {
            return Ok(());
        };
        let args = info.to_args()?;
        info!("Announcing client '{}'", info.name);
        self.post(SET_CLIENT_INFO_METHOD, args)
            .context("Failed to announce client info")
    }

    fn enter(&self, next: LoopState) -> Result<StateGuard<'_>, SessionError> {
        match self.shared.state.get() {
            LoopState::Idle => {
                self.shared.state.set(next);
                Ok(StateGuard {
                    state: &self.shared.state,
                })
            }
            LoopState::Blocking => Err(SessionError::Usage("blocking request in progress")),
            LoopState::Running => Err(SessionError::Usage("event loop already running")),
        }
    }

    /// Current loop state.
    pub fn loop_state(&self) -> LoopState {
        self.shared.state.get()
    }

    /// Handle for the in-handler API, bound to this session.
    pub fn handle(&self) -> Handle {
        self.shared.handle()
    }

    /// Sendable handle for scheduling work from other threads.
    pub fn threadsafe_handle(&self) -> ThreadsafeHandle {
        ThreadsafeHandle {
            tx: self.shared.calls_tx.clone(),
        }
    }

    /// Send a request and block until its response arrives.
    ///
    /// Requests and notifications the peer sends meanwhile are buffered and
    /// dispatched, in order, by the next `run` or `next_message`. Inside a
    /// handler use `Handle::request` instead.
    pub fn request(&self, method: &str, args: Vec<Value>) -> Result<Value, SessionError> {
        let _guard = self.enter(LoopState::Blocking)?;

        let slot: Rc<RefCell<Option<Result<Value, SessionError>>>> = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&slot);
        let stopper = self.shared.session.stopper();
        self.shared.session.request(method, args, move |result| {
            *sink.borrow_mut() = Some(result);
            stopper.stop();
        })?;

        let shared = Rc::clone(&self.shared);
        self.local.block_on(&self.runtime, async move {
            loop {
                let outcome = shared
                    .with_calls(shared.session.run(
                        |method, args, responder| {
                            debug!("deferring request '{}'", method);
                            shared
                                .deferred
                                .borrow_mut()
                                .push_request(method, args, responder);
                        },
                        |method, args| {
                            debug!("deferring notification '{}'", method);
                            shared.deferred.borrow_mut().push_notification(method, args);
                        },
                    ))
                    .await;
                if let Some(result) = slot.borrow_mut().take() {
                    return result;
                }
                // Stopped by something other than our response; keep waiting.
                outcome?;
            }
        })
    }

    /// Send a notification. Flushed immediately when no loop is active.
    pub fn post(&self, method: &str, args: Vec<Value>) -> Result<(), SessionError> {
        self.shared.session.post(method, args)?;
        self.flush()
    }

    /// Write any queued outbound messages (such as replies sent through a
    /// `Responder` obtained from `next_message`).
    pub fn flush(&self) -> Result<(), SessionError> {
        if self.shared.state.get() != LoopState::Idle {
            // The active loop flushes on its own.
            return Ok(());
        }
        self.local
            .block_on(&self.runtime, self.shared.session.flush())
    }

    /// Serve inbound traffic until `stop()` or a fatal error.
    ///
    /// Buffered messages are dispatched first, oldest first. Each message runs
    /// in its own task: `on_request` returns the result to send back,
    /// `on_notification` returns nothing. Handler failures and panics are
    /// reported to the error handler; a failed request still gets exactly one
    /// error Response.
    pub fn run<R, RF, N, NF>(&self, on_request: R, on_notification: N) -> Result<(), SessionError>
    where
        R: Fn(Handle, String, Vec<Value>) -> RF + 'static,
        RF: Future<Output = Result<Value, HandlerError>> + 'static,
        N: Fn(Handle, String, Vec<Value>) -> NF + 'static,
        NF: Future<Output = Result<(), HandlerError>> + 'static,
    {
        self.run_inner(boxed_handlers(on_request, on_notification), None)
    }

    /// Like `run`, but start `setup` in a task before anything else.
    ///
    /// Buffered messages are dispatched only once `setup` has finished or
    /// first suspended. If `setup` fails the loop stops and
    /// `SessionError::Setup` is returned; a failure before that point leaves
    /// the buffered messages queued.
    pub fn run_with_setup<R, RF, N, NF, S, SF>(
        &self,
        on_request: R,
        on_notification: N,
        setup: S,
    ) -> Result<(), SessionError>
    where
        R: Fn(Handle, String, Vec<Value>) -> RF + 'static,
        RF: Future<Output = Result<Value, HandlerError>> + 'static,
        N: Fn(Handle, String, Vec<Value>) -> NF + 'static,
        NF: Future<Output = Result<(), HandlerError>> + 'static,
        S: FnOnce(Handle) -> SF + 'static,
        SF: Future<Output = Result<(), HandlerError>> + 'static,
    {
        let setup: SetupCallback = Box::new(move |handle| setup(handle).boxed_local());
        self.run_inner(boxed_handlers(on_request, on_notification), Some(setup))
    }

    fn run_inner(&self, handlers: Handlers, setup: Option<SetupCallback>) -> Result<(), SessionError> {
        let _guard = self.enter(LoopState::Running)?;
        let shared = Rc::clone(&self.shared);

        self.local.block_on(&self.runtime, async move {
            shared.setup_failure.borrow_mut().take();
            if let Some(setup) = setup {
                shared.spawn_setup(setup);
                // Run setup up to its first suspension point.
                tokio::task::yield_now().await;
                let failed = shared.setup_failure.borrow_mut().take();
                if let Some(err) = failed {
                    // Buffered messages stay queued for the next loop.
                    shared.session.clear_stop();
                    return Err(err);
                }
            }

            loop {
                let next = shared.deferred.borrow_mut().pop();
                match next {
                    Some(message) => shared.dispatch(&handlers, message),
                    None => break,
                }
            }

            let result = shared
                .with_calls(shared.session.run(
                    |method, args, responder| shared.spawn_request(&handlers, method, args, responder),
                    |method, args| shared.spawn_notification(&handlers, method, args),
                ))
                .await;
            if result.is_err() {
                // Let tasks woken by the teardown observe their failed calls.
                tokio::task::yield_now().await;
            }

            let setup_failure = shared.setup_failure.borrow_mut().take();
            match setup_failure {
                Some(err) => Err(err),
                None => result,
            }
        })
    }

    /// Return one inbound request or notification.
    ///
    /// Buffered messages come first. Otherwise blocks until one arrives, or
    /// returns `Ok(None)` if the loop is stopped first (for example through a
    /// `ThreadsafeHandle`).
    pub fn next_message(&self) -> Result<Option<InboundMessage>, SessionError> {
        let _guard = self.enter(LoopState::Running)?;
        if let Some(message) = self.shared.deferred.borrow_mut().pop() {
            return Ok(Some(message));
        }

        let shared = Rc::clone(&self.shared);
        self.local.block_on(&self.runtime, async move {
            let stopper = shared.session.stopper();
            let result = shared
                .with_calls(shared.session.run(
                    |method, args, responder| {
                        shared
                            .deferred
                            .borrow_mut()
                            .push_request(method, args, responder);
                        stopper.stop();
                    },
                    |method, args| {
                        shared.deferred.borrow_mut().push_notification(method, args);
                        stopper.stop();
                    },
                ))
                .await;

            let next = shared.deferred.borrow_mut().pop();
            match (next, result) {
                (Some(message), _) => Ok(Some(message)),
                (None, Ok(())) => Ok(None),
                (None, Err(e)) => Err(e),
            }
        })
    }

    /// Make the active `run` return, or the next one if no loop is running.
    pub fn stop(&self) {
        self.shared.session.stop();
    }

    /// Queue `call` to run on the loop thread during the next loop drive.
    pub fn threadsafe_call<F, Fut>(&self, call: F) -> Result<(), SessionError>
    where
        F: FnOnce(Handle) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        self.threadsafe_handle().call(call)
    }

    /// Close the transport. Pending calls fail with `SessionError::Closed`.
    pub fn close(&self) {
        let session = self.shared.session.clone();
        if self.shared.state.get() == LoopState::Idle {
            self.local.block_on(&self.runtime, session.close());
        } else {
            self.local.spawn_local(async move { session.close().await });
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.session.is_closed()
    }

    /// Number of inbound messages waiting for `run` or `next_message`.
    pub fn deferred_count(&self) -> usize {
        self.shared.deferred.borrow().len()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // block_on panics inside another runtime; let the transport drop instead.
        if tokio::runtime::Handle::try_current().is_err() && !self.is_closed() {
            self.local
                .block_on(&self.runtime, self.shared.session.close());
        }
    }
}

fn build_runtime() -> anyhow::Result<Runtime> {
    use anyhow::Context;

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build session runtime")
}

fn boxed_handlers<R, RF, N, NF>(on_request: R, on_notification: N) -> Handlers
where
    R: Fn(Handle, String, Vec<Value>) -> RF + 'static,
    RF: Future<Output = Result<Value, HandlerError>> + 'static,
    N: Fn(Handle, String, Vec<Value>) -> NF + 'static,
    NF: Future<Output = Result<(), HandlerError>> + 'static,
{
    Handlers {
        request: Rc::new(move |handle, method, args| on_request(handle, method, args).boxed_local()),
        notification: Rc::new(move |handle, method, args| {
            on_notification(handle, method, args).boxed_local()
        }),
    }
}

/// Session API available inside handlers and threadsafe calls.
#[derive(Clone)]
pub struct Handle {
    shared: Rc<Shared>,
}

impl Handle {
    /// Send a request and suspend this task until the response arrives.
    ///
    /// Other inbound traffic keeps being served while waiting.
    pub async fn request(&self, method: &str, args: Vec<Value>) -> Result<Value, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.shared.session.request(method, args, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.unwrap_or(Err(SessionError::Closed))
    }

    /// Queue a notification; the running loop writes it out.
    pub fn post(&self, method: &str, args: Vec<Value>) -> Result<(), SessionError> {
        self.shared.session.post(method, args)
    }

    /// Stop the loop once the current handler yields.
    pub fn stop(&self) {
        self.shared.session.stop();
    }

    /// Close the session from inside the loop.
    pub async fn close(&self) {
        self.shared.session.close().await;
    }

    pub fn threadsafe_handle(&self) -> ThreadsafeHandle {
        ThreadsafeHandle {
            tx: self.shared.calls_tx.clone(),
        }
    }
}

/// Cloneable, `Send` handle that schedules closures on the loop thread.
#[derive(Clone)]
pub struct ThreadsafeHandle {
    tx: mpsc::UnboundedSender<ThreadsafeCall>,
}

impl ThreadsafeHandle {
    /// Run `call` on the loop thread. It wakes a loop blocked on I/O.
    ///
    /// Fails with `SessionError::Closed` once the session is gone.
    pub fn call<F, Fut>(&self, call: F) -> Result<(), SessionError>
    where
        F: FnOnce(Handle) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        let boxed: ThreadsafeCall = Box::new(move |handle| call(handle).boxed_local());
        self.tx.send(boxed).map_err(|_| SessionError::Closed)
    }

    /// Stop the loop from another thread.
    pub fn stop(&self) -> Result<(), SessionError> {
        self.call(|handle| async move {
            handle.stop();
            anyhow::Ok(())
        })
    }
}

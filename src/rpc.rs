//! Msgpack-RPC session layer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   blocking API    ┌──────────────┐   callbacks   ┌──────────────┐
//! │   Session    │ ────────────────► │ AsyncSession │ ────────────► │  Transport   │
//! │ (LocalSet)   │ ◄──────────────── │ (run loop)   │ ◄──────────── │ (bytes)      │
//! └──────────────┘  tasks, deferred  └──────────────┘  msgpack codec └──────────────┘
//! ```
//!
//! # Protocol
//!
//! Every message is one msgpack array, concatenated on the stream with no
//! extra framing:
//!
//! ```text
//! [0, id, method, args]        request
//! [1, id, error, result]       response
//! [2, method, args]            notification
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use editor_rpc::rpc::Session;
//!
//! let session = Session::connect(&TransportKind::Child(argv), SessionConfig::default())?;
//! let result = session.request("nvim_eval", vec![Value::from("1 + 1")])?;
//! ```

pub mod async_session;
pub mod codec;
mod queue;
mod session;

pub use async_session::{AsyncSession, Completion, Stopper};
pub use codec::{read_message, write_message, Message, MessageDecoder};
pub use queue::{DeferredQueue, InboundMessage, Responder};
pub use session::{Handle, LoopState, Session, ThreadsafeCall, ThreadsafeHandle};

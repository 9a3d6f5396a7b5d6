//! editor-rpc library
//!
//! A blocking msgpack-RPC client for talking to an editor process and serving
//! the requests and notifications it sends back:
//!
//! - `rpc` - wire codec, async session loop and the synchronous `Session`
//! - `transport` - TCP, UNIX socket, stdio and child-process connections
//! - `models` - client info announced to the editor
//! - `logging` - environment-driven tracing setup
//!
//! ```ignore
//! use editor_rpc::{attach, TransportKind};
//! use rmpv::Value;
//!
//! let session = attach(&TransportKind::from_address("127.0.0.1:6666"))?;
//! let answer = session.request("nvim_eval", vec![Value::from("40 + 2")])?;
//! ```

pub mod attach;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod rpc;
pub mod transport;

pub use attach::{attach, attach_from_env, attach_with_config};
pub use config::SessionConfig;
pub use error::{DispatchError, DispatchKind, HandlerError, RemoteError, SessionError};
pub use rpc::{Handle, InboundMessage, Responder, Session, ThreadsafeHandle};
pub use transport::{Transport, TransportKind};

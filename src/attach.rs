//! One-call connection helpers.
//!
//! ```ignore
//! use editor_rpc::{attach, TransportKind};
//!
//! let session = attach(&TransportKind::from_address("/run/user/1000/editor.sock"))?;
//! let session = attach_from_env()?;
//! ```

use anyhow::{Context, Result};

use crate::config::SessionConfig;
use crate::models::{ClientInfo, ClientType};
use crate::rpc::Session;
use crate::transport::{TransportKind, ADDRESS_ENV};

/// Connect to an editor and announce this process as a remote client.
pub fn attach(kind: &TransportKind) -> Result<Session> {
    let config = SessionConfig::default()
        .with_client_info(ClientInfo::for_kind("client", ClientType::Remote));
    attach_with_config(kind, config)
}

/// Connect with an explicit configuration.
pub fn attach_with_config(kind: &TransportKind, config: SessionConfig) -> Result<Session> {
    Session::connect(kind, config)
}

/// Connect to the address in `EDITOR_RPC_ADDRESS`.
pub fn attach_from_env() -> Result<Session> {
    let kind = TransportKind::from_env()
        .with_context(|| format!("{} is not set", ADDRESS_ENV))?;
    attach(&kind)
}

//! Session configuration.

use std::fmt;
use std::rc::Rc;

use crate::error::DispatchError;
use crate::models::ClientInfo;
use crate::rpc::codec::MAX_MESSAGE_SIZE;

/// Default size of the transport read buffer (64KB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Callback receiving handler failures that were recovered by the session.
pub type ErrorHandler = Rc<dyn Fn(&DispatchError)>;

/// Tunables for a `Session`.
///
/// ```ignore
/// let config = SessionConfig::default()
///     .with_signal_handling(true)
///     .with_error_handler(|err| eprintln!("{}", err));
/// ```
#[derive(Clone)]
pub struct SessionConfig {
    /// Bytes requested per transport read.
    pub read_buffer_size: usize,
    /// Largest single message accepted before the stream is treated as corrupt.
    pub max_message_size: usize,
    /// Stop the loop on Ctrl-C (ignored on the stdio transport).
    pub handle_signals: bool,
    /// Announced to the peer right after connecting, if set.
    pub client_info: Option<ClientInfo>,
    pub(crate) error_handler: Option<ErrorHandler>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_message_size: MAX_MESSAGE_SIZE,
            handle_signals: false,
            client_info: None,
            error_handler: None,
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("read_buffer_size", &self.read_buffer_size)
            .field("max_message_size", &self.max_message_size)
            .field("handle_signals", &self.handle_signals)
            .field("client_info", &self.client_info)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

impl SessionConfig {
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub fn with_client_info(mut self, info: ClientInfo) -> Self {
        self.client_info = Some(info);
        self
    }

    /// Install the callback that receives recovered handler failures.
    ///
    /// Failures are always logged with `tracing::warn!` as well.
    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&DispatchError) + 'static,
    {
        self.error_handler = Some(Rc::new(handler));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.read_buffer_size, 64 * 1024);
        assert_eq!(config.max_message_size, 100 * 1024 * 1024);
        assert!(!config.handle_signals);
        assert!(config.client_info.is_none());
        assert!(config.error_handler.is_none());
    }

    #[test]
    fn test_builder_methods() {
        let config = SessionConfig::default()
            .with_read_buffer_size(1024)
            .with_max_message_size(4096)
            .with_signal_handling(true)
            .with_error_handler(|_| {});
        assert_eq!(config.read_buffer_size, 1024);
        assert_eq!(config.max_message_size, 4096);
        assert!(config.handle_signals);
        assert!(config.error_handler.is_some());
        assert!(format!("{:?}", config).contains("error_handler: true"));
    }
}

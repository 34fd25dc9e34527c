//! Keyfort RPC surface
//!
//! The message-passing front door of the service: request/response
//! envelopes, per-method validators, the dispatcher that gates and routes
//! every call, and the internal protocol for asking the foreground context
//! for credentials, subscriptions and test notifications.

pub mod dispatch;
pub mod envelope;
pub mod transport;
pub mod validate;

pub use dispatch::Dispatcher;
pub use envelope::{InternalMessage, RpcErrorBody, RpcRequest, RpcResponse};
pub use transport::{HostTransport, MessageTransport};

//! Server side of the BrowserChannel protocol: a long-lived bidirectional
//! message channel for browsers, layered over plain HTTP/1.1. Clients push
//! maps over short forward-channel POSTs; the server streams arrays back
//! over a single long-lived back-channel response per session.
//!
//! Embedders build a [`ChannelServer`] around a channel handler, mount
//! [`ChannelServer::router`] into their axum app, and talk to clients
//! through [`Channel::send_array`] and [`Channel::recv_map`].

mod backchannel;
mod channel;
mod config;
mod cors;
mod error;
mod handler;
mod queue;
mod registry;
mod session;
mod wire;

pub use channel::{Channel, StateSnapshot};
pub use config::{ChannelTimeouts, ServerConfig, DEFAULT_BIND_PATH, DEFAULT_TEST_PATH};
pub use cors::CrossDomainInfo;
pub use error::{ChannelError, ChannelResult, RequestError};
pub use handler::ChannelServer;
pub use session::SessionId;
pub use wire::Map;

/// The protocol version this library speaks.
pub const SUPPORTED_PROTOCOL_VERSION: u32 = 8;

//! Connection abstraction for the transfer session.
//!
//! A connection is one ordered, bidirectional stream of text frames, split
//! into a sink (owned by the dispatcher's send path) and a source (owned by
//! the dispatcher's reader task).

use async_trait::async_trait;
use url::Url;

use crate::config::Auth;
use crate::error::ConnectionError;

pub mod memory;
pub mod websocket;

pub use memory::{MemoryConnector, MemoryPeer};
pub use websocket::WebSocketConnector;

/// Outbound half of a connection
#[async_trait]
pub trait FrameSink: Send {
    /// Send one text frame. Frames are delivered in call order.
    async fn send_frame(&mut self, frame: String) -> Result<(), ConnectionError>;

    /// Start a graceful close. The source ends once the peer acknowledges.
    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// Inbound half of a connection
#[async_trait]
pub trait FrameSource: Send {
    /// Next text frame, or `None` once the connection has closed cleanly.
    async fn next_frame(&mut self) -> Option<Result<String, ConnectionError>>;
}

/// An open connection to the destination
pub struct Connection {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

impl Connection {
    pub fn new(sink: impl FrameSink + 'static, source: impl FrameSource + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }
}

/// Opens connections to a transfer address
#[async_trait]
pub trait Connector: Send + Sync {
    /// Resolves once the connection is open and ready for frames.
    async fn connect(&self, address: &Url, auth: Option<&Auth>)
        -> Result<Connection, ConnectionError>;
}

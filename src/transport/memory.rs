//! In-memory connections for tests and in-process use.
//!
//! `pair()` returns the client half as a regular `Connection` and the server
//! half as a `MemoryPeer` that reads decoded client messages, replies, and
//! can inject transport faults.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{mpsc, Mutex};
use url::Url;

use super::{Connection, Connector, FrameSink, FrameSource};
use crate::config::Auth;
use crate::error::ConnectionError;

/// Create a connected client/peer pair
pub fn pair() -> (Connection, MemoryPeer) {
    let (client_tx, peer_rx) = mpsc::unbounded_channel();
    let (peer_tx, client_rx) = mpsc::unbounded_channel();

    let connection = Connection::new(
        MemorySink {
            tx: Some(client_tx),
        },
        MemorySource { rx: client_rx },
    );
    let peer = MemoryPeer {
        rx: peer_rx,
        tx: Some(peer_tx),
    };
    (connection, peer)
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_frame(&mut self, frame: String) -> Result<(), ConnectionError> {
        let tx = self.tx.as_ref().ok_or(ConnectionError::Closed)?;
        tx.send(frame).map_err(|_| ConnectionError::Closed)
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.tx.take();
        Ok(())
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<Result<String, ConnectionError>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next_frame(&mut self) -> Option<Result<String, ConnectionError>> {
        self.rx.recv().await
    }
}

/// Server side of an in-memory connection
pub struct MemoryPeer {
    rx: mpsc::UnboundedReceiver<String>,
    tx: Option<mpsc::UnboundedSender<Result<String, ConnectionError>>>,
}

impl MemoryPeer {
    /// Next client message, decoded. `None` once the client closed its sink.
    pub async fn recv(&mut self) -> Option<Value> {
        let frame = self.rx.recv().await?;
        Some(serde_json::from_str(&frame).unwrap_or(Value::String(frame)))
    }

    /// Answer `request` with a successful payload
    pub fn reply(&self, request: &Value, data: Value) {
        self.send_raw(json!({ "uuid": request["uuid"], "data": data }).to_string());
    }

    /// Answer `request` with a server-reported failure
    pub fn reply_error(&self, request: &Value, error: Value) {
        self.send_raw(json!({ "uuid": request["uuid"], "error": error }).to_string());
    }

    pub fn send_raw(&self, frame: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Ok(frame.into()));
        }
    }

    /// Deliver a transport fault to the client, then drop the connection
    pub fn fail(&mut self, error: ConnectionError) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(error));
        }
    }

    /// Close the server side; the client's source ends cleanly
    pub fn close(&mut self) {
        self.tx.take();
    }
}

/// Connector that hands out pre-built connections in order
#[derive(Default)]
pub struct MemoryConnector {
    connections: Mutex<VecDeque<Connection>>,
    attempts: AtomicUsize,
    requests: Mutex<Vec<(Url, Option<String>)>>,
}

impl MemoryConnector {
    pub fn new(connections: impl IntoIterator<Item = Connection>) -> Self {
        Self {
            connections: Mutex::new(connections.into_iter().collect()),
            attempts: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Number of times `connect` was called
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Address and authorization header of every connect attempt
    pub async fn requests(&self) -> Vec<(Url, Option<String>)> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        address: &Url,
        auth: Option<&Auth>,
    ) -> Result<Connection, ConnectionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .await
            .push((address.clone(), auth.map(Auth::authorization_header)));

        self.connections
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| ConnectionError::Transport("connection refused".to_string()))
    }
}

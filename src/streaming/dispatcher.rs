//! Request/response correlation over the session connection.
//!
//! Every outgoing message gets a fresh uuid and a pending entry holding a
//! oneshot sender. A single reader task routes responses back by uuid. When
//! the connection faults or ends, every pending request fails with the same
//! error and later dispatches fail immediately.

use serde::Serialize;
use serde_json::value::{to_raw_value, RawValue};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{ConnectionError, ProviderError, Result};
use crate::streaming::protocol::{
    ClientMessage, Command, ServerMessage, Step, StepAction, TransferAction, TransferKind,
    TransferMessageKind,
};
use crate::transport::{Connection, FrameSink, FrameSource};

/// How long `shutdown` waits for the peer to finish the close handshake
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Session identity bound after a successful `init`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProperties {
    pub id: String,
    pub kind: TransferKind,
}

struct PendingRequest {
    label: String,
    tx: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
struct PendingTable {
    requests: HashMap<Uuid, PendingRequest>,
    /// Set once the connection is gone
    closed: Option<ConnectionError>,
}

impl PendingTable {
    fn fail_all(&mut self, error: &ConnectionError) {
        self.closed.get_or_insert_with(|| error.clone());
        let drained: Vec<_> = self.requests.drain().collect();
        if !drained.is_empty() {
            tracing::warn!(
                count = drained.len(),
                error = %error,
                "Failing pending requests"
            );
        }
        for (uuid, request) in drained {
            tracing::debug!(%uuid, request = %request.label, "Request failed by connection fault");
            let _ = request.tx.send(Err(error.clone().into()));
        }
    }
}

fn lock_table(table: &Mutex<PendingTable>) -> MutexGuard<'_, PendingTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a request's pending entry when its dispatch future goes away,
/// whether it was answered, failed, or dropped mid-flight.
struct PendingEntry<'a> {
    table: &'a Mutex<PendingTable>,
    uuid: Uuid,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        if lock_table(self.table).requests.remove(&self.uuid).is_some() {
            tracing::debug!(uuid = %self.uuid, "Request abandoned before its response");
        }
    }
}

pub struct Dispatcher {
    sink: AsyncMutex<Box<dyn FrameSink>>,
    pending: Arc<Mutex<PendingTable>>,
    properties: OnceLock<TransferProperties>,
    reader: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Take ownership of an open connection and start the reader task.
    pub fn spawn(connection: Connection) -> Arc<Self> {
        let Connection { sink, source } = connection;
        let pending = Arc::new(Mutex::new(PendingTable::default()));
        let reader = tokio::spawn(read_loop(source, pending.clone()));

        Arc::new(Self {
            sink: AsyncMutex::new(sink),
            pending,
            properties: OnceLock::new(),
            reader: AsyncMutex::new(Some(reader)),
        })
    }

    /// Bind the session identity. Callable once.
    pub fn set_transfer_properties(&self, properties: TransferProperties) -> Result<()> {
        tracing::debug!(transfer_id = %properties.id, kind = ?properties.kind, "Binding transfer properties");
        self.properties
            .set(properties)
            .map_err(|_| ProviderError::InvalidSequence("transfer properties are already bound"))
    }

    pub fn transfer_properties(&self) -> Option<&TransferProperties> {
        self.properties.get()
    }

    /// Number of requests still waiting on a response
    pub fn pending_requests(&self) -> usize {
        lock_table(&self.pending).requests.len()
    }

    /// Send a session-level command (`init`, `end`)
    pub async fn dispatch_command(&self, command: &Command) -> Result<Value> {
        let label = format!("command {}", command.name());
        self.dispatch(label, |uuid| ClientMessage::Command {
            uuid,
            command: command.name(),
            params: command,
        })
        .await
    }

    /// Send a session-scoped action annotated with the bound transfer id
    pub async fn dispatch_transfer_action(&self, action: TransferAction) -> Result<Value> {
        let properties = self.bound_properties()?;
        let label = format!("action {}", action.as_str());
        self.dispatch(label, |uuid| ClientMessage::Transfer {
            uuid,
            kind: TransferMessageKind::Action,
            transfer_id: &properties.id,
            action: action.as_str(),
            step: None,
            data: None,
        })
        .await
    }

    /// Send a step lifecycle event. Step ordering is the caller's job; this
    /// only guarantees frames leave in call order.
    pub async fn dispatch_transfer_step<D>(
        &self,
        step: Step,
        action: StepAction,
        data: Option<&D>,
    ) -> Result<Value>
    where
        D: Serialize + ?Sized,
    {
        let properties = self.bound_properties()?;
        let data: Option<Box<RawValue>> = data.map(to_raw_value).transpose()?;
        let label = format!("step {}:{}", step, action.as_str());
        self.dispatch(label, |uuid| ClientMessage::Transfer {
            uuid,
            kind: TransferMessageKind::Step,
            transfer_id: &properties.id,
            action: action.as_str(),
            step: Some(step),
            data: data.as_deref(),
        })
        .await
    }

    /// Close the connection and wait for the reader task to see it end.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut sink = self.sink.lock().await;
            match sink.close().await {
                Ok(()) | Err(ConnectionError::Closed) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let Some(mut reader) = self.reader.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(CLOSE_TIMEOUT, &mut reader).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ProviderError::Protocol(format!("Reader task failed: {}", e))),
            Err(_) => {
                tracing::warn!("Peer did not finish closing in time, dropping connection");
                reader.abort();
                lock_table(&self.pending).fail_all(&ConnectionError::Closed);
                Ok(())
            }
        }
    }

    /// Drop the connection without waiting for the peer. Pending requests
    /// fail with `ConnectionError::Closed`.
    pub async fn abort(&self) {
        if let Err(e) = self.sink.lock().await.close().await {
            tracing::debug!(error = %e, "Ignoring close error while aborting");
        }
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        lock_table(&self.pending).fail_all(&ConnectionError::Closed);
    }

    fn bound_properties(&self) -> Result<&TransferProperties> {
        self.properties.get().ok_or(ProviderError::InvalidSequence(
            "transfer properties must be bound before dispatching transfer messages",
        ))
    }

    async fn dispatch<'a, F>(&self, label: String, build: F) -> Result<Value>
    where
        F: FnOnce(Uuid) -> ClientMessage<'a>,
    {
        let uuid = Uuid::new_v4();
        let frame = serde_json::to_string(&build(uuid))?;
        let (tx, rx) = oneshot::channel();

        {
            let mut table = lock_table(&self.pending);
            if let Some(error) = &table.closed {
                return Err(error.clone().into());
            }
            table.requests.insert(
                uuid,
                PendingRequest {
                    label: label.clone(),
                    tx,
                },
            );
        }

        let _entry = PendingEntry {
            table: &self.pending,
            uuid,
        };
        tracing::debug!(%uuid, request = %label, bytes = frame.len(), "Dispatching");

        self.sink.lock().await.send_frame(frame).await?;

        rx.await.unwrap_or(Err(ConnectionError::Closed.into()))
    }
}

async fn read_loop(mut source: Box<dyn FrameSource>, pending: Arc<Mutex<PendingTable>>) {
    let fault = loop {
        match source.next_frame().await {
            Some(Ok(frame)) => {
                if let Err(error) = route_response(&pending, &frame) {
                    break error;
                }
            }
            Some(Err(error)) => break error,
            None => break ConnectionError::Closed,
        }
    };

    tracing::debug!(reason = %fault, "Connection reader stopped");
    lock_table(&pending).fail_all(&fault);
}

fn route_response(
    pending: &Mutex<PendingTable>,
    frame: &str,
) -> std::result::Result<(), ConnectionError> {
    let message =
        ServerMessage::decode(frame).map_err(|e| ConnectionError::Malformed(e.to_string()))?;

    let Some(uuid) = message.uuid else {
        tracing::warn!("Discarding response without correlation id");
        return Ok(());
    };

    let Some(request) = lock_table(pending).requests.remove(&uuid) else {
        tracing::warn!(%uuid, "Discarding response with no matching pending request");
        return Ok(());
    };

    let result = match &message.error {
        Some(error) if !error.is_null() => {
            let error = ProviderError::from_remote(error);
            tracing::debug!(%uuid, request = %request.label, %error, "Remote reported failure");
            Err(error)
        }
        _ => Ok(message.data),
    };

    let _ = request.tx.send(result);
    Ok(())
}

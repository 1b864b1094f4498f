//! Staged stream writer for the entities, links and configuration steps.
//!
//! Records are pushed one at a time. The first record starts the step, each
//! record joins the in-memory batch, and a full batch is flushed as one
//! `stream` event before `write` returns. That flush is the backpressure
//! point: a caller cannot hand over the next record until it completes.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{ProviderError, Result};
use crate::streaming::batch::RecordBatch;
use crate::streaming::dispatcher::Dispatcher;
use crate::streaming::protocol::{Step, StepAction};

/// Start/end bookkeeping for one step of the session.
///
/// Clones share state, so every writer of a step sends `start` at most once
/// and concurrent first writes await the same in-flight start. The start runs
/// on its own task, so a caller that gives up waiting does not cancel it.
#[derive(Clone)]
pub struct StepGuard {
    step: Step,
    started: Arc<Mutex<Option<StartOutcome>>>,
    ended: Arc<AtomicBool>,
}

type StartOutcome = Shared<BoxFuture<'static, Result<()>>>;

impl fmt::Debug for StepGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepGuard")
            .field("step", &self.step)
            .field("started", &self.is_started())
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl StepGuard {
    pub fn new(step: Step) -> Self {
        Self {
            step,
            started: Arc::new(Mutex::new(None)),
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn step(&self) -> Step {
        self.step
    }

    /// Send `start` for this step unless it was already sent. Every caller
    /// sees the outcome of the single attempt.
    pub async fn start(&self, dispatcher: &Arc<Dispatcher>) -> Result<()> {
        let outcome = self
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(|| self.spawn_start(dispatcher.clone()))
            .clone();
        outcome.await
    }

    fn spawn_start(&self, dispatcher: Arc<Dispatcher>) -> StartOutcome {
        let step = self.step;
        tracing::debug!(%step, "Starting step");
        let task = tokio::spawn(async move {
            dispatcher
                .dispatch_transfer_step::<()>(step, StepAction::Start, None)
                .await
                .map(drop)
        });
        async move {
            task.await.unwrap_or_else(|e| {
                Err(ProviderError::Protocol(format!(
                    "{} start task failed: {}",
                    step, e
                )))
            })
        }
        .boxed()
        .shared()
    }

    /// The `start` of this step has been answered
    pub fn is_started(&self) -> bool {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|outcome| outcome.peek().is_some())
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Claim the single `end` of this step
    pub fn mark_ended(&self) -> Result<()> {
        if self.ended.swap(true, Ordering::SeqCst) {
            return Err(ProviderError::InvalidSequence("step has already ended"));
        }
        Ok(())
    }
}

/// One guard per step, owned by the session
#[derive(Debug, Clone)]
pub struct SessionSteps {
    entities: StepGuard,
    links: StepGuard,
    configuration: StepGuard,
    assets: StepGuard,
}

impl Default for SessionSteps {
    fn default() -> Self {
        Self {
            entities: StepGuard::new(Step::Entities),
            links: StepGuard::new(Step::Links),
            configuration: StepGuard::new(Step::Configuration),
            assets: StepGuard::new(Step::Assets),
        }
    }
}

impl SessionSteps {
    pub fn guard(&self, step: Step) -> StepGuard {
        match step {
            Step::Entities => self.entities.clone(),
            Step::Links => self.links.clone(),
            Step::Configuration => self.configuration.clone(),
            Step::Assets => self.assets.clone(),
        }
    }
}

/// Batched writer for a record step. Consumed by `finish`, which sends `end`.
pub struct StepWriter<T = serde_json::Value> {
    dispatcher: Arc<Dispatcher>,
    guard: StepGuard,
    batch: RecordBatch,
    records_written: u64,
    failed: Option<ProviderError>,
    _record: PhantomData<fn(&T)>,
}

impl<T: Serialize> StepWriter<T> {
    pub fn new(dispatcher: Arc<Dispatcher>, guard: StepGuard, batch_size: usize) -> Self {
        debug_assert!(guard.step() != Step::Assets, "assets use AssetWriter");
        Self {
            dispatcher,
            guard,
            batch: RecordBatch::new(batch_size),
            records_written: 0,
            failed: None,
            _record: PhantomData,
        }
    }

    pub fn step(&self) -> Step {
        self.guard.step()
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Accept one record. If it fills the batch, the batch is flushed before
    /// this returns.
    pub async fn write(&mut self, record: &T) -> Result<()> {
        self.ensure_writable()?;

        if let Err(e) = self.guard.start(&self.dispatcher).await {
            return Err(self.abort(e));
        }

        let full = match self.batch.push(record) {
            Ok(full) => full,
            Err(e) => return Err(self.abort(e)),
        };
        self.records_written += 1;

        if full {
            if let Err(e) = self.flush().await {
                return Err(self.abort(e));
            }
        }
        Ok(())
    }

    /// Flush what is left and end the step. Returns the number of records
    /// written.
    pub async fn finish(mut self) -> Result<u64> {
        self.ensure_writable()?;

        if !self.batch.is_empty() {
            self.flush().await?;
        }

        // An empty step still opens before it closes
        self.guard.start(&self.dispatcher).await?;
        self.guard.mark_ended()?;

        tracing::debug!(
            step = %self.step(),
            records = self.records_written,
            "Ending step"
        );
        self.dispatcher
            .dispatch_transfer_step::<()>(self.step(), StepAction::End, None)
            .await?;
        Ok(self.records_written)
    }

    async fn flush(&mut self) -> Result<()> {
        let json_len = self.batch.json_len();
        let records = self.batch.take();
        tracing::debug!(
            step = %self.step(),
            records = records.len(),
            bytes = json_len,
            "Flushing batch"
        );
        self.dispatcher
            .dispatch_transfer_step(self.step(), StepAction::Stream, Some(&records))
            .await
            .map(drop)
    }

    fn ensure_writable(&self) -> Result<()> {
        if let Some(e) = &self.failed {
            return Err(e.clone());
        }
        if self.guard.is_ended() {
            return Err(ProviderError::InvalidSequence("step has already ended"));
        }
        Ok(())
    }

    fn abort(&mut self, error: ProviderError) -> ProviderError {
        tracing::warn!(step = %self.step(), %error, "Step writer aborted");
        self.failed = Some(error.clone());
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::dispatcher::TransferProperties;
    use crate::streaming::protocol::TransferKind;
    use crate::transport::{memory, MemoryPeer};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::time::timeout;

    fn session() -> (Arc<Dispatcher>, MemoryPeer) {
        let (connection, peer) = memory::pair();
        let dispatcher = Dispatcher::spawn(connection);
        dispatcher
            .set_transfer_properties(TransferProperties {
                id: "t-1".to_string(),
                kind: TransferKind::Push,
            })
            .unwrap();
        (dispatcher, peer)
    }

    /// Acknowledge every message and hand back what was received
    fn ack_all(mut peer: MemoryPeer) -> tokio::task::JoinHandle<Vec<Value>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(request) = peer.recv().await {
                peer.reply(&request, Value::Null);
                seen.push(request);
            }
            seen
        })
    }

    fn events(seen: &[Value]) -> Vec<(String, String)> {
        seen.iter()
            .map(|m| {
                (
                    m["step"].as_str().unwrap_or_default().to_string(),
                    m["action"].as_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_records_flow_start_stream_end() {
        let (dispatcher, peer) = session();
        let server = ack_all(peer);

        // Each record is 8 bytes ({"n":10}); two of them serialize to 19
        let mut writer: StepWriter =
            StepWriter::new(dispatcher.clone(), StepGuard::new(Step::Entities), 19);
        for n in 10..15 {
            writer.write(&json!({ "n": n })).await.unwrap();
        }
        assert_eq!(writer.records_written(), 5);
        assert_eq!(writer.finish().await.unwrap(), 5);

        dispatcher.shutdown().await.unwrap();
        let seen = server.await.unwrap();

        let pairs: Vec<_> = events(&seen)
            .into_iter()
            .map(|(s, a)| format!("{}:{}", s, a))
            .collect();
        assert_eq!(
            pairs,
            [
                "entities:start",
                "entities:stream",
                "entities:stream",
                "entities:stream",
                "entities:end"
            ]
        );

        let replayed: Vec<Value> = seen
            .iter()
            .filter(|m| m["action"] == "stream")
            .flat_map(|m| m["data"].as_array().unwrap().clone())
            .collect();
        let expected: Vec<Value> = (10..15).map(|n| json!({ "n": n })).collect();
        assert_eq!(replayed, expected);
        assert_eq!(seen[1]["data"].as_array().unwrap().len(), 2);
        assert_eq!(seen[3]["data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_start_sent_once_across_writers() {
        let (dispatcher, peer) = session();
        let server = ack_all(peer);

        let guard = StepGuard::new(Step::Links);
        let mut a: StepWriter = StepWriter::new(dispatcher.clone(), guard.clone(), usize::MAX);
        let mut b: StepWriter = StepWriter::new(dispatcher.clone(), guard.clone(), usize::MAX);

        let record = json!({ "left": 1, "right": 2 });
        let (ra, rb) = tokio::join!(a.write(&record), b.write(&record));
        ra.unwrap();
        rb.unwrap();
        a.write(&record).await.unwrap();
        assert!(guard.is_started());

        dispatcher.shutdown().await.unwrap();
        let seen = server.await.unwrap();
        let starts = seen.iter().filter(|m| m["action"] == "start").count();
        assert_eq!(starts, 1);
    }

    #[tokio::test]
    async fn test_empty_step_still_starts_before_end() {
        let (dispatcher, peer) = session();
        let server = ack_all(peer);

        let writer: StepWriter =
            StepWriter::new(dispatcher.clone(), StepGuard::new(Step::Configuration), 64);
        assert_eq!(writer.finish().await.unwrap(), 0);

        dispatcher.shutdown().await.unwrap();
        let seen = server.await.unwrap();
        assert_eq!(
            events(&seen),
            [
                ("configuration".to_string(), "start".to_string()),
                ("configuration".to_string(), "end".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_start_failure_aborts_writer() {
        let (dispatcher, mut peer) = session();
        let server = tokio::spawn(async move {
            let start = peer.recv().await.unwrap();
            peer.reply_error(&start, json!("entities are locked"));
            peer
        });

        let mut writer: StepWriter =
            StepWriter::new(dispatcher.clone(), StepGuard::new(Step::Entities), 64);
        let expected = ProviderError::Transfer("entities are locked".to_string());
        assert_eq!(writer.write(&json!(1)).await.unwrap_err(), expected);
        // The writer stays failed; nothing else goes out
        assert_eq!(writer.write(&json!(2)).await.unwrap_err(), expected);
        assert_eq!(writer.finish().await.unwrap_err(), expected);
        assert_eq!(dispatcher.pending_requests(), 0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_failure_is_reported() {
        let (dispatcher, mut peer) = session();
        let server = tokio::spawn(async move {
            let start = peer.recv().await.unwrap();
            peer.reply(&start, Value::Null);
            let stream = peer.recv().await.unwrap();
            peer.reply_error(&stream, json!({ "message": "invalid entity" }));
            peer
        });

        let mut writer: StepWriter =
            StepWriter::new(dispatcher.clone(), StepGuard::new(Step::Entities), 1);
        let err = writer.write(&json!({ "id": 1 })).await.unwrap_err();
        assert_eq!(err, ProviderError::Transfer("invalid entity".to_string()));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_step_cannot_end_twice() {
        let (dispatcher, peer) = session();
        let server = ack_all(peer);

        let guard = StepGuard::new(Step::Links);
        let first: StepWriter = StepWriter::new(dispatcher.clone(), guard.clone(), 64);
        let mut second: StepWriter = StepWriter::new(dispatcher.clone(), guard.clone(), 64);
        first.finish().await.unwrap();

        let err = second.write(&json!(1)).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidSequence(_)));
        assert!(second.finish().await.is_err());

        dispatcher.shutdown().await.unwrap();
        let seen = server.await.unwrap();
        assert_eq!(seen.iter().filter(|m| m["action"] == "end").count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_first_write_starts_once() {
        let (dispatcher, mut peer) = session();

        let guard = StepGuard::new(Step::Entities);
        let mut a: StepWriter = StepWriter::new(dispatcher.clone(), guard.clone(), usize::MAX);
        let mut b: StepWriter = StepWriter::new(dispatcher.clone(), guard.clone(), usize::MAX);

        // The peer holds the start unanswered while the first writer gives up
        let cancelled = timeout(Duration::from_millis(20), a.write(&json!(1))).await;
        assert!(cancelled.is_err());
        assert!(!guard.is_started());

        let start = peer.recv().await.unwrap();
        assert_eq!(start["action"], "start");
        let server = tokio::spawn(async move {
            peer.reply(&start, Value::Null);
            let mut seen = vec![start];
            seen.extend(ack_all(peer).await.unwrap());
            seen
        });

        b.write(&json!(2)).await.unwrap();
        assert!(guard.is_started());
        assert_eq!(b.finish().await.unwrap(), 1);

        dispatcher.shutdown().await.unwrap();
        let seen = server.await.unwrap();
        assert_eq!(seen.iter().filter(|m| m["action"] == "start").count(), 1);
        assert_eq!(
            events(&seen),
            [
                ("entities".to_string(), "start".to_string()),
                ("entities".to_string(), "stream".to_string()),
                ("entities".to_string(), "end".to_string())
            ]
        );
    }

    #[test]
    fn test_session_steps_share_guards() {
        let steps = SessionSteps::default();
        let a = steps.guard(Step::Entities);
        let b = steps.guard(Step::Entities);
        a.mark_ended().unwrap();
        assert!(b.is_ended());
        assert!(!steps.guard(Step::Links).is_ended());
    }
}

//! Asset stream writer.
//!
//! Each asset becomes a sub-stream inside the single `assets` step:
//! `start` (filename, path, stats), one `stream` per chunk read from the
//! asset's byte source, then `end`. Sub-events are batched by raw chunk
//! bytes. Finishing sends a `null` stream event and the step `end`, but only
//! if an asset was ever written; an empty assets step sends nothing at all.

use bytes::Bytes;
use std::fmt;
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::error::{ProviderError, Result};
use crate::streaming::batch::AssetBatch;
use crate::streaming::dispatcher::Dispatcher;
use crate::streaming::protocol::{AssetEvent, AssetStart, AssetStats, StepAction, ASSET_CHUNK_SIZE};
use crate::streaming::writer::StepGuard;

/// A binary file to transfer
pub struct Asset {
    pub filename: String,
    pub filepath: String,
    pub stats: AssetStats,
    pub stream: Box<dyn AsyncRead + Send + Unpin>,
}

impl Asset {
    pub fn new(
        filename: impl Into<String>,
        filepath: impl Into<String>,
        stats: AssetStats,
        stream: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            filename: filename.into(),
            filepath: filepath.into(),
            stats,
            stream: Box::new(stream),
        }
    }

    /// Asset backed by an in-memory buffer
    pub fn from_bytes(
        filename: impl Into<String>,
        filepath: impl Into<String>,
        bytes: impl Into<Bytes>,
    ) -> Self {
        let bytes = bytes.into();
        let stats = AssetStats {
            size: bytes.len() as u64,
            mtime_ms: None,
        };
        Self::new(filename, filepath, stats, std::io::Cursor::new(bytes))
    }

    /// Asset backed by `root/relative` on disk. `filepath` is the relative
    /// path with `/` separators.
    pub async fn from_path(root: &Path, relative: &Path) -> std::io::Result<Self> {
        let full = root.join(relative);
        let file = tokio::fs::File::open(&full).await?;
        let metadata = file.metadata().await?;

        let mtime_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64);

        let filename = relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let filepath = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");

        Ok(Self::new(
            filename,
            filepath,
            AssetStats {
                size: metadata.len(),
                mtime_ms,
            },
            file,
        ))
    }
}

impl fmt::Debug for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Asset")
            .field("filename", &self.filename)
            .field("filepath", &self.filepath)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Writer for the `assets` step. Consumed by `finish`.
pub struct AssetWriter {
    dispatcher: Arc<Dispatcher>,
    guard: StepGuard,
    batch: AssetBatch,
    /// At least one asset was started through this writer
    has_started: bool,
    assets_written: u64,
    failed: Option<ProviderError>,
}

impl AssetWriter {
    pub fn new(dispatcher: Arc<Dispatcher>, guard: StepGuard, batch_size: usize) -> Self {
        Self {
            dispatcher,
            guard,
            batch: AssetBatch::new(batch_size),
            has_started: false,
            assets_written: 0,
            failed: None,
        }
    }

    pub fn assets_written(&self) -> u64 {
        self.assets_written
    }

    /// Stream one asset through the batch. Returns after its `end`
    /// sub-event is queued.
    pub async fn write(&mut self, asset: Asset) -> Result<()> {
        self.ensure_writable()?;

        if let Err(e) = self.guard.start(&self.dispatcher).await {
            return Err(self.abort(e));
        }
        self.has_started = true;

        if let Err(e) = self.write_asset(asset).await {
            return Err(self.abort(e));
        }
        self.assets_written += 1;
        Ok(())
    }

    /// Flush pending sub-events and close the step. Returns the number of
    /// assets written.
    pub async fn finish(mut self) -> Result<u64> {
        self.ensure_writable()?;

        if !self.batch.is_empty() {
            self.flush().await?;
        }

        if self.has_started {
            // No more assets
            self.dispatcher
                .dispatch_transfer_step(
                    self.guard.step(),
                    StepAction::Stream,
                    Some(&serde_json::Value::Null),
                )
                .await?;

            self.guard.mark_ended()?;
            tracing::debug!(assets = self.assets_written, "Ending assets step");
            self.dispatcher
                .dispatch_transfer_step::<()>(self.guard.step(), StepAction::End, None)
                .await?;
        }

        Ok(self.assets_written)
    }

    async fn write_asset(&mut self, asset: Asset) -> Result<()> {
        let Asset {
            filename,
            filepath,
            stats,
            mut stream,
        } = asset;
        let asset_id = Uuid::new_v4();
        tracing::debug!(%asset_id, %filepath, size = stats.size, "Streaming asset");

        let source_error = |e: std::io::Error, filepath: &str| {
            ProviderError::Transfer(format!("Failed to read asset {}: {}", filepath, e))
        };

        self.push(AssetEvent::Start {
            asset_id,
            data: AssetStart {
                filename,
                filepath: filepath.clone(),
                stats,
            },
        })
        .await?;

        let mut buf = vec![0u8; ASSET_CHUNK_SIZE];
        loop {
            let n = stream
                .read(&mut buf)
                .await
                .map_err(|e| source_error(e, &filepath))?;
            if n == 0 {
                break;
            }
            self.push(AssetEvent::Stream {
                asset_id,
                data: Bytes::copy_from_slice(&buf[..n]),
            })
            .await?;
        }

        self.push(AssetEvent::End { asset_id }).await
    }

    async fn push(&mut self, event: AssetEvent) -> Result<()> {
        if self.batch.push(event) {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let bytes = self.batch.data_len();
        let events = self.batch.take();
        tracing::debug!(events = events.len(), bytes, "Flushing asset batch");
        self.dispatcher
            .dispatch_transfer_step(self.guard.step(), StepAction::Stream, Some(&events))
            .await
            .map(drop)
    }

    fn ensure_writable(&self) -> Result<()> {
        if let Some(e) = &self.failed {
            return Err(e.clone());
        }
        if self.guard.is_ended() {
            return Err(ProviderError::InvalidSequence("assets step has already ended"));
        }
        Ok(())
    }

    fn abort(&mut self, error: ProviderError) -> ProviderError {
        tracing::warn!(%error, "Asset writer aborted");
        self.failed = Some(error.clone());
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::dispatcher::TransferProperties;
    use crate::streaming::protocol::{Step, TransferKind};
    use crate::transport::{memory, MemoryPeer};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use tempfile::TempDir;

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

    /// Sub-events of every asset, in the order they went out
    fn sub_events(seen: &[Value]) -> HashMap<String, Vec<Value>> {
        let mut by_asset: HashMap<String, Vec<Value>> = HashMap::new();
        for message in seen.iter().filter(|m| m["action"] == "stream") {
            if let Some(events) = message["data"].as_array() {
                for event in events {
                    by_asset
                        .entry(event["assetID"].as_str().unwrap().to_string())
                        .or_default()
                        .push(event.clone());
                }
            }
        }
        by_asset
    }

    fn buffer_bytes(event: &Value) -> Vec<u8> {
        assert_eq!(event["data"]["type"], "Buffer");
        event["data"]["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b.as_u64().unwrap() as u8)
            .collect()
    }

    #[tokio::test]
    async fn test_assets_sub_stream_order() {
        let (dispatcher, peer) = session();
        let server = ack_all(peer);

        let mut writer = AssetWriter::new(dispatcher.clone(), StepGuard::new(Step::Assets), 4);
        writer
            .write(Asset::from_bytes("a.txt", "a.txt", Bytes::from_static(b"hello world")))
            .await
            .unwrap();
        writer
            .write(Asset::from_bytes("empty.bin", "dir/empty.bin", Bytes::new()))
            .await
            .unwrap();
        assert_eq!(writer.assets_written(), 2);
        assert_eq!(writer.finish().await.unwrap(), 2);

        dispatcher.shutdown().await.unwrap();
        let seen = server.await.unwrap();

        assert_eq!(seen.first().unwrap()["action"], "start");
        assert_eq!(seen.last().unwrap()["action"], "end");
        let terminator = &seen[seen.len() - 2];
        assert_eq!(terminator["action"], "stream");
        assert_eq!(terminator["data"], Value::Null);
        assert!(seen.iter().all(|m| m["step"] == "assets"));

        let by_asset = sub_events(&seen);
        assert_eq!(by_asset.len(), 2);
        for events in by_asset.values() {
            let actions: Vec<_> = events.iter().map(|e| e["action"].as_str().unwrap()).collect();
            assert_eq!(actions.first(), Some(&"start"));
            assert_eq!(actions.last(), Some(&"end"));
            assert!(actions[1..actions.len() - 1].iter().all(|a| *a == "stream"));

            let filename = events[0]["data"]["filename"].as_str().unwrap();
            let body: Vec<u8> = events
                .iter()
                .filter(|e| e["action"] == "stream")
                .flat_map(buffer_bytes)
                .collect();
            match filename {
                "a.txt" => {
                    assert_eq!(body, b"hello world");
                    assert_eq!(events[0]["data"]["stats"], json!({ "size": 11 }));
                }
                "empty.bin" => {
                    // start immediately followed by end
                    assert_eq!(actions, ["start", "end"]);
                    assert_eq!(events[0]["data"]["filepath"], "dir/empty.bin");
                }
                other => panic!("unexpected asset {}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_batches_flush_on_chunk_bytes() {
        let (dispatcher, peer) = session();
        let server = ack_all(peer);

        let mut writer = AssetWriter::new(dispatcher.clone(), StepGuard::new(Step::Assets), 10);
        let payload = vec![7u8; ASSET_CHUNK_SIZE + 5];
        writer
            .write(Asset::from_bytes("big.bin", "big.bin", payload.clone()))
            .await
            .unwrap();
        writer.finish().await.unwrap();

        dispatcher.shutdown().await.unwrap();
        let seen = server.await.unwrap();

        // The full first chunk fills the batch; the 5 byte tail and the end
        // marker go out together when the writer finishes
        let streams: Vec<&Value> = seen
            .iter()
            .filter(|m| m["action"] == "stream" && !m["data"].is_null())
            .collect();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0]["data"][0]["action"], "start");
        assert_eq!(streams[0]["data"][1]["action"], "stream");
        assert_eq!(streams[1]["data"][0]["action"], "stream");
        assert_eq!(streams[1]["data"][1]["action"], "end");

        let body: Vec<u8> = sub_events(&seen)
            .into_values()
            .flatten()
            .filter(|e| e["action"] == "stream")
            .flat_map(|e| buffer_bytes(&e))
            .collect();
        assert_eq!(body, payload);
    }

    #[tokio::test]
    async fn test_no_assets_sends_nothing() {
        let (dispatcher, peer) = session();
        let server = ack_all(peer);

        let writer = AssetWriter::new(dispatcher.clone(), StepGuard::new(Step::Assets), 10);
        assert_eq!(writer.finish().await.unwrap(), 0);

        dispatcher.shutdown().await.unwrap();
        assert!(server.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_asset_from_path() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("uploads/2024")).unwrap();
        std::fs::write(tmp.path().join("uploads/2024/logo.png"), b"\x89PNG").unwrap();

        let mut asset = Asset::from_path(tmp.path(), Path::new("uploads/2024/logo.png"))
            .await
            .unwrap();
        assert_eq!(asset.filename, "logo.png");
        assert_eq!(asset.filepath, "uploads/2024/logo.png");
        assert_eq!(asset.stats.size, 4);
        assert!(asset.stats.mtime_ms.is_some());

        let mut body = Vec::new();
        asset.stream.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"\x89PNG");
    }

    #[tokio::test]
    async fn test_flush_failure_aborts_writer() {
        let (dispatcher, mut peer) = session();
        let server = tokio::spawn(async move {
            let start = peer.recv().await.unwrap();
            peer.reply(&start, Value::Null);
            let stream = peer.recv().await.unwrap();
            peer.reply_error(&stream, json!({ "message": "disk full" }));
            peer
        });

        let mut writer = AssetWriter::new(dispatcher.clone(), StepGuard::new(Step::Assets), 1);
        let err = writer
            .write(Asset::from_bytes("a", "a", Bytes::from_static(b"abc")))
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::Transfer("disk full".to_string()));
        assert_eq!(writer.finish().await.unwrap_err(), err);
        server.await.unwrap();
    }
}

//! Request multiplexing over a single plugin connection
//!
//! Many calls may be in flight at once. Each request carries an id; the
//! reader task routes responses, chunks and errors back to the waiting
//! caller. When the plugin's output closes, every pending call fails with
//! `Unavailable` and the channel reports itself closed.

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use super::frame::{codec, Frame};
use super::handshake::Handshake;
use crate::error::{PluginError, Result};

type FrameWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LengthDelimitedCodec>;
type FrameReader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, LengthDelimitedCodec>;

struct Pending {
    tx: mpsc::UnboundedSender<Result<Value>>,
    streaming: bool,
}

type PendingCalls = Arc<DashMap<u64, Pending>>;

pub struct RpcChannel {
    plugin_id: String,
    writer: Mutex<FrameWriter>,
    pending: PendingCalls,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl RpcChannel {
    /// Waits for the plugin's handshake frame, then starts routing replies.
    pub async fn connect<R, W>(
        plugin_id: &str,
        reader: R,
        writer: W,
        startup_timeout: Duration,
    ) -> Result<(Self, Handshake)>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let boxed_reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        let boxed_writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        let mut frames = FramedRead::new(boxed_reader, codec());

        let first = tokio::time::timeout(startup_timeout, frames.next())
            .await
            .map_err(|_| {
                PluginError::HandshakeFailed(format!(
                    "no handshake within {}ms",
                    startup_timeout.as_millis()
                ))
            })?;

        let bytes = match first {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => return Err(PluginError::HandshakeFailed(e.to_string())),
            None => {
                return Err(PluginError::HandshakeFailed(
                    "plugin closed its output before the handshake".into(),
                ))
            }
        };

        let handshake = match Frame::decode(&bytes) {
            Ok(Frame::Handshake(handshake)) => handshake,
            Ok(other) => {
                return Err(PluginError::HandshakeFailed(format!(
                    "expected handshake, got {other:?}"
                )))
            }
            Err(e) => return Err(PluginError::HandshakeFailed(e.to_string())),
        };

        let pending: PendingCalls = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(
            plugin_id.to_string(),
            frames,
            pending.clone(),
            closed.clone(),
        ));

        let channel = Self {
            plugin_id: plugin_id.to_string(),
            writer: Mutex::new(FramedWrite::new(boxed_writer, codec())),
            pending,
            next_id: AtomicU64::new(1),
            closed,
            reader,
        };

        Ok((channel, handshake))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Marks the channel closed and fails every pending call.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.reader.abort();
        fail_pending(&self.plugin_id, &self.pending);
    }

    /// Unary request/response.
    pub async fn call<Req, Resp>(&self, capability: &str, method: &str, req: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let (_, mut rx) = self.open(capability, method, req, false).await?;
        match rx.recv().await {
            Some(Ok(payload)) => Ok(serde_json::from_value(payload)?),
            Some(Err(e)) => Err(e.normalize()),
            None => Err(self.unavailable()),
        }
    }

    /// Starts a call whose reply arrives as a sequence of chunks.
    ///
    /// The receiver yields each chunk and closes once the plugin ends the
    /// stream. Returns the call id so the caller can cancel it.
    pub async fn call_streaming<Req>(
        &self,
        capability: &str,
        method: &str,
        req: &Req,
    ) -> Result<(u64, mpsc::UnboundedReceiver<Result<Value>>)>
    where
        Req: Serialize + Sync,
    {
        self.open(capability, method, req, true).await
    }

    /// Tells the plugin to abandon call `id` and stops routing its replies.
    pub async fn cancel(&self, id: u64) -> Result<()> {
        if self.pending.remove(&id).is_none() || self.is_closed() {
            return Ok(());
        }
        self.send(Frame::Cancel { id }).await
    }

    async fn open<Req>(
        &self,
        capability: &str,
        method: &str,
        req: &Req,
        streaming: bool,
    ) -> Result<(u64, mpsc::UnboundedReceiver<Result<Value>>)>
    where
        Req: Serialize + Sync,
    {
        if self.is_closed() {
            return Err(self.unavailable());
        }

        let payload = serde_json::to_value(req)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.insert(id, Pending { tx, streaming });

        // The reader flags `closed` before draining, so a call registered
        // after the drain is caught here.
        if self.is_closed() {
            self.pending.remove(&id);
            return Err(self.unavailable());
        }

        let frame = Frame::Request {
            id,
            capability: capability.to_string(),
            method: method.to_string(),
            payload,
        };
        if let Err(e) = self.send(frame).await {
            self.pending.remove(&id);
            return Err(e);
        }

        Ok((id, rx))
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        let bytes = frame.encode()?;
        let mut writer = self.writer.lock().await;
        writer.send(bytes).await.map_err(|e| {
            tracing::debug!(plugin_id = %self.plugin_id, error = %e, "Failed to write frame");
            self.unavailable()
        })
    }

    fn unavailable(&self) -> PluginError {
        PluginError::Unavailable(self.plugin_id.clone())
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    plugin_id: String,
    mut frames: FrameReader,
    pending: PendingCalls,
    closed: Arc<AtomicBool>,
) {
    while let Some(next) = frames.next().await {
        let bytes = match next {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(plugin_id = %plugin_id, error = %e, "Plugin connection read failed");
                break;
            }
        };

        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(plugin_id = %plugin_id, error = %e, "Discarding malformed frame");
                continue;
            }
        };

        match frame {
            Frame::Response { id, payload } => {
                let streaming = pending.get(&id).map(|p| p.streaming);
                match streaming {
                    Some(true) => {
                        if let Some(call) = pending.get(&id) {
                            let _ = call.tx.send(Ok(payload));
                        }
                    }
                    Some(false) => {
                        if let Some((_, call)) = pending.remove(&id) {
                            let _ = call.tx.send(Ok(payload));
                        }
                    }
                    None => {
                        tracing::trace!(plugin_id = %plugin_id, id, "Reply for unknown call");
                    }
                }
            }
            Frame::End { id } => {
                pending.remove(&id);
            }
            Frame::Error { id, code, message } => {
                if let Some((_, call)) = pending.remove(&id) {
                    let _ = call.tx.send(Err(PluginError::Downstream { code, message }));
                }
            }
            other => {
                tracing::debug!(
                    plugin_id = %plugin_id,
                    frame = ?other,
                    "Unexpected frame from plugin"
                );
            }
        }
    }

    tracing::debug!(plugin_id = %plugin_id, "Plugin connection closed");
    closed.store(true, Ordering::SeqCst);
    fail_pending(&plugin_id, &pending);
}

fn fail_pending(plugin_id: &str, pending: &PendingCalls) {
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, call)) = pending.remove(&id) {
            let _ = call
                .tx
                .send(Err(PluginError::Unavailable(plugin_id.to_string())));
        }
    }
}

#[cfg(test)]
#[path = "rpc_tests.rs"]
mod rpc_tests;

//! Resource-call stream bridge
//!
//! A plugin answers a resource call with either one buffered response or a
//! sequence of chunks. Both are consumed through [`ResourceStream`]: call
//! `recv` until it yields [`PluginError::StreamDrained`], then `close`.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};

use crate::backend::{CallResourceResponse, CallResourceResponseSender};
use crate::error::{PluginError, Result};

#[async_trait]
pub trait ResourceStream: Send {
    /// Next response chunk, or `StreamDrained` once the stream is exhausted.
    async fn recv(&mut self) -> Result<CallResourceResponse>;

    /// Closing twice is a no-op.
    async fn close(&mut self) -> Result<()>;
}

/// Wraps one pre-computed response
pub struct SingleResponseStream {
    response: Option<CallResourceResponse>,
    done: bool,
}

impl SingleResponseStream {
    pub fn new(response: CallResourceResponse) -> Self {
        Self {
            response: Some(response),
            done: false,
        }
    }

    /// Stands in for a plugin without a resource capability.
    pub fn not_implemented() -> Self {
        Self::new(CallResourceResponse::not_implemented())
    }
}

#[async_trait]
impl ResourceStream for SingleResponseStream {
    async fn recv(&mut self) -> Result<CallResourceResponse> {
        if self.done {
            return Err(PluginError::StreamDrained);
        }
        self.done = true;
        self.response.take().ok_or(PluginError::StreamDrained)
    }

    async fn close(&mut self) -> Result<()> {
        self.done = true;
        self.response = None;
        Ok(())
    }
}

/// Invoked once when a chunked stream is closed by the consumer
pub type CloseFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Forwards a live downstream stream of response chunks
pub struct ChunkedResponseStream {
    chunks: BoxStream<'static, Result<CallResourceResponse>>,
    on_close: Option<CloseFn>,
}

impl ChunkedResponseStream {
    pub fn new(chunks: BoxStream<'static, Result<CallResourceResponse>>) -> Self {
        Self {
            chunks,
            on_close: None,
        }
    }

    /// Runs `on_close` when the consumer closes the stream, e.g. to cancel
    /// the sending side of an RPC stream.
    pub fn with_close(mut self, on_close: CloseFn) -> Self {
        self.on_close = Some(on_close);
        self
    }
}

#[async_trait]
impl ResourceStream for ChunkedResponseStream {
    async fn recv(&mut self) -> Result<CallResourceResponse> {
        match self.chunks.next().await {
            Some(Ok(chunk)) => Ok(chunk),
            Some(Err(err)) => Err(err.normalize()),
            None => Err(PluginError::StreamDrained),
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.on_close.take() {
            Some(on_close) => on_close().await,
            None => Ok(()),
        }
    }
}

/// Pumps every chunk of `stream` into `sender`, closing the stream afterwards.
pub async fn relay(
    stream: &mut dyn ResourceStream,
    sender: &dyn CallResourceResponseSender,
) -> Result<()> {
    let outcome = loop {
        match stream.recv().await {
            Ok(chunk) => {
                if let Err(e) = sender.send(chunk).await {
                    break Err(e);
                }
            }
            Err(PluginError::StreamDrained) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    let closed = stream.close().await;
    outcome.and(closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UNIMPLEMENTED_CODE;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn chunk(status: u16, body: &str) -> CallResourceResponse {
        CallResourceResponse {
            status,
            body: body.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_single_response_then_drained() {
        let mut stream = SingleResponseStream::new(chunk(200, "ok"));

        let first = stream.recv().await.unwrap();
        assert_eq!(first.status, 200);
        assert!(stream.recv().await.unwrap_err().is_drained());
        assert!(stream.recv().await.unwrap_err().is_drained());
    }

    #[tokio::test]
    async fn test_single_response_close_is_idempotent() {
        let mut stream = SingleResponseStream::not_implemented();
        stream.close().await.unwrap();
        stream.close().await.unwrap();
        assert!(stream.recv().await.unwrap_err().is_drained());
    }

    #[tokio::test]
    async fn test_chunked_stream_forwards_and_translates_unimplemented() {
        let items = vec![
            Ok(chunk(200, "a")),
            Err(PluginError::Downstream {
                code: UNIMPLEMENTED_CODE.into(),
                message: "nope".into(),
            }),
        ];
        let mut stream = ChunkedResponseStream::new(futures::stream::iter(items).boxed());

        assert_eq!(stream.recv().await.unwrap().body, b"a");
        assert!(matches!(
            stream.recv().await,
            Err(PluginError::MethodNotImplemented)
        ));
        assert!(stream.recv().await.unwrap_err().is_drained());
    }

    #[tokio::test]
    async fn test_chunked_close_runs_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        let mut stream = ChunkedResponseStream::new(futures::stream::empty().boxed())
            .with_close(Box::new(move || {
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }));

        stream.close().await.unwrap();
        stream.close().await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_relay_sends_every_chunk() {
        let items = vec![Ok(chunk(200, "a")), Ok(chunk(200, "b")), Ok(chunk(200, "c"))];
        let mut stream = ChunkedResponseStream::new(futures::stream::iter(items).boxed());
        let (tx, mut rx) = mpsc::unbounded_channel::<CallResourceResponse>();

        relay(&mut stream, &tx).await.unwrap();
        drop(tx);

        let mut bodies = Vec::new();
        while let Some(resp) = rx.recv().await {
            bodies.push(String::from_utf8(resp.body).unwrap());
        }
        assert_eq!(bodies, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_relay_surfaces_stream_error() {
        let items = vec![
            Ok(chunk(200, "a")),
            Err(PluginError::Unavailable("p".into())),
        ];
        let mut stream = ChunkedResponseStream::new(futures::stream::iter(items).boxed());
        let (tx, _rx) = mpsc::unbounded_channel::<CallResourceResponse>();

        let err = relay(&mut stream, &tx).await.unwrap_err();
        assert!(matches!(err, PluginError::Unavailable(_)));
    }
}

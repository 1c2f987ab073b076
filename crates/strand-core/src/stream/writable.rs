//! Writable side of a stream.

use super::readable::ReadableStream;
use crate::error::{FlatError, Result, RpcError};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Destination for byte chunks.
///
/// `write` resolving means the sink accepted the batch; a sink applying
/// backpressure simply resolves later.
#[async_trait]
pub trait ChunkSink: Send {
    async fn write(&mut self, chunks: Vec<Bytes>) -> Result<()>;

    /// Signal normal completion.
    async fn end(&mut self) -> Result<()>;

    /// Signal that the producer failed.
    async fn abort(&mut self, error: FlatError);
}

/// A sink for byte chunks, either local or a proxy for a remote one.
pub struct WritableStream {
    sink: Box<dyn ChunkSink>,
    closed: bool,
}

impl WritableStream {
    pub fn new(sink: impl ChunkSink + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            closed: false,
        }
    }

    /// In-process pipe: chunks written here come out of the readable.
    pub fn channel(capacity: usize) -> (WritableStream, ReadableStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            WritableStream::new(ChannelSink { tx: Some(tx) }),
            ReadableStream::from_receiver(rx),
        )
    }

    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<()> {
        self.write_batch(vec![chunk.into()]).await
    }

    /// Write several chunks as one batch.
    pub async fn write_batch(&mut self, chunks: Vec<Bytes>) -> Result<()> {
        if self.closed {
            return Err(RpcError::StreamClosed {
                stream_id: "local".to_string(),
            });
        }
        self.sink.write(chunks).await
    }

    pub async fn end(mut self) -> Result<()> {
        self.closed = true;
        self.sink.end().await
    }

    pub async fn abort(mut self, error: RpcError) {
        self.closed = true;
        self.sink.abort(error.flatten()).await
    }

    /// Copy every chunk from `source`, then end. A source error aborts.
    pub async fn pipe_from(mut self, mut source: ReadableStream) -> Result<()> {
        while let Some(chunk) = source.next_chunk().await {
            match chunk {
                Ok(chunk) => self.write(chunk).await?,
                Err(err) => {
                    let message = err.message();
                    self.abort(err).await;
                    return Err(RpcError::handler(message));
                }
            }
        }
        self.end().await
    }

    pub(crate) fn into_sink(self) -> Box<dyn ChunkSink> {
        self.sink
    }
}

/// Sink backed by a bounded in-process channel.
pub(crate) struct ChannelSink {
    tx: Option<mpsc::Sender<Result<Bytes>>>,
}

impl ChannelSink {
    pub(crate) fn new(tx: mpsc::Sender<Result<Bytes>>) -> Self {
        Self { tx: Some(tx) }
    }

    fn sender(&self) -> Result<&mpsc::Sender<Result<Bytes>>> {
        self.tx.as_ref().ok_or_else(|| RpcError::StreamClosed {
            stream_id: "local".to_string(),
        })
    }
}

#[async_trait]
impl ChunkSink for ChannelSink {
    async fn write(&mut self, chunks: Vec<Bytes>) -> Result<()> {
        let tx = self.sender()?;
        for chunk in chunks {
            tx.send(Ok(chunk)).await.map_err(|_| RpcError::StreamClosed {
                stream_id: "local".to_string(),
            })?;
        }
        Ok(())
    }

    async fn end(&mut self) -> Result<()> {
        self.tx.take();
        Ok(())
    }

    async fn abort(&mut self, error: FlatError) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(RpcError::from_flat(error))).await;
        }
    }
}

//! Readable side of a stream.

use crate::error::Result;
use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

type HangupHook = Box<dyn FnOnce() + Send>;

/// A source of byte chunks.
///
/// Dropping a readable before it reports the end asks its producer to stop
/// early (consumer hangup). The request is advisory: a local source simply
/// gets dropped, a remote producer is sent a hangup.
pub struct ReadableStream {
    inner: BoxStream<'static, Result<Bytes>>,
    on_hangup: Option<HangupHook>,
    finished: bool,
}

impl ReadableStream {
    pub fn new<S>(source: S) -> Self
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: source.boxed(),
            on_hangup: None,
            finished: false,
        }
    }

    /// A readable yielding the given chunks, then the end.
    pub fn from_chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        I::IntoIter: Send + 'static,
        B: Into<Bytes>,
    {
        Self::new(stream::iter(chunks).map(|chunk| Ok(chunk.into())))
    }

    /// A readable fed by a channel.
    pub(crate) fn from_receiver(rx: mpsc::Receiver<Result<Bytes>>) -> Self {
        Self::new(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }

    pub(crate) fn with_hangup(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_hangup = Some(Box::new(hook));
        self
    }

    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        self.next().await
    }

    /// Read every chunk until the end, failing on the first stream error.
    pub async fn collect_chunks(mut self) -> Result<Vec<Bytes>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next().await {
            chunks.push(chunk?);
        }
        Ok(chunks)
    }

    /// Read every chunk and concatenate them.
    pub async fn read_to_end(self) -> Result<Vec<u8>> {
        let chunks = self.collect_chunks().await?;
        Ok(chunks.iter().flat_map(|c| c.iter().copied()).collect())
    }

    /// Stop reading and tell the producer.
    pub fn hangup(mut self) {
        self.fire_hangup();
    }

    fn fire_hangup(&mut self) {
        if !self.finished {
            self.finished = true;
            if let Some(hook) = self.on_hangup.take() {
                hook();
            }
        }
    }
}

impl Stream for ReadableStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        let polled = self.inner.as_mut().poll_next(cx);
        match &polled {
            Poll::Ready(None) | Poll::Ready(Some(Err(_))) => {
                self.finished = true;
                self.on_hangup = None;
            }
            _ => {}
        }
        polled
    }
}

impl Drop for ReadableStream {
    fn drop(&mut self) {
        self.fire_hangup();
    }
}

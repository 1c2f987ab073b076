//! Stream multiplexer.
//!
//! One `StreamMux` lives on each connection. [`StreamMux::encode`] replaces
//! every stream inside an outgoing payload with a wire handle
//! `{streamId, readable, writable}` and registers it in the *local* map;
//! [`StreamMux::decode`] turns incoming handles back into live proxies
//! registered in the *remote* map. Both maps drop an entry as soon as its
//! stream ends, fails, or is hung up.
//!
//! Whichever side produces data for a stream owns a [`ProducerState`]: every
//! `stream-data` frame it sends takes one slot of a bounded ack window and
//! starts an ack timer. A full window suspends the writer; an expired timer
//! kills the stream on both ends. The consuming side acks a frame once its
//! local sink has accepted the chunks.

use super::payload::Payload;
use super::readable::ReadableStream;
use super::writable::{ChannelSink, ChunkSink, WritableStream};
use crate::config::RpcOptions;
use crate::error::{FlatError, Result, RpcError};
use crate::rpc::protocol::WireMessage;
use crate::util::lock;
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Queue of frames waiting for the connection writer.
pub(crate) type Outbound = mpsc::UnboundedSender<WireMessage>;

#[derive(Debug, Clone, PartialEq)]
enum StreamStatus {
    Open,
    Ended,
    HungUp,
    AckTimedOut,
    Failed(FlatError),
    Disconnected,
}

/// Producer half of one stream, on whichever side writes the data.
pub(crate) struct ProducerState {
    stream_id: String,
    outbound: Outbound,
    window: Semaphore,
    ack_timeout: Duration,
    next_ack: AtomicU64,
    pending: Mutex<HashMap<u64, JoinHandle<()>>>,
    status: watch::Sender<StreamStatus>,
    mux: Weak<StreamMux>,
}

impl ProducerState {
    fn new(stream_id: String, mux: &Arc<StreamMux>) -> Arc<Self> {
        let (status, _) = watch::channel(StreamStatus::Open);
        Arc::new(Self {
            stream_id,
            outbound: mux.outbound.clone(),
            window: Semaphore::new(mux.max_pending_ack),
            ack_timeout: mux.ack_timeout,
            next_ack: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            status,
            mux: Arc::downgrade(mux),
        })
    }

    fn current_error(&self) -> RpcError {
        let stream_id = self.stream_id.clone();
        match &*self.status.borrow() {
            StreamStatus::Open | StreamStatus::Ended => RpcError::StreamClosed { stream_id },
            StreamStatus::HungUp => RpcError::StreamHangup { stream_id },
            StreamStatus::AckTimedOut => RpcError::AckTimeout {
                stream_id,
                timeout: self.ack_timeout,
            },
            StreamStatus::Failed(flat) => RpcError::from_flat(flat.clone()),
            StreamStatus::Disconnected => RpcError::Disconnected,
        }
    }

    fn is_open(&self) -> bool {
        *self.status.borrow() == StreamStatus::Open
    }

    /// Send one batch of chunks under the ack window.
    ///
    /// Suspends while the window is full. Fails once the stream has left the
    /// open state, including while suspended.
    pub(crate) async fn send(self: &Arc<Self>, chunks: Vec<Bytes>) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        if !self.is_open() {
            return Err(self.current_error());
        }
        let permit = self
            .window
            .acquire()
            .await
            .map_err(|_| self.current_error())?;
        permit.forget();
        if !self.is_open() {
            return Err(self.current_error());
        }

        let ack_id = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        let timeout = self.ack_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(state) = weak.upgrade() {
                state.on_ack_timeout(ack_id);
            }
        });
        lock(&self.pending).insert(ack_id, timer);

        let frame = WireMessage::StreamData {
            stream_id: self.stream_id.clone(),
            data: chunks,
            ack_id,
        };
        if self.outbound.send(frame).is_err() {
            self.finish(StreamStatus::Disconnected, None);
            return Err(RpcError::Disconnected);
        }
        Ok(())
    }

    fn on_ack(&self, ack_id: u64) {
        match lock(&self.pending).remove(&ack_id) {
            Some(timer) => {
                timer.abort();
                self.window.add_permits(1);
            }
            None => debug!(
                "Dropping duplicate or late ack {} for stream {}",
                ack_id, self.stream_id
            ),
        }
    }

    fn on_ack_timeout(&self, ack_id: u64) {
        if lock(&self.pending).remove(&ack_id).is_none() {
            return;
        }
        warn!(
            "Stream {} ack {} timed out after {:?}",
            self.stream_id, ack_id, self.ack_timeout
        );
        let error = RpcError::AckTimeout {
            stream_id: self.stream_id.clone(),
            timeout: self.ack_timeout,
        }
        .flatten();
        self.finish(
            StreamStatus::AckTimedOut,
            Some(WireMessage::StreamError {
                stream_id: self.stream_id.clone(),
                error,
            }),
        );
    }

    /// Normal completion. Ending an already-ended stream is a no-op.
    fn end(&self) -> Result<()> {
        let ended = self.finish(
            StreamStatus::Ended,
            Some(WireMessage::StreamEnd {
                stream_id: self.stream_id.clone(),
            }),
        );
        if ended || *self.status.borrow() == StreamStatus::Ended {
            Ok(())
        } else {
            Err(self.current_error())
        }
    }

    fn abort(&self, error: FlatError) {
        self.finish(
            StreamStatus::Failed(error.clone()),
            Some(WireMessage::StreamError {
                stream_id: self.stream_id.clone(),
                error,
            }),
        );
    }

    /// Leave the open state exactly once: close the window, cancel ack
    /// timers, notify the peer and drop the map entry.
    fn finish(&self, next: StreamStatus, notify: Option<WireMessage>) -> bool {
        let changed = self.status.send_if_modified(|current| {
            if *current == StreamStatus::Open {
                *current = next.clone();
                true
            } else {
                false
            }
        });
        if !changed {
            return false;
        }

        self.window.close();
        for (_, timer) in lock(&self.pending).drain() {
            timer.abort();
        }
        if let Some(message) = notify {
            let _ = self.outbound.send(message);
        }
        if let Some(mux) = self.mux.upgrade() {
            mux.release(&self.stream_id);
        }
        true
    }
}

/// Writable proxy for a sink that lives on the peer.
struct RemoteWriter {
    state: Arc<ProducerState>,
}

#[async_trait]
impl ChunkSink for RemoteWriter {
    async fn write(&mut self, chunks: Vec<Bytes>) -> Result<()> {
        self.state.send(chunks).await
    }

    async fn end(&mut self) -> Result<()> {
        self.state.end()
    }

    async fn abort(&mut self, error: FlatError) {
        self.state.abort(error);
    }
}

impl Drop for RemoteWriter {
    fn drop(&mut self) {
        if self.state.is_open() {
            let _ = self.state.end();
        }
    }
}

enum ConsumerEvent {
    Data { chunks: Vec<Bytes>, ack_id: u64 },
    End,
    Error(FlatError),
}

#[derive(Clone)]
enum StreamEntry {
    Producer(Arc<ProducerState>),
    Consumer(mpsc::UnboundedSender<ConsumerEvent>),
}

/// Wire form of a stream inside a payload.
struct StreamHandle {
    stream_id: String,
    readable: bool,
    writable: bool,
}

impl StreamHandle {
    fn to_value(&self) -> Value {
        json!({
            "streamId": self.stream_id,
            "readable": self.readable,
            "writable": self.writable,
        })
    }

    fn detect(map: &Map<String, Value>) -> Option<Self> {
        if map.len() != 3 {
            return None;
        }
        Some(Self {
            stream_id: map.get("streamId")?.as_str()?.to_string(),
            readable: map.get("readable")?.as_bool()?,
            writable: map.get("writable")?.as_bool()?,
        })
    }
}

fn has_reserved_shape(payload: &Payload) -> bool {
    match payload {
        Payload::Scalar(value) => contains_handle(value),
        Payload::List(items) => items.iter().any(has_reserved_shape),
        Payload::Map(entries) => entries.values().any(has_reserved_shape),
        Payload::Readable(_) | Payload::Writable(_) => false,
    }
}

pub(crate) fn contains_handle(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            StreamHandle::detect(map).is_some() || map.values().any(contains_handle)
        }
        Value::Array(items) => items.iter().any(contains_handle),
        _ => false,
    }
}

/// Streams registered by [`StreamMux::encode`] that must not produce data
/// before the frame carrying their handles is queued.
///
/// Dropping without calling [`PendingStreams::start`] releases them.
pub(crate) struct PendingStreams {
    mux: Weak<StreamMux>,
    pumps: Vec<(Arc<ProducerState>, ReadableStream)>,
    consumers: Vec<String>,
}

impl PendingStreams {
    pub(crate) fn is_empty(&self) -> bool {
        self.pumps.is_empty() && self.consumers.is_empty()
    }

    /// Begin piping local readables to the peer.
    pub(crate) fn start(mut self) {
        for (state, source) in std::mem::take(&mut self.pumps) {
            tokio::spawn(pump(state, source));
        }
        self.consumers.clear();
    }
}

impl Drop for PendingStreams {
    fn drop(&mut self) {
        for (state, _source) in self.pumps.drain(..) {
            state.finish(StreamStatus::Disconnected, None);
        }
        if let Some(mux) = self.mux.upgrade() {
            for stream_id in self.consumers.drain(..) {
                mux.release(&stream_id);
            }
        }
    }
}

async fn left_open(status: &mut watch::Receiver<StreamStatus>) {
    let _ = status.wait_for(|s| *s != StreamStatus::Open).await;
}

/// Pipe a local readable to the peer, batching whatever chunks are ready.
/// The source is dropped as soon as the stream leaves the open state.
async fn pump(state: Arc<ProducerState>, mut source: ReadableStream) {
    let mut status = state.status.subscribe();
    loop {
        let next = tokio::select! {
            biased;
            _ = left_open(&mut status) => break,
            next = source.next_chunk() => next,
        };
        let first = match next {
            None => {
                let _ = state.end();
                break;
            }
            Some(Err(err)) => {
                state.abort(err.flatten());
                break;
            }
            Some(Ok(chunk)) => chunk,
        };

        let mut batch = vec![first];
        let mut tail = None;
        while let Some(item) = source.next_chunk().now_or_never() {
            match item {
                Some(Ok(chunk)) => batch.push(chunk),
                other => {
                    tail = Some(other);
                    break;
                }
            }
        }

        if let Err(err) = state.send(batch).await {
            debug!("Stopping pump for stream {}: {}", state.stream_id, err);
            break;
        }
        match tail {
            Some(None) => {
                let _ = state.end();
                break;
            }
            Some(Some(Err(err))) => {
                state.abort(err.flatten());
                break;
            }
            _ => {}
        }
    }
}

/// Per-connection stream multiplexer.
pub struct StreamMux {
    outbound: Outbound,
    max_pending_ack: usize,
    ack_timeout: Duration,
    local: Mutex<HashMap<String, StreamEntry>>,
    remote: Mutex<HashMap<String, StreamEntry>>,
}

impl StreamMux {
    pub(crate) fn new(outbound: Outbound, options: &RpcOptions) -> Arc<Self> {
        Arc::new(Self {
            outbound,
            max_pending_ack: options.stream_max_pending_ack.max(1),
            ack_timeout: options.stream_ack_timeout,
            local: Mutex::new(HashMap::new()),
            remote: Mutex::new(HashMap::new()),
        })
    }

    /// Number of live streams in the local and remote maps.
    pub fn stream_counts(&self) -> (usize, usize) {
        (lock(&self.local).len(), lock(&self.remote).len())
    }

    /// Replace every stream in `payload` with a wire handle.
    ///
    /// A plain value shaped exactly like a wire handle is rejected before any
    /// stream is registered, since the peer could not tell it apart.
    pub(crate) fn encode(self: &Arc<Self>, payload: Payload) -> Result<(Value, PendingStreams)> {
        if has_reserved_shape(&payload) {
            return Err(RpcError::ReservedStreamShape);
        }
        let mut pending = PendingStreams {
            mux: Arc::downgrade(self),
            pumps: Vec::new(),
            consumers: Vec::new(),
        };
        let value = self.encode_into(payload, &mut pending);
        Ok((value, pending))
    }

    fn encode_into(self: &Arc<Self>, payload: Payload, pending: &mut PendingStreams) -> Value {
        match payload {
            Payload::Scalar(value) => value,
            Payload::List(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| self.encode_into(item, pending))
                    .collect(),
            ),
            Payload::Map(entries) => Value::Object(
                entries
                    .into_iter()
                    .map(|(key, item)| (key, self.encode_into(item, pending)))
                    .collect(),
            ),
            Payload::Readable(source) => {
                let stream_id = new_stream_id();
                let state = ProducerState::new(stream_id.clone(), self);
                lock(&self.local).insert(stream_id.clone(), StreamEntry::Producer(state.clone()));
                pending.pumps.push((state, source));
                StreamHandle {
                    stream_id,
                    readable: true,
                    writable: false,
                }
                .to_value()
            }
            Payload::Writable(sink) => {
                let stream_id = new_stream_id();
                let feed = self.spawn_consumer(stream_id.clone(), sink.into_sink());
                lock(&self.local).insert(stream_id.clone(), StreamEntry::Consumer(feed));
                pending.consumers.push(stream_id.clone());
                StreamHandle {
                    stream_id,
                    readable: false,
                    writable: true,
                }
                .to_value()
            }
        }
    }

    /// Turn every wire handle in `value` into a live proxy.
    pub(crate) fn decode(self: &Arc<Self>, value: Value) -> Result<Payload> {
        match value {
            Value::Object(map) => {
                if let Some(handle) = StreamHandle::detect(&map) {
                    return self.decode_handle(handle);
                }
                if !map.values().any(contains_handle) {
                    return Ok(Payload::Scalar(Value::Object(map)));
                }
                let mut entries = std::collections::BTreeMap::new();
                for (key, item) in map {
                    entries.insert(key, self.decode(item)?);
                }
                Ok(Payload::Map(entries))
            }
            Value::Array(items) => {
                if !items.iter().any(contains_handle) {
                    return Ok(Payload::Scalar(Value::Array(items)));
                }
                items
                    .into_iter()
                    .map(|item| self.decode(item))
                    .collect::<Result<Vec<_>>>()
                    .map(Payload::List)
            }
            other => Ok(Payload::Scalar(other)),
        }
    }

    fn decode_handle(self: &Arc<Self>, handle: StreamHandle) -> Result<Payload> {
        let stream_id = handle.stream_id;
        match (handle.readable, handle.writable) {
            (true, false) => {
                // The peer produces; we read through a channel fed by acked frames.
                let (tx, rx) = mpsc::channel(1);
                let feed = self.spawn_consumer(stream_id.clone(), Box::new(ChannelSink::new(tx)));
                lock(&self.remote).insert(stream_id.clone(), StreamEntry::Consumer(feed));
                let mux = Arc::downgrade(self);
                let readable = ReadableStream::from_receiver(rx).with_hangup(move || {
                    if let Some(mux) = mux.upgrade() {
                        mux.hangup_consumer(&stream_id);
                    }
                });
                Ok(Payload::Readable(readable))
            }
            (false, true) => {
                let state = ProducerState::new(stream_id.clone(), self);
                lock(&self.remote).insert(stream_id, StreamEntry::Producer(state.clone()));
                Ok(Payload::Writable(WritableStream::new(RemoteWriter { state })))
            }
            _ => Err(RpcError::DuplexStream { stream_id }),
        }
    }

    /// Feed inbound frames for one stream into a local sink, in order.
    fn spawn_consumer(
        self: &Arc<Self>,
        stream_id: String,
        mut sink: Box<dyn ChunkSink>,
    ) -> mpsc::UnboundedSender<ConsumerEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbound = self.outbound.clone();
        let mux = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    ConsumerEvent::Data { chunks, ack_id } => match sink.write(chunks).await {
                        Ok(()) => {
                            let _ = outbound.send(WireMessage::StreamAck {
                                stream_id: stream_id.clone(),
                                ack_id,
                            });
                        }
                        Err(err) => {
                            debug!("Sink for stream {} refused data: {}", stream_id, err);
                            if let Some(mux) = mux.upgrade() {
                                mux.hangup_consumer(&stream_id);
                            }
                            return;
                        }
                    },
                    ConsumerEvent::End => {
                        if let Err(err) = sink.end().await {
                            debug!("Sink for stream {} failed to end: {}", stream_id, err);
                        }
                        return;
                    }
                    ConsumerEvent::Error(error) => {
                        sink.abort(error).await;
                        return;
                    }
                }
            }
            // Feed dropped without an end: the stream was released early.
            sink.abort(RpcError::Disconnected.flatten()).await;
        });
        tx
    }

    fn lookup(&self, stream_id: &str) -> Option<StreamEntry> {
        if let Some(entry) = lock(&self.local).get(stream_id) {
            return Some(entry.clone());
        }
        lock(&self.remote).get(stream_id).cloned()
    }

    fn remove(&self, stream_id: &str) -> Option<StreamEntry> {
        if let Some(entry) = lock(&self.local).remove(stream_id) {
            return Some(entry);
        }
        lock(&self.remote).remove(stream_id)
    }

    pub(crate) fn release(&self, stream_id: &str) {
        self.remove(stream_id);
    }

    /// Consumer-side early stop: drop the entry and ask the producer to stop.
    fn hangup_consumer(&self, stream_id: &str) {
        if let Some(StreamEntry::Consumer(_)) = self.remove(stream_id) {
            let _ = self.outbound.send(WireMessage::StreamHangup {
                stream_id: stream_id.to_string(),
            });
        }
    }

    /// Route one stream-level frame from the peer.
    pub(crate) fn handle_message(&self, message: WireMessage) {
        match message {
            WireMessage::StreamData {
                stream_id,
                data,
                ack_id,
            } => match self.lookup(&stream_id) {
                Some(StreamEntry::Consumer(feed)) => {
                    if feed
                        .send(ConsumerEvent::Data {
                            chunks: data,
                            ack_id,
                        })
                        .is_err()
                    {
                        self.hangup_consumer(&stream_id);
                    }
                }
                Some(StreamEntry::Producer(_)) => {
                    warn!("Dropping stream-data for stream {} produced locally", stream_id);
                }
                None => {
                    debug!("Dropping stream-data for unknown stream {}", stream_id);
                    let _ = self.outbound.send(WireMessage::StreamHangup { stream_id });
                }
            },
            WireMessage::StreamAck { stream_id, ack_id } => match self.lookup(&stream_id) {
                Some(StreamEntry::Producer(state)) => state.on_ack(ack_id),
                _ => debug!("Dropping ack {} for unknown stream {}", ack_id, stream_id),
            },
            WireMessage::StreamEnd { stream_id } => match self.lookup(&stream_id) {
                Some(StreamEntry::Consumer(feed)) => {
                    self.remove(&stream_id);
                    let _ = feed.send(ConsumerEvent::End);
                }
                _ => debug!("Dropping stream-end for unknown stream {}", stream_id),
            },
            WireMessage::StreamError { stream_id, error } => match self.lookup(&stream_id) {
                Some(StreamEntry::Consumer(feed)) => {
                    self.remove(&stream_id);
                    let _ = feed.send(ConsumerEvent::Error(error));
                }
                Some(StreamEntry::Producer(state)) => {
                    state.finish(StreamStatus::Failed(error), None);
                }
                None => debug!("Dropping stream-error for unknown stream {}", stream_id),
            },
            WireMessage::StreamHangup { stream_id } => match self.lookup(&stream_id) {
                Some(StreamEntry::Producer(state)) => {
                    debug!("Consumer hung up stream {}", stream_id);
                    state.finish(StreamStatus::HungUp, None);
                }
                _ => debug!("Dropping hangup for unknown stream {}", stream_id),
            },
            other => warn!("Stream multiplexer ignoring non-stream message: {:?}", other),
        }
    }

    /// Fail every live stream; called when the connection goes away.
    pub(crate) fn shutdown(&self) {
        let entries: Vec<StreamEntry> = lock(&self.local)
            .drain()
            .chain(lock(&self.remote).drain())
            .map(|(_, entry)| entry)
            .collect();
        for entry in entries {
            if let StreamEntry::Producer(state) = entry {
                state.finish(StreamStatus::Disconnected, None);
            }
        }
    }
}

fn new_stream_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

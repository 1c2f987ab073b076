//! Per-connection driver shared by callers and services.
//!
//! A connection owns one writer task draining the outbound queue into frames
//! and one reader task routing inbound frames: calls go to the attached
//! [`Service`], call results complete the matching pending call, stream frames
//! go to the [`StreamMux`]. Calls are correlated by a per-connection id; a
//! result whose id is no longer pending is logged and dropped.

use crate::config::RpcOptions;
use crate::error::{Result, RpcError};
use crate::rpc::context::CallContext;
use crate::rpc::protocol::{read_message, write_message, WireMessage};
use crate::rpc::service::Service;
use crate::stream::mux::{Outbound, StreamMux};
use crate::stream::Payload;
use crate::util::lock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// Lifecycle of a connection. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

type PendingCalls = Mutex<HashMap<u64, oneshot::Sender<Result<Payload>>>>;

pub struct Connection {
    outbound: Outbound,
    mux: Arc<StreamMux>,
    pending: PendingCalls,
    next_id: AtomicU64,
    state: watch::Sender<ConnectionState>,
}

impl Connection {
    /// Start driving a transport. With a service attached, inbound calls are
    /// dispatched to it.
    pub(crate) fn start<R, W>(
        reader: R,
        writer: W,
        service: Option<Arc<Service>>,
        options: &RpcOptions,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Connected);
        let connection = Arc::new(Self {
            mux: StreamMux::new(outbound.clone(), options),
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            state,
        });

        tokio::spawn(writer_loop(connection.clone(), writer, outbound_rx));
        tokio::spawn(reader_loop(
            connection.clone(),
            reader,
            service,
            options.max_frame_size,
        ));
        connection
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Resolves once the connection is gone.
    pub async fn closed(&self) {
        disconnected(&mut self.state.subscribe()).await;
    }

    /// Close the connection. Pending calls fail with `Disconnected`.
    pub fn close(&self) {
        self.disconnect();
    }

    pub fn mux(&self) -> &Arc<StreamMux> {
        &self.mux
    }

    /// Number of calls waiting for a result.
    pub fn pending_calls(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Send a call and wait for its single outcome.
    ///
    /// A timeout only drops local bookkeeping; the peer may still run the
    /// handler, and its late result is discarded.
    pub(crate) async fn call(
        &self,
        remote_call: &str,
        args: Vec<Payload>,
        context: CallContext,
        timeout: Duration,
    ) -> Result<Payload> {
        if self.state() == ConnectionState::Disconnected {
            return Err(RpcError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (encoded, streams) = self.mux.encode(Payload::List(args))?;
        let args = match encoded {
            Value::Array(values) => values,
            other => vec![other],
        };

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        if self.state() == ConnectionState::Disconnected {
            lock(&self.pending).remove(&id);
            return Err(RpcError::Disconnected);
        }

        let frame = WireMessage::Call {
            id,
            remote_call: remote_call.to_string(),
            args,
            context,
        };
        if self.outbound.send(frame).is_err() {
            lock(&self.pending).remove(&id);
            return Err(RpcError::Disconnected);
        }
        streams.start();

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::Disconnected),
            Err(_) => {
                lock(&self.pending).remove(&id);
                debug!("Call {} '{}' timed out after {:?}", id, remote_call, timeout);
                Err(RpcError::Timeout {
                    call: remote_call.to_string(),
                    timeout,
                })
            }
        }
    }

    fn disconnect(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        if !changed {
            return;
        }
        let pending: Vec<_> = lock(&self.pending).drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(RpcError::Disconnected));
        }
        self.mux.shutdown();
    }

    fn complete_call(&self, id: u64, outcome: Result<Payload>) {
        match lock(&self.pending).remove(&id) {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => debug!("Dropping result for call {} that is no longer pending", id),
        }
    }

    fn handle_call(
        self: &Arc<Self>,
        service: &Arc<Service>,
        id: u64,
        remote_call: String,
        args: Vec<Value>,
        context: CallContext,
    ) {
        // Decode on the reader task so stream proxies exist before the next
        // frame for them arrives.
        let decoded = self.mux.decode(Value::Array(args)).map(into_args);
        let service = service.clone();
        let connection = self.clone();
        tokio::spawn(async move {
            let outcome = match decoded {
                Ok(args) => service.dispatch(&remote_call, args, context).await,
                Err(err) => Err(err),
            };
            let (error, result, streams) = match outcome.and_then(|p| connection.mux.encode(p)) {
                Ok((value, streams)) => (None, value, Some(streams)),
                Err(err) => (Some(err.flatten()), Value::Null, None),
            };
            let frame = WireMessage::CallResult { id, error, result };
            if connection.outbound.send(frame).is_err() {
                debug!("Connection closed before result of '{}' was sent", remote_call);
                return;
            }
            if let Some(streams) = streams {
                streams.start();
            }
        });
    }

    fn handle_message(self: &Arc<Self>, service: Option<&Arc<Service>>, message: WireMessage) {
        match message {
            WireMessage::Call {
                id,
                remote_call,
                args,
                context,
            } => match service {
                Some(service) => self.handle_call(service, id, remote_call, args, context),
                None => {
                    warn!("Refusing call '{}' on a caller-only connection", remote_call);
                    let error =
                        RpcError::Protocol("connection does not serve calls".to_string()).flatten();
                    let _ = self.outbound.send(WireMessage::CallResult {
                        id,
                        error: Some(error),
                        result: Value::Null,
                    });
                }
            },
            WireMessage::CallResult { id, error, result } => {
                let outcome = match error {
                    Some(flat) => Err(RpcError::from_flat(flat)),
                    None => self.mux.decode(result),
                };
                self.complete_call(id, outcome);
            }
            WireMessage::Hello { .. } | WireMessage::HelloAck { .. } => {
                warn!("Ignoring handshake frame on an established connection");
            }
            stream_message => self.mux.handle_message(stream_message),
        }
    }
}

/// Flatten a decoded argument array back into positional arguments.
pub(crate) fn into_args(payload: Payload) -> Vec<Payload> {
    match payload {
        Payload::List(items) => items,
        Payload::Scalar(Value::Array(values)) => values.into_iter().map(Payload::Scalar).collect(),
        other => vec![other],
    }
}

async fn disconnected(state: &mut watch::Receiver<ConnectionState>) {
    let _ = state
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await;
}

async fn writer_loop<W>(
    connection: Arc<Connection>,
    mut writer: W,
    mut outbound_rx: mpsc::UnboundedReceiver<WireMessage>,
) where
    W: AsyncWrite + Unpin + Send,
{
    let mut state = connection.state.subscribe();
    loop {
        let message = tokio::select! {
            message = outbound_rx.recv() => message,
            _ = disconnected(&mut state) => None,
        };
        let Some(message) = message else { break };
        if let Err(err) = write_message(&mut writer, &message).await {
            debug!("Connection write failed: {}", err);
            break;
        }
    }
    connection.disconnect();
}

async fn reader_loop<R>(
    connection: Arc<Connection>,
    mut reader: R,
    service: Option<Arc<Service>>,
    max_frame_size: usize,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut state = connection.state.subscribe();
    loop {
        let next = tokio::select! {
            next = read_message::<_, WireMessage>(&mut reader, max_frame_size) => next,
            _ = disconnected(&mut state) => break,
        };
        match next {
            Ok(Some(message)) => connection.handle_message(service.as_ref(), message),
            Ok(None) => {
                debug!("Peer closed the connection");
                break;
            }
            Err(err) => {
                warn!("Dropping connection after read error: {}", err);
                break;
            }
        }
    }
    connection.disconnect();
}

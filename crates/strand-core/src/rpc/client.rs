//! Call Endpoint, caller side.
//!
//! [`RpcClient::connect`] opens a TCP connection, performs the namespace
//! handshake and fetches the service manifest. Only advertised calls can be
//! invoked afterwards, either by name through [`RpcClient::call`] or through
//! the [`RemoteMethod`] proxies returned by [`RpcClient::methods`].

use crate::config::{RpcConfig, RpcOptions};
use crate::error::{Result, RpcError};
use crate::rpc::connection::{Connection, ConnectionState};
use crate::rpc::context::{CallContext, ContextProducer, RequestUidsProducer};
use crate::rpc::protocol::{read_message, write_message, WireMessage};
use crate::rpc::service::Manifest;
use crate::stream::Payload;
use crate::util::lock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info};

pub struct RpcClient {
    namespace: String,
    connection: Arc<Connection>,
    options: RpcOptions,
    manifest: Manifest,
    producers: Vec<Arc<dyn ContextProducer>>,
    next_context: Mutex<Option<CallContext>>,
}

impl RpcClient {
    /// Connect to a router and bind to `namespace`.
    ///
    /// Fails if the handshake is refused or the manifest call errors or
    /// times out.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        namespace: impl Into<String>,
        options: RpcOptions,
    ) -> Result<Self> {
        let namespace = namespace.into();
        let stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::Timeout {
                call: "connect".to_string(),
                timeout: options.connect_timeout,
            })??;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        write_message(
            &mut writer,
            &WireMessage::Hello {
                namespace: namespace.clone(),
            },
        )
        .await?;
        let ack = tokio::time::timeout(
            options.connect_timeout,
            read_message::<_, WireMessage>(&mut reader, options.max_frame_size),
        )
        .await
        .map_err(|_| RpcError::Timeout {
            call: "hello".to_string(),
            timeout: options.connect_timeout,
        })??;
        match ack {
            Some(WireMessage::HelloAck { error: None }) => {}
            Some(WireMessage::HelloAck { error: Some(flat) }) => {
                return Err(RpcError::from_flat(flat));
            }
            Some(other) => {
                return Err(RpcError::Protocol(format!(
                    "expected hello-ack, got {:?}",
                    other
                )));
            }
            None => return Err(RpcError::Disconnected),
        }

        let connection = Connection::start(reader, writer, None, &options);
        let manifest = match Self::fetch_manifest(&connection, &options).await {
            Ok(manifest) => manifest,
            Err(err) => {
                connection.close();
                return Err(err);
            }
        };
        info!(
            "Connected to '{}' (version {}, {} calls)",
            namespace,
            manifest.version,
            manifest.api.len()
        );

        Ok(Self {
            namespace,
            connection,
            options,
            manifest,
            producers: vec![Arc::new(RequestUidsProducer)],
            next_context: Mutex::new(None),
        })
    }

    async fn fetch_manifest(connection: &Connection, options: &RpcOptions) -> Result<Manifest> {
        let mut context = CallContext::new();
        RequestUidsProducer.produce(&mut context);
        connection
            .call(
                RpcConfig::MANIFEST_CALL,
                Vec::new(),
                context,
                options.call_timeout,
            )
            .await?
            .parse()
    }

    /// Append a context producer. Producers run in order; later ones may
    /// overwrite keys set by earlier ones.
    pub fn with_producer(mut self, producer: impl ContextProducer + 'static) -> Self {
        self.producers.push(Arc::new(producer));
        self
    }

    /// Replace the producer list.
    pub fn with_producers(mut self, producers: Vec<Arc<dyn ContextProducer>>) -> Self {
        self.producers = producers;
        self
    }

    /// Context for the next call only, merged after every producer.
    pub fn with_request_context(&self, context: CallContext) -> &Self {
        *lock(&self.next_context) = Some(context);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn options(&self) -> &RpcOptions {
        &self.options
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Resolves once the connection is gone. Reconnecting is up to the caller.
    pub async fn closed(&self) {
        self.connection.closed().await
    }

    pub fn close(&self) {
        self.connection.close();
    }

    /// Live stream counts on this connection, local then remote.
    pub fn stream_counts(&self) -> (usize, usize) {
        self.connection.mux().stream_counts()
    }

    /// Proxy for one advertised call.
    pub fn method(&self, name: &str) -> Result<RemoteMethod<'_>> {
        if !self.manifest.contains(name) {
            return Err(self.unknown_call(name));
        }
        Ok(RemoteMethod {
            client: self,
            name: name.to_string(),
        })
    }

    /// One proxy per advertised call.
    pub fn methods(&self) -> Vec<RemoteMethod<'_>> {
        self.manifest
            .api
            .iter()
            .map(|name| RemoteMethod {
                client: self,
                name: name.clone(),
            })
            .collect()
    }

    pub async fn call(&self, name: &str, args: Vec<Payload>) -> Result<Payload> {
        self.call_with_timeout(name, args, self.options.call_timeout)
            .await
    }

    /// Call with an explicit timeout. The outcome is delivered exactly once.
    pub async fn call_with_timeout(
        &self,
        name: &str,
        args: Vec<Payload>,
        timeout: Duration,
    ) -> Result<Payload> {
        if !self.manifest.contains(name) {
            return Err(self.unknown_call(name));
        }
        let context = self.build_context();
        debug!(
            "Calling {}.{} (reqUids {:?})",
            self.namespace, name, context.req_uids
        );
        self.connection.call(name, args, context, timeout).await
    }

    /// Call with plain JSON arguments and deserialize the result.
    pub async fn call_json<T: DeserializeOwned>(&self, name: &str, args: Vec<Value>) -> Result<T> {
        let args = args.into_iter().map(Payload::Scalar).collect();
        self.call(name, args).await?.parse()
    }

    fn build_context(&self) -> CallContext {
        let mut context = CallContext::new();
        for producer in &self.producers {
            producer.produce(&mut context);
        }
        if let Some(one_shot) = lock(&self.next_context).take() {
            context.merge(one_shot);
        }
        context
    }

    fn unknown_call(&self, name: &str) -> RpcError {
        RpcError::UnknownCall {
            namespace: self.namespace.clone(),
            call: name.to_string(),
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.connection.close();
    }
}

/// One call from the manifest, bound to its client.
#[derive(Clone)]
pub struct RemoteMethod<'a> {
    client: &'a RpcClient,
    name: String,
}

impl RemoteMethod<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, args: Vec<Payload>) -> Result<Payload> {
        self.client.call(&self.name, args).await
    }

    pub async fn call_with_timeout(&self, args: Vec<Payload>, timeout: Duration) -> Result<Payload> {
        self.client.call_with_timeout(&self.name, args, timeout).await
    }
}

impl std::fmt::Debug for RemoteMethod<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RemoteMethod({}.{})", self.client.namespace, self.name)
    }
}

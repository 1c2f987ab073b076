//! Namespace Router.
//!
//! Listens on one TCP endpoint and binds each inbound connection to the
//! [`Service`] named in its `hello` frame. Every accepted connection gets its
//! own [`Connection`] and therefore its own stream multiplexer.
//!
//! # Failure isolation
//!
//! A client that sends garbage, oversized frames or disconnects mid-call only
//! takes down its own connection task. Accept errors are logged and the loop
//! continues.

use crate::config::RpcOptions;
use crate::error::{Result, RpcError};
use crate::rpc::connection::Connection;
use crate::rpc::protocol::{read_message, write_message, WireMessage};
use crate::rpc::service::Service;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

type ServiceTable = Arc<HashMap<String, Arc<Service>>>;

/// Handle to a running router. Dropping shuts it down.
pub struct RouterHandle {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    active_connections: Arc<AtomicUsize>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl RouterHandle {
    /// Get the address the router is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the bound port, useful when listening on port 0.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Number of connections currently open.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Stop accepting and close every open connection.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for RouterHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Maps namespaces to services and accepts persistent connections.
#[derive(Default)]
pub struct NamespaceRouter {
    services: HashMap<String, Arc<Service>>,
    options: RpcOptions,
}

impl NamespaceRouter {
    /// Create a router with no namespaces bound.
    pub fn new(options: RpcOptions) -> Self {
        Self {
            services: HashMap::new(),
            options,
        }
    }

    /// Bind each service under its namespace. A later service with the same
    /// namespace replaces the earlier one.
    pub fn register_services(&mut self, services: impl IntoIterator<Item = Service>) -> &mut Self {
        for service in services {
            self.register_shared(Arc::new(service));
        }
        self
    }

    /// Bind a service that is also used elsewhere, e.g. by the single-shot
    /// endpoint.
    pub fn register_shared(&mut self, service: Arc<Service>) -> &mut Self {
        debug!("Registering namespace '{}'", service.namespace());
        self.services
            .insert(service.namespace().to_string(), service);
        self
    }

    /// Bound namespaces, sorted.
    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }

    /// Iterate over the bound services.
    pub fn services(&self) -> impl Iterator<Item = &Arc<Service>> {
        self.services.values()
    }

    /// Start accepting connections.
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> Result<RouterHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!(
            "RPC router listening on {} (namespaces: {:?})",
            addr,
            self.namespaces()
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(accept_loop(
            listener,
            Arc::new(self.services.clone()),
            self.options.clone(),
            shutdown_rx,
            conn_shutdown_rx,
            active_connections.clone(),
        ));

        Ok(RouterHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            active_connections,
            task_handle: Some(task_handle),
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    services: ServiceTable,
    options: RpcOptions,
    mut shutdown_rx: oneshot::Receiver<()>,
    conn_shutdown_rx: watch::Receiver<bool>,
    active_connections: Arc<AtomicUsize>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                info!("RPC router shutting down");
                break;
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let current = active_connections.load(Ordering::Relaxed);
                        if current >= options.max_connections {
                            warn!(
                                "Rejecting connection from {}: at max capacity ({})",
                                peer_addr, options.max_connections
                            );
                            continue;
                        }

                        active_connections.fetch_add(1, Ordering::Relaxed);
                        let services = services.clone();
                        let options = options.clone();
                        let conns = active_connections.clone();
                        let conn_shutdown = conn_shutdown_rx.clone();

                        tokio::spawn(async move {
                            debug!("Connection from {}", peer_addr);
                            if let Err(e) =
                                handle_connection(stream, &services, &options, conn_shutdown).await
                            {
                                debug!("Connection {} ended: {}", peer_addr, e);
                            }
                            conns.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    services: &HashMap<String, Arc<Service>>,
    options: &RpcOptions,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    let hello = tokio::time::timeout(
        options.connect_timeout,
        read_message::<_, WireMessage>(&mut reader, options.max_frame_size),
    )
    .await
    .map_err(|_| RpcError::Timeout {
        call: "hello".to_string(),
        timeout: options.connect_timeout,
    })??;

    let namespace = match hello {
        Some(WireMessage::Hello { namespace }) => namespace,
        Some(other) => {
            return Err(RpcError::Protocol(format!(
                "expected hello, got {:?}",
                other
            )))
        }
        None => return Ok(()),
    };

    let Some(service) = services.get(&namespace).cloned() else {
        warn!("Refusing connection for unknown namespace '{}'", namespace);
        let error = RpcError::UnknownNamespace(namespace.clone()).flatten();
        write_message(&mut writer, &WireMessage::HelloAck { error: Some(error) }).await?;
        return Err(RpcError::UnknownNamespace(namespace));
    };
    write_message(&mut writer, &WireMessage::HelloAck { error: None }).await?;

    let connection = Connection::start(reader, writer, Some(service), options);
    tokio::select! {
        _ = connection.closed() => {}
        _ = shutdown_rx.changed() => connection.close(),
    }
    debug!("Connection for '{}' closed", namespace);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::client::RpcClient;
    use crate::stream::Payload;
    use std::time::Duration;

    fn ping_service() -> Service {
        let mut service = Service::new("diag");
        service.register_sync("ping", |_env, _args| Ok(Payload::from("pong")));
        service
    }

    async fn start_router(options: RpcOptions) -> RouterHandle {
        let mut router = NamespaceRouter::new(options);
        router.register_services([ping_service()]);
        router.listen("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn test_router_starts_on_random_port() {
        let handle = start_router(RpcOptions::default()).await;
        assert!(handle.port() > 0);
    }

    #[tokio::test]
    async fn test_unknown_namespace_is_refused() {
        let handle = start_router(RpcOptions::default()).await;
        let result = RpcClient::connect(handle.addr(), "nope", RpcOptions::default()).await;
        let err = match result {
            Ok(_) => panic!("connect should fail"),
            Err(err) => err,
        };
        assert!(err.message().contains("nope"));
        assert_eq!(err.code(), "UnknownNamespace");
    }

    #[tokio::test]
    async fn test_garbage_client_does_not_kill_router() {
        use tokio::io::AsyncWriteExt;

        let handle = start_router(RpcOptions::default()).await;
        let mut raw = TcpStream::connect(handle.addr()).await.unwrap();
        raw.write_all(&[0, 0, 0, 3, b'x', b'y', b'z']).await.unwrap();
        drop(raw);

        let client = RpcClient::connect(handle.addr(), "diag", RpcOptions::default())
            .await
            .unwrap();
        let result = client.call("ping", vec![]).await.unwrap();
        assert_eq!(result.as_str(), Some("pong"));
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let mut handle = start_router(RpcOptions::default()).await;
        let client = RpcClient::connect(handle.addr(), "diag", RpcOptions::default())
            .await
            .unwrap();
        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(2), client.closed())
            .await
            .expect("client should be disconnected by router shutdown");
    }

    #[tokio::test]
    async fn test_connection_cap_refuses_extra_clients() {
        let options = RpcOptions::default()
            .with_max_connections(1)
            .with_connect_timeout(Duration::from_millis(300));
        let handle = start_router(options.clone()).await;
        let _first = RpcClient::connect(handle.addr(), "diag", options.clone())
            .await
            .unwrap();
        assert!(RpcClient::connect(handle.addr(), "diag", options).await.is_err());
    }
}

//! Strand Core - namespaced RPC with multiplexed streams.
//!
//! This crate provides the process-to-process call machinery of a storage
//! service: persistent caller/service connections routed by namespace,
//! byte streams embedded anywhere in call arguments and results with
//! ack-window backpressure, a single-shot HTTP variant, and cluster command
//! fan-out between a primary and its workers.
//!
//! # Example
//!
//! ```rust,ignore
//! use strand_core::{NamespaceRouter, Payload, RpcClient, RpcOptions, Service};
//!
//! #[tokio::main]
//! async fn main() -> strand_core::Result<()> {
//!     let mut diag = Service::new("diag");
//!     diag.register_sync("ping", |_env, _args| Ok(Payload::from("pong")));
//!
//!     let mut router = NamespaceRouter::new(RpcOptions::default());
//!     router.register_services([diag]);
//!     let handle = router.listen("127.0.0.1:0").await?;
//!
//!     let client = RpcClient::connect(handle.addr(), "diag", RpcOptions::default()).await?;
//!     let pong = client.call("ping", vec![]).await?;
//!     println!("{:?}", pong);
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod rpc;
pub mod stream;

mod util;

// Re-export commonly used types
pub use cluster::{ClusterWorker, CommandEnv, CommandHandlers, CommandOutcome, PrimaryHandle};
pub use config::{ClusterConfig, RpcConfig, RpcOptions};
pub use error::{FlatError, Result, RpcError};
pub use rpc::{
    CallContext, CallEnv, ConnectionState, Manifest, NamespaceRouter, RemoteMethod, RouterHandle,
    RpcClient, Service, SingleShotServer,
};
pub use stream::{ChunkSink, Payload, ReadableStream, StreamMux, WritableStream};

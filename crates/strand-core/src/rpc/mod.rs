//! Call endpoints, routing and the wire protocol.

pub mod client;
pub mod connection;
pub mod context;
pub mod protocol;
pub mod router;
pub mod service;
pub mod single_shot;

pub use client::{RemoteMethod, RpcClient};
pub use connection::{Connection, ConnectionState};
pub use context::{
    CallContext, CallEnv, ContextConsumer, ContextProducer, RequestLoggerConsumer,
    RequestUidsProducer, StaticContextProducer, SubLevelConsumer,
};
pub use protocol::WireMessage;
pub use router::{NamespaceRouter, RouterHandle};
pub use service::{async_handler, sync_handler, AsyncHandler, Manifest, Service, SyncHandler};
pub use single_shot::{SingleShotHandle, SingleShotServer};

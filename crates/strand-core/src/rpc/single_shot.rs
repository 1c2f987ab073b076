//! Single-shot RPC over HTTP.
//!
//! One request, one response, no persistent connection and no streams:
//!
//! ```text
//! POST /rpc/{namespace}   {"remoteCall": "...", "args": [...], "context": {...}}
//!                      -> {"error": null | {...}, "result": ...}
//! GET  /health         -> {"status": "ok"}
//! ```
//!
//! Calls go through the same [`Service::dispatch`] as persistent connections.

use crate::config::RpcOptions;
use crate::error::{FlatError, Result, RpcError};
use crate::rpc::connection::into_args;
use crate::rpc::context::CallContext;
use crate::rpc::service::Service;
use crate::stream::mux::contains_handle;
use crate::stream::Payload;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::ToSocketAddrs;
use tokio::sync::oneshot;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleShotCall {
    pub remote_call: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub context: CallContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleShotResponse {
    pub error: Option<FlatError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i32>,
    #[serde(default)]
    pub result: Value,
}

impl SingleShotResponse {
    fn success(result: Value) -> Self {
        Self {
            error: None,
            error_code: None,
            result,
        }
    }

    fn failure(err: &RpcError) -> Self {
        Self {
            error: Some(err.flatten()),
            error_code: Some(err.to_rpc_error_code()),
            result: Value::Null,
        }
    }
}

struct SingleShotState {
    services: HashMap<String, Arc<Service>>,
    options: RpcOptions,
}

/// Handle to a running single-shot server. Dropping shuts it down.
pub struct SingleShotHandle {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl SingleShotHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for SingleShotHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct SingleShotServer {
    services: HashMap<String, Arc<Service>>,
    options: RpcOptions,
}

impl SingleShotServer {
    pub fn new(options: RpcOptions) -> Self {
        Self {
            services: HashMap::new(),
            options,
        }
    }

    pub fn register_service(&mut self, service: Arc<Service>) -> &mut Self {
        self.services
            .insert(service.namespace().to_string(), service);
        self
    }

    pub fn register_services<I>(&mut self, services: I) -> &mut Self
    where
        I: IntoIterator<Item = Arc<Service>>,
    {
        for service in services {
            self.register_service(service);
        }
        self
    }

    /// The axum router, for embedding into a larger app.
    pub fn router(&self) -> Router {
        let state = Arc::new(SingleShotState {
            services: self.services.clone(),
            options: self.options.clone(),
        });

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/health", get(handle_health))
            .route("/rpc/:namespace", post(handle_call))
            .layer(ConcurrencyLimitLayer::new(self.options.max_connections))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(state)
    }

    pub async fn serve(&self, addr: impl ToSocketAddrs) -> Result<SingleShotHandle> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        info!("Single-shot RPC listening on {}", addr);

        tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("Single-shot server error: {}", e);
            }
        });

        Ok(SingleShotHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn handle_call(
    State(state): State<Arc<SingleShotState>>,
    Path(namespace): Path<String>,
    Json(request): Json<SingleShotCall>,
) -> impl IntoResponse {
    debug!("Single-shot call: {}.{}", namespace, request.remote_call);

    let Some(service) = state.services.get(&namespace) else {
        let err = RpcError::UnknownNamespace(namespace);
        return (StatusCode::NOT_FOUND, Json(SingleShotResponse::failure(&err)));
    };

    match run_call(service, request, &state.options).await {
        Ok(result) => (StatusCode::OK, Json(SingleShotResponse::success(result))),
        Err(err) => {
            debug!("Single-shot call on '{}' failed: {}", namespace, err);
            (StatusCode::OK, Json(SingleShotResponse::failure(&err)))
        }
    }
}

async fn run_call(service: &Service, request: SingleShotCall, options: &RpcOptions) -> Result<Value> {
    if request.args.iter().any(contains_handle) {
        return Err(RpcError::StreamingUnsupported);
    }
    let args = into_args(Payload::Scalar(Value::Array(request.args)));
    let dispatch = service.dispatch(&request.remote_call, args, request.context);
    let payload = tokio::time::timeout(options.call_timeout, dispatch)
        .await
        .map_err(|_| RpcError::Timeout {
            call: request.remote_call.clone(),
            timeout: options.call_timeout,
        })??;
    if payload.has_streams() {
        return Err(RpcError::StreamingUnsupported);
    }
    payload.into_value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ReadableStream;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn server() -> SingleShotServer {
        let mut service = Service::new("diag");
        service
            .register_sync("ping", |_env, _args| Ok(Payload::from("pong")))
            .register_sync("add", |_env, args| {
                let sum: i64 = args
                    .iter()
                    .filter_map(|a| a.as_value().and_then(Value::as_i64))
                    .sum();
                Ok(Payload::from(json!(sum)))
            })
            .register_sync("download", |_env, _args| {
                Ok(Payload::from(ReadableStream::from_chunks(["x"])))
            });
        let mut server = SingleShotServer::new(RpcOptions::default());
        server.register_service(Arc::new(service));
        server
    }

    async fn post(router: Router, uri: &str, body: Value) -> (StatusCode, SingleShotResponse) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_ping() {
        let (status, response) = post(
            server().router(),
            "/rpc/diag",
            json!({"remoteCall": "ping", "args": []}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(response.error.is_none());
        assert_eq!(response.result, json!("pong"));
    }

    #[tokio::test]
    async fn test_positional_args() {
        let (_, response) = post(
            server().router(),
            "/rpc/diag",
            json!({"remoteCall": "add", "args": [2, 3, 4]}),
        )
        .await;
        assert_eq!(response.result, json!(9));
    }

    #[tokio::test]
    async fn test_unknown_namespace_is_404() {
        let (status, response) = post(
            server().router(),
            "/rpc/missing",
            json!({"remoteCall": "ping"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(response.error_code, Some(-32001));
    }

    #[tokio::test]
    async fn test_unknown_call_is_method_not_found() {
        let (_, response) = post(
            server().router(),
            "/rpc/diag",
            json!({"remoteCall": "nope"}),
        )
        .await;
        assert_eq!(response.error_code, Some(-32601));
        assert_eq!(response.error.unwrap().code.as_deref(), Some("UnknownCall"));
    }

    #[tokio::test]
    async fn test_streams_are_rejected() {
        let (_, response) = post(
            server().router(),
            "/rpc/diag",
            json!({
                "remoteCall": "ping",
                "args": [{"streamId": "s", "readable": true, "writable": false}]
            }),
        )
        .await;
        assert_eq!(response.error.unwrap().code.as_deref(), Some("StreamUnsupported"));

        let (_, response) = post(
            server().router(),
            "/rpc/diag",
            json!({"remoteCall": "download"}),
        )
        .await;
        assert_eq!(response.error_code, Some(-32602));
        assert_eq!(response.error.unwrap().code.as_deref(), Some("StreamUnsupported"));
    }

    #[tokio::test]
    async fn test_health() {
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = server().router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

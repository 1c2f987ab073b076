//! End-to-end tests over real localhost TCP connections.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use strand_core::rpc::StaticContextProducer;
use strand_core::{
    CallContext, ChunkSink, ConnectionState, FlatError, NamespaceRouter, Payload, ReadableStream,
    RouterHandle, RpcClient, RpcError, RpcOptions, Service, WritableStream,
};

fn storage_service() -> Service {
    let mut service = Service::new("storage").with_api_version("3.2.1");
    service
        .register_sync("ping", |_env, _args| Ok(Payload::from("pong")))
        .register_sync("whoami", |env, _args| {
            Ok(Payload::from(json!({
                "reqUids": env.req_uids,
                "subLevel": env.sub_level,
            })))
        })
        .register_sync("download", |_env, _args| {
            Ok(Payload::from(ReadableStream::from_chunks(["a", "b", "c"])))
        })
        .register_sync("fail", |_env, _args| {
            Err(RpcError::Handler {
                message: "ObjectNotFound".to_string(),
                code: Some("NoSuchKey".to_string()),
                properties: [("bucket".to_string(), json!("photos"))].into_iter().collect(),
            })
        })
        .register_async("slow", |_env, args| async move {
            let delay = args
                .first()
                .and_then(Payload::as_value)
                .and_then(Value::as_u64)
                .unwrap_or(2000);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(Payload::from("finally"))
        })
        .register_async("upload", |_env, mut args| async move {
            let source = args
                .pop()
                .and_then(Payload::into_readable)
                .ok_or_else(|| RpcError::handler("upload expects a readable"))?;
            let chunks = source.collect_chunks().await?;
            let text: Vec<String> = chunks
                .iter()
                .map(|c| String::from_utf8_lossy(c).into_owned())
                .collect();
            Ok(Payload::from(json!(text)))
        })
        .register_async("fill", |_env, mut args| async move {
            let sink = args
                .pop()
                .and_then(Payload::into_writable)
                .ok_or_else(|| RpcError::handler("fill expects a writable"))?;
            sink.pipe_from(ReadableStream::from_chunks(["x", "y", "z"])).await?;
            Ok(Payload::null())
        })
        .register_async("pushUntilBlocked", |_env, mut args| async move {
            let mut sink = args
                .pop()
                .and_then(Payload::into_writable)
                .ok_or_else(|| RpcError::handler("expects a writable"))?;
            let mut completed = 0u64;
            for i in 0..10 {
                let write = sink.write(format!("chunk-{}", i));
                match tokio::time::timeout(Duration::from_millis(200), write).await {
                    Ok(Ok(())) => completed += 1,
                    _ => break,
                }
            }
            Ok(Payload::from(json!(completed)))
        });
    service
}

async fn start(options: RpcOptions) -> RouterHandle {
    let mut router = NamespaceRouter::new(options);
    router.register_services([storage_service()]);
    router.listen("127.0.0.1:0").await.unwrap()
}

async fn connect(handle: &RouterHandle) -> RpcClient {
    RpcClient::connect(handle.addr(), "storage", RpcOptions::default())
        .await
        .unwrap()
}

/// Sink that never accepts anything, so no ack is ever sent.
struct StuckSink;

#[async_trait]
impl ChunkSink for StuckSink {
    async fn write(&mut self, _chunks: Vec<Bytes>) -> strand_core::Result<()> {
        futures::future::pending::<()>().await;
        Ok(())
    }

    async fn end(&mut self) -> strand_core::Result<()> {
        Ok(())
    }

    async fn abort(&mut self, _error: FlatError) {}
}

#[tokio::test]
async fn test_manifest_exposes_every_registered_call() {
    let handle = start(RpcOptions::default()).await;
    let client = connect(&handle).await;

    let names: Vec<String> = client.methods().iter().map(|m| m.name().to_string()).collect();
    assert_eq!(
        names,
        vec!["download", "fail", "fill", "ping", "pushUntilBlocked", "slow", "upload", "whoami"]
    );
    assert_eq!(client.manifest().version, "3.2.1");
}

#[tokio::test]
async fn test_ping_returns_pong() {
    let handle = start(RpcOptions::default()).await;
    let client = connect(&handle).await;
    let ping = client.method("ping").unwrap();
    let result = ping.call(vec![]).await.unwrap();
    assert_eq!(result.as_str(), Some("pong"));
}

#[tokio::test]
async fn test_short_timeout_beats_slow_handler() {
    let handle = start(RpcOptions::default()).await;
    let client = connect(&handle).await;

    let started = Instant::now();
    let err = client
        .call_with_timeout("slow", vec![Payload::from(json!(2000))], Duration::from_millis(200))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_timeout());
    assert_eq!(err.code(), "RequestTimeout");
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(1000), "took {:?}", elapsed);
}

#[tokio::test]
async fn test_late_result_after_timeout_is_discarded() {
    let handle = start(RpcOptions::default()).await;
    let client = connect(&handle).await;

    let err = client
        .call_with_timeout("slow", vec![Payload::from(json!(300))], Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    // Let the late result arrive; the connection must keep working.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.state(), ConnectionState::Connected);
    let result = client.call("ping", vec![]).await.unwrap();
    assert_eq!(result.as_str(), Some("pong"));
}

#[tokio::test]
async fn test_concurrent_calls_complete_independently() {
    let handle = start(RpcOptions::default()).await;
    let client = connect(&handle).await;

    let slow = client.call("slow", vec![Payload::from(json!(200))]);
    let fast = client.call("ping", vec![]);
    let (slow, fast) = tokio::join!(slow, fast);
    assert_eq!(slow.unwrap().as_str(), Some("finally"));
    assert_eq!(fast.unwrap().as_str(), Some("pong"));
}

#[tokio::test]
async fn test_handler_error_keeps_message_code_and_properties() {
    let handle = start(RpcOptions::default()).await;
    let client = connect(&handle).await;

    let err = client.call("fail", vec![]).await.unwrap_err();
    assert_eq!(err.message(), "ObjectNotFound");
    assert_eq!(err.code(), "NoSuchKey");
    match err {
        RpcError::Remote(flat) => assert_eq!(flat.properties["bucket"], json!("photos")),
        other => panic!("expected remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unadvertised_call_is_rejected_locally() {
    let handle = start(RpcOptions::default()).await;
    let client = connect(&handle).await;
    let err = client.call("deleteEverything", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::UnknownCall { .. }));
    assert!(client.method("deleteEverything").is_err());
}

#[tokio::test]
async fn test_request_context_is_one_shot() {
    let handle = start(RpcOptions::default()).await;
    let client = connect(&handle).await;

    let first = client
        .with_request_context(CallContext::new().with_req_uids("trace-1"))
        .call("whoami", vec![])
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(first["reqUids"], json!("trace-1"));

    let second = client.call("whoami", vec![]).await.unwrap().into_value().unwrap();
    assert_ne!(second["reqUids"], json!("trace-1"));
    assert!(second["reqUids"].as_str().is_some_and(|s| !s.is_empty()));
}

#[tokio::test]
async fn test_producers_run_in_order() {
    let handle = start(RpcOptions::default()).await;
    let client = connect(&handle)
        .await
        .with_producer(StaticContextProducer(
            CallContext::new().with_sub_level(["photos", "2024"]),
        ));
    let result = client.call("whoami", vec![]).await.unwrap().into_value().unwrap();
    assert_eq!(result["subLevel"], json!(["photos", "2024"]));
}

#[tokio::test]
async fn test_readable_argument_round_trip() {
    let handle = start(RpcOptions::default()).await;
    let client = connect(&handle).await;

    let source = ReadableStream::from_chunks(["a", "b", "c"]);
    let result = client
        .call("upload", vec![Payload::from(source)])
        .await
        .unwrap();
    assert_eq!(result.into_value().unwrap(), json!(["a", "b", "c"]));
}

#[tokio::test]
async fn test_readable_result_round_trip() {
    let handle = start(RpcOptions::default()).await;
    let client = connect(&handle).await;

    let readable = client
        .call("download", vec![])
        .await
        .unwrap()
        .into_readable()
        .unwrap();
    let chunks = readable.collect_chunks().await.unwrap();
    assert_eq!(chunks, vec!["a", "b", "c"]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.stream_counts(), (0, 0));
}

#[tokio::test]
async fn test_writable_argument_is_filled_remotely() {
    let handle = start(RpcOptions::default()).await;
    let client = connect(&handle).await;

    let (sink, reader) = WritableStream::channel(4);
    let (result, bytes) = tokio::join!(
        client.call("fill", vec![Payload::from(sink)]),
        reader.read_to_end()
    );
    result.unwrap();
    assert_eq!(bytes.unwrap(), b"xyz".to_vec());
}

#[tokio::test]
async fn test_backpressure_holds_writes_beyond_window() {
    let options = RpcOptions::default()
        .with_stream_max_pending_ack(2)
        .with_stream_ack_timeout(Duration::from_secs(10));
    let handle = start(options).await;
    let client = connect(&handle).await;

    let result = client
        .call("pushUntilBlocked", vec![Payload::from(WritableStream::new(StuckSink))])
        .await
        .unwrap();
    assert_eq!(result.as_value(), Some(&json!(2)));
}

#[tokio::test]
async fn test_router_shutdown_disconnects_caller() {
    let mut handle = start(RpcOptions::default()).await;
    let client = connect(&handle).await;

    let pending = client.call("slow", vec![Payload::from(json!(5000))]);
    let shutdown = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown();
    };
    let (outcome, _) = tokio::join!(pending, shutdown);
    assert!(matches!(outcome, Err(RpcError::Disconnected)));

    tokio::time::timeout(Duration::from_secs(2), client.closed())
        .await
        .unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(matches!(
        client.call("ping", vec![]).await,
        Err(RpcError::Disconnected)
    ));
}

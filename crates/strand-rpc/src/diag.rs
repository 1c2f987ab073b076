//! Built-in `diag` namespace for checking a running router end to end.

use bytes::Bytes;
use serde_json::{json, Value};
use std::time::Duration;
use strand_core::{Payload, ReadableStream, RpcError, RpcOptions, Service};
use tracing::debug;

pub const NAMESPACE: &str = "diag";

const DEFAULT_CHUNK_COUNT: u64 = 4;
const DEFAULT_CHUNK_SIZE: u64 = 1024;
const MAX_CHUNK_SIZE: u64 = 1024 * 1024;

fn u64_arg(args: &[Payload], index: usize) -> Option<u64> {
    args.get(index)
        .and_then(Payload::as_value)
        .and_then(Value::as_u64)
}

pub fn service(options: &RpcOptions) -> Service {
    let mut service = Service::new(NAMESPACE).with_api_version(options.api_version.clone());
    service
        .register_sync("ping", |_env, _args| Ok(Payload::from("pong")))
        .register_sync("echo", |_env, mut args| {
            if args.len() == 1 {
                return Ok(args.remove(0));
            }
            Ok(Payload::list(args))
        })
        .register_async("sleep", |env, args| async move {
            let ms = u64_arg(&args, 0).unwrap_or(0);
            debug!("{}: sleeping {}ms", env.call, ms);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(Payload::from(json!(ms)))
        })
        .register_async("upload", |_env, mut args| async move {
            let mut source = args
                .pop()
                .and_then(Payload::into_readable)
                .ok_or_else(|| RpcError::InvalidArgs {
                    call: "upload".to_string(),
                    message: "expected a readable stream".to_string(),
                })?;
            let mut chunks = 0u64;
            let mut bytes = 0u64;
            while let Some(chunk) = source.next_chunk().await {
                let chunk = chunk?;
                chunks += 1;
                bytes += chunk.len() as u64;
            }
            Ok(Payload::from(json!({ "chunks": chunks, "bytes": bytes })))
        })
        .register_sync("download", |_env, args| {
            let count = u64_arg(&args, 0).unwrap_or(DEFAULT_CHUNK_COUNT);
            let size = u64_arg(&args, 1).unwrap_or(DEFAULT_CHUNK_SIZE);
            if size > MAX_CHUNK_SIZE {
                return Err(RpcError::InvalidArgs {
                    call: "download".to_string(),
                    message: format!("chunk size {} exceeds {}", size, MAX_CHUNK_SIZE),
                });
            }
            let chunk = Bytes::from(vec![b'x'; size as usize]);
            Ok(Payload::from(ReadableStream::from_chunks(
                (0..count).map(move |_| chunk.clone()),
            )))
        });
    service
}

//! Integration tests for the strand-rpc binary.
//!
//! These spawn the built binary, read the ports it announces on stdout and
//! talk to both listeners the way an external client would.

use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use strand_core::{Payload, ReadableStream, RpcClient, RpcOptions};
use tokio::io::AsyncBufReadExt;

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_strand-rpc"))
}

struct ServerHandle {
    child: tokio::process::Child,
    rpc_port: u16,
    http_port: u16,
    stdout_drain: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.start_kill();
    }
}

fn parse_port(line: &str, prefix: &str) -> Option<u16> {
    line.strip_prefix(prefix)
        .and_then(|value| value.trim().parse::<u16>().ok())
}

/// Start `strand-rpc serve` and wait for both port lines.
async fn start_server(extra_args: &[&str]) -> Result<ServerHandle, String> {
    let mut child = tokio::process::Command::new(binary())
        .arg("serve")
        .args(["--host", "127.0.0.1", "--port", "0", "--http-port", "0"])
        .args(extra_args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn strand-rpc: {e}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let mut rpc_port = None;
    let mut http_port = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while tokio::time::Instant::now() < deadline && (rpc_port.is_none() || http_port.is_none()) {
        match tokio::time::timeout(Duration::from_millis(250), lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                rpc_port = rpc_port.or_else(|| parse_port(&line, "RPC_PORT="));
                http_port = http_port.or_else(|| parse_port(&line, "HTTP_PORT="));
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => return Err(format!("failed to read strand-rpc stdout: {err}")),
            Err(_) => continue,
        }
    }

    let rpc_port = rpc_port.ok_or_else(|| "RPC_PORT line not emitted".to_string())?;
    let http_port = http_port.ok_or_else(|| "HTTP_PORT line not emitted".to_string())?;
    let stdout_drain =
        tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

    Ok(ServerHandle {
        child,
        rpc_port,
        http_port,
        stdout_drain: Some(stdout_drain),
    })
}

async fn single_shot(port: u16, namespace: &str, body: Value) -> (u16, Value) {
    let response = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/rpc/{}", port, namespace))
        .json(&body)
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.json::<Value>().await.unwrap())
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = start_server(&[]).await.unwrap();
    let response = reqwest::get(format!("http://127.0.0.1:{}/health", server.http_port))
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(response["status"], json!("ok"));
}

#[tokio::test]
async fn test_single_shot_ping() {
    let server = start_server(&[]).await.unwrap();
    let (status, body) = single_shot(
        server.http_port,
        "diag",
        json!({"remoteCall": "ping", "args": [], "context": {}}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["result"], json!("pong"));
    assert!(body["error"].is_null());
}

#[tokio::test]
async fn test_single_shot_unknown_namespace() {
    let server = start_server(&[]).await.unwrap();
    let (status, body) = single_shot(
        server.http_port,
        "nope",
        json!({"remoteCall": "ping", "args": []}),
    )
    .await;
    assert_eq!(status, 404);
    assert!(body["error"]["message"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn test_router_serves_diag_with_streams() {
    let server = start_server(&["--api-version", "9.9.9"]).await.unwrap();
    let client = RpcClient::connect(("127.0.0.1", server.rpc_port), "diag", RpcOptions::default())
        .await
        .unwrap();
    assert_eq!(client.manifest().version, "9.9.9");

    let echoed = client
        .call("echo", vec![Payload::from(json!({"k": [1, 2]}))])
        .await
        .unwrap();
    assert_eq!(echoed.into_value().unwrap(), json!({"k": [1, 2]}));

    let summary = client
        .call("upload", vec![Payload::from(ReadableStream::from_chunks(["ab", "cde"]))])
        .await
        .unwrap();
    assert_eq!(summary.into_value().unwrap(), json!({"chunks": 2, "bytes": 5}));

    let readable = client
        .call("download", vec![Payload::from(json!(5)), Payload::from(json!(8))])
        .await
        .unwrap()
        .into_readable()
        .unwrap();
    assert_eq!(readable.read_to_end().await.unwrap().len(), 40);
}

#[tokio::test]
async fn test_call_subcommand_prints_result() {
    let server = start_server(&[]).await.unwrap();
    let output = tokio::process::Command::new(binary())
        .arg("call")
        .args(["--port", &server.rpc_port.to_string(), "echo", "{\"a\":1}"])
        .stderr(Stdio::null())
        .output()
        .await
        .unwrap();
    assert!(output.status.success());
    let printed: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(printed, json!({"a": 1}));
}

#[tokio::test]
async fn test_call_subcommand_fails_on_unknown_call() {
    let server = start_server(&[]).await.unwrap();
    let output = tokio::process::Command::new(binary())
        .arg("call")
        .args(["--port", &server.rpc_port.to_string(), "missing"])
        .stderr(Stdio::null())
        .output()
        .await
        .unwrap();
    assert!(!output.status.success());
}

#[tokio::test]
async fn test_cluster_subcommand_collects_every_worker() {
    let output = tokio::time::timeout(
        Duration::from_secs(30),
        tokio::process::Command::new(binary())
            .args(["cluster", "--workers", "3", "--handler", "stats", "--timeout-ms", "10000"])
            .stderr(Stdio::null())
            .output(),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(output.status.success());

    let report: Value = serde_json::from_slice(&output.stdout).unwrap();
    let results = report["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    for (index, outcome) in results.iter().enumerate() {
        assert_eq!(outcome["result"]["workerId"], json!(index + 1));
    }
}

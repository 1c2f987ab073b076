//! Strand RPC - namespaced RPC router, single-shot endpoint and cluster CLI.
//!
//! `serve` prints `RPC_PORT=` and `HTTP_PORT=` lines on stdout once both
//! listeners are bound, so a parent process can discover auto-assigned ports.

mod cluster;
mod diag;
mod server;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::time::Duration;
use strand_core::{CallContext, ClusterConfig, Payload, RpcClient, RpcConfig, RpcOptions};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "strand-rpc")]
#[command(about = "Namespaced RPC with multiplexed streams")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Host the router and the single-shot HTTP endpoint
    Serve(ServeArgs),
    /// Make one call against a running router
    Call(CallArgs),
    /// Spawn workers, fan out one command and print the aggregate
    Cluster(ClusterArgs),
    /// Run as a cluster worker over stdin/stdout
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Router port (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Single-shot HTTP port (0 = auto-assign)
    #[arg(long, default_value = "0")]
    http_port: u16,

    #[command(flatten)]
    tuning: TuningArgs,
}

#[derive(Args, Debug)]
struct TuningArgs {
    /// Default call timeout in milliseconds
    #[arg(long, default_value_t = RpcConfig::CALL_TIMEOUT.as_millis() as u64)]
    call_timeout_ms: u64,

    /// Stream chunks a producer may send before it waits for an ack
    #[arg(long, default_value_t = RpcConfig::STREAM_MAX_PENDING_ACK)]
    stream_max_pending_ack: usize,

    /// How long a sent chunk may stay unacknowledged, in milliseconds
    #[arg(long, default_value_t = RpcConfig::STREAM_ACK_TIMEOUT.as_millis() as u64)]
    stream_ack_timeout_ms: u64,

    /// Version advertised in service manifests
    #[arg(long, default_value = RpcConfig::API_VERSION)]
    api_version: String,
}

impl TuningArgs {
    fn options(&self) -> RpcOptions {
        RpcOptions::default()
            .with_call_timeout(Duration::from_millis(self.call_timeout_ms))
            .with_stream_max_pending_ack(self.stream_max_pending_ack)
            .with_stream_ack_timeout(Duration::from_millis(self.stream_ack_timeout_ms))
            .with_api_version(self.api_version.clone())
    }
}

#[derive(Args, Debug)]
struct CallArgs {
    /// Router host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Router port
    #[arg(short, long)]
    port: u16,

    /// Namespace to bind to
    #[arg(short, long, default_value = diag::NAMESPACE)]
    namespace: String,

    /// Call name
    call: String,

    /// Arguments, each parsed as JSON or taken as a string
    args: Vec<String>,

    /// Call timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Request id to send in the call context
    #[arg(long)]
    req_uids: Option<String>,
}

#[derive(Args, Debug)]
struct ClusterArgs {
    /// Number of worker processes
    #[arg(short, long, default_value = "2")]
    workers: usize,

    /// Worker handler to run everywhere
    #[arg(long, default_value = "stats")]
    handler: String,

    /// JSON payload for the handler
    #[arg(long, default_value = "null")]
    payload: String,

    /// Command timeout in milliseconds (0 = wait forever)
    #[arg(long, default_value_t = ClusterConfig::COMMAND_TIMEOUT.as_millis() as u64)]
    timeout_ms: u64,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    /// Handler to fan out once this worker is attached
    #[arg(long)]
    originate: Option<String>,

    #[arg(long, requires = "originate")]
    uids: Option<String>,

    #[arg(long, default_value = "null")]
    payload: String,

    #[arg(long, default_value_t = ClusterConfig::COMMAND_TIMEOUT.as_millis() as u64)]
    timeout_ms: u64,
}

/// Parse a CLI argument as JSON, falling back to a plain string.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Worker stdout carries cluster frames, so all logging goes to stderr.
    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Call(args) => call(args).await,
        Commands::Cluster(args) => {
            let payload = parse_arg(&args.payload);
            let report = cluster::run_cluster(
                args.workers,
                &args.handler,
                payload,
                Duration::from_millis(args.timeout_ms),
                cli.debug,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Worker(args) => {
            let originate = args.originate.map(|handler| cluster::Originate {
                uids: args
                    .uids
                    .unwrap_or_else(|| format!("worker-{}", std::process::id())),
                handler,
                payload: parse_arg(&args.payload),
                timeout: Duration::from_millis(args.timeout_ms),
            });
            cluster::run_worker(originate).await
        }
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    info!("Starting Strand RPC");

    let options = args.tuning.options();
    let servers = server::start_servers(options, &args.host, args.port, args.http_port).await?;

    // Port lines are read by parent processes (intentional stdout)
    println!("RPC_PORT={}", servers.router.port());
    println!("HTTP_PORT={}", servers.http.port());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    Ok(())
}

async fn call(args: CallArgs) -> Result<()> {
    let addr = format!("{}:{}", args.host, args.port);
    let client = RpcClient::connect(addr.as_str(), args.namespace.as_str(), RpcOptions::default())
        .await
        .with_context(|| format!("cannot bind to '{}' at {}", args.namespace, addr))?;

    if let Some(req_uids) = args.req_uids {
        client.with_request_context(CallContext::new().with_req_uids(req_uids));
    }
    let call_args = args.args.iter().map(|raw| Payload::from(parse_arg(raw))).collect();
    let result = match args.timeout_ms {
        Some(ms) => {
            client
                .call_with_timeout(&args.call, call_args, Duration::from_millis(ms))
                .await?
        }
        None => client.call(&args.call, call_args).await?,
    };

    match result {
        Payload::Readable(readable) => {
            let bytes = readable.read_to_end().await?;
            println!("{}", String::from_utf8_lossy(&bytes));
        }
        other => println!("{}", serde_json::to_string_pretty(&other.into_value()?)?),
    }
    client.close();
    Ok(())
}

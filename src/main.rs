use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use clushead::config::{Settings, DEFAULT_PORT};
use clushead::dispatch::JobDispatcher;
use clushead::grpc::{GrpcServer, HeadnodeService};
use clushead::registry::validator::Validator;
use clushead::registry::NodeRegistry;
use clushead::shutdown::install_shutdown_handler;
use clushead::store::MemoryJobStore;
use clushead::worker::GrpcWorkerClient;

#[derive(Parser, Debug)]
#[command(name = "clushead")]
#[command(about = "Head node of a compute cluster: dispatches commands across clusnodes")]
struct Args {
    /// Port to listen on for gRPC
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Address workers use to reach this head node (host:port).
    /// Defaults to "<hostname>:<port>"
    #[arg(long)]
    node_host: Option<String>,

    /// Port assumed for worker hosts that omit one
    #[arg(long, default_value_t = DEFAULT_PORT)]
    default_port: u16,

    /// Seconds without a heartbeat before a node is considered lost
    #[arg(long, default_value = "30")]
    heartbeat_timeout: u64,

    /// Seconds allowed for dialing a worker during dispatch and cancel
    #[arg(long, default_value = "5")]
    connect_timeout: u64,

    /// Directory for persisted job output
    #[arg(long, default_value = "job-output")]
    output_dir: PathBuf,

    /// Disable persisting worker output to files
    #[arg(long)]
    no_store_output: bool,

    /// Include the thread id in log lines
    #[arg(long)]
    log_thread_id: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_thread_ids(args.log_thread_id)
        .init();

    let node_host = args.node_host.clone().unwrap_or_else(|| {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        format!("{hostname}:{}", args.port)
    });
    let settings = Arc::new(Settings::new(
        node_host,
        args.default_port,
        Duration::from_secs(args.connect_timeout),
        args.output_dir,
    ));
    settings.set_heartbeat_timeout_secs(args.heartbeat_timeout);
    settings.set_store_output(!args.no_store_output);
    settings.set_log_thread_id(args.log_thread_id);

    let registry = Arc::new(NodeRegistry::new(settings.clone()));
    let store = Arc::new(MemoryJobStore::new(settings.output_dir.clone()));
    let worker = Arc::new(GrpcWorkerClient);
    let validator = Validator::new(registry.clone(), worker.clone(), settings.clone());
    let dispatcher = JobDispatcher::new(
        registry.clone(),
        store.clone(),
        worker.clone(),
        settings.clone(),
    );
    let service = HeadnodeService::new(registry, validator, dispatcher, store, settings.clone());

    tracing::info!(
        node_host = %settings.node_host,
        port = args.port,
        "Starting clushead node"
    );

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let shutdown = install_shutdown_handler();
    GrpcServer::new(listen_addr, service).run(shutdown).await?;

    Ok(())
}

//! Ingress side of the tunnel: accepts TCP clients on the configured local
//! points and forwards them over the UDP trunk.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::process::exit;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use byte_stacker::args::{parse_tcp_point, parse_trunk};
use byte_stacker::connect_id::PointId;
use byte_stacker::out_link::OutLink;
use byte_stacker::trunk::TrunkClient;

const LOCAL_PREFIX: &str = "--local";
const TRUNK_PREFIX: &str = "--trunk=";

fn print_help() {
    println!("byte_stacker_in");
    println!(
        "byte_stacker_in --local1=ip:port [--local2=ip:port ...] --trunk=ip:port1,port2..."
    );
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        print_help();
        exit(1);
    }

    let mut local_points: BTreeMap<PointId, SocketAddr> = BTreeMap::new();
    let mut trunk_points: Vec<SocketAddr> = Vec::new();

    for arg in &args {
        if let Some(rest) = arg.strip_prefix(TRUNK_PREFIX) {
            match parse_trunk(rest) {
                Some(points) => trunk_points = points,
                None => {
                    eprintln!("malformed trunk argument: {}", arg);
                    exit(2);
                }
            }
        } else if let Some(rest) = arg.strip_prefix(LOCAL_PREFIX) {
            match parse_tcp_point(rest) {
                Some((id, endpoint)) => {
                    local_points.insert(id, endpoint);
                }
                None => {
                    eprintln!("malformed local point argument: {}", arg);
                    exit(2);
                }
            }
        }
    }

    if local_points.is_empty() {
        eprintln!("WARNING: there are no local points");
        exit(3);
    }
    if trunk_points.is_empty() {
        eprintln!("WARNING: there are no trunk points");
        exit(3);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .expect("failed to build the tokio runtime");

    if let Err(e) = runtime.block_on(run(local_points, trunk_points)) {
        eprintln!("Error: {:#}", e);
        exit(1);
    }
}

async fn run(
    local_points: BTreeMap<PointId, SocketAddr>,
    trunk_points: Vec<SocketAddr>,
) -> anyhow::Result<()> {
    let client = TrunkClient::new(&trunk_points).await?;

    for (point, endpoint) in local_points {
        let listener = TcpListener::bind(endpoint).await?;
        info!("listening on {} for point {}", endpoint, point);
        tokio::spawn(listen_local_point(client.clone(), point, listener));
    }

    wait_for_shutdown().await
}

/// Accept loop for one local point. Every accepted socket becomes a new
/// virtual connection.
async fn listen_local_point(client: Arc<TrunkClient>, point: PointId, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                debug!("accepted connection from {:?} for point {}", peer, point);
                client.add_connect(point, OutLink::from_socket(socket)).await;
            }
            Err(e) => {
                warn!("accept failed for point {}: {}", point, e);
            }
        }
    }
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("cannot listen for SIGINT: {}", e);
            }
        }
        _ = sigterm.recv() => {}
    }
    info!("shutting down");
    Ok(())
}

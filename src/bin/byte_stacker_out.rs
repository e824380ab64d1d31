//! Egress side of the tunnel: terminates virtual connections from the UDP
//! trunk by dialling the configured external points.

use std::net::SocketAddr;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use byte_stacker::args::{parse_point, parse_trunk};
use byte_stacker::connect_id::PointId;
use byte_stacker::out_link::OutLink;
use byte_stacker::trunk::TrunkServer;

const EXTERNAL_PREFIX: &str = "--external";
const TRUNK_PREFIX: &str = "--trunk=";
const WORKER_THREADS: usize = 4;
const INFORMATION_INTERVAL: Duration = Duration::from_secs(10);

fn print_help() {
    println!("byte_stacker_out");
    println!(
        "byte_stacker_out --external1=ip:port [--external2=ip:port ...] --trunk=ip:port1,port2..."
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

    let mut external_points: FxHashMap<PointId, (String, u16)> = FxHashMap::default();
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
        } else if let Some(rest) = arg.strip_prefix(EXTERNAL_PREFIX) {
            match parse_point(rest) {
                Some((id, host, port)) => {
                    external_points.insert(id, (host, port));
                }
                None => {
                    eprintln!("malformed external point argument: {}", arg);
                    exit(2);
                }
            }
        }
    }

    if external_points.is_empty() {
        eprintln!("needs some external points");
        exit(3);
    }
    if trunk_points.is_empty() {
        eprintln!("needs some trunk points");
        exit(3);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(WORKER_THREADS)
        .enable_all()
        .build()
        .expect("failed to build the tokio runtime");

    if let Err(e) = runtime.block_on(run(external_points, trunk_points)) {
        eprintln!("Error: {:#}", e);
        exit(1);
    }
}

async fn run(
    external_points: FxHashMap<PointId, (String, u16)>,
    trunk_points: Vec<SocketAddr>,
) -> anyhow::Result<()> {
    let server = TrunkServer::new(
        &trunk_points,
        Box::new(move |point| {
            external_points
                .get(&point)
                .map(|(host, port)| OutLink::from_address(host.clone(), *port))
        }),
    )
    .await?;
    for addr in server.local_addrs() {
        info!("trunk endpoint bound on {}", addr);
    }

    tokio::spawn(print_information(server.clone()));

    wait_for_shutdown().await
}

async fn print_information(server: Arc<TrunkServer>) {
    let mut tick = time::interval(INFORMATION_INTERVAL);
    tick.tick().await; // the first tick fires immediately
    loop {
        tick.tick().await;
        let stats = server.stats();
        println!("-----");
        println!(
            "Out: {} kByte, In: {} kByte, Cnt: {}",
            stats.bytes_to_links / 1024,
            stats.bytes_from_links / 1024,
            stats.connections
        );
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

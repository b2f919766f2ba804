//! renb GTP-U Daemon
//!
//! Terminates the S1-U reference point toward the mobile core and,
//! optionally, the M1-U reference point for MBSFN broadcast traffic. Per
//! bearer it maintains the inbound/outbound tunnel pair, demultiplexes
//! arriving G-PDUs, and drives the indirect-forwarding and
//! path-switch-with-buffering procedures during handover.

pub mod context;
pub mod gtp_path;
pub mod mcast;
pub mod pdcp;

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use gtp_path::{open_s1u_socket, run_s1u_rx, GtpuEndpoint, UdpTransport};
use mcast::{open_m1u_socket, run_m1u_rx, M1uHandler};
use pdcp::CountingPdcp;
use renb_gtp::GTPU_PORT;

/// renb GTP-U user-plane daemon
#[derive(Parser, Debug)]
#[command(name = "renb-gtpud")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "eNB GTP-U user-plane endpoint", long_about = None)]
struct Args {
    /// Local S1-U bind address
    #[arg(long, default_value = "127.0.0.1")]
    gtp_bind_addr: Ipv4Addr,

    /// MME address (kept for operator logs; the user plane never dials it)
    #[arg(long, default_value = "127.0.1.100")]
    mme_addr: Ipv4Addr,

    /// M1-U multicast group
    #[arg(long, default_value = "239.255.0.1")]
    m1u_multiaddr: Ipv4Addr,

    /// Interface address the M1-U socket listens on
    #[arg(long, default_value = "127.0.1.1")]
    m1u_if_addr: Ipv4Addr,

    /// Enable the MBSFN (M1-U) endpoint
    #[arg(long, default_value = "false")]
    enable_mbsfn: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'e', long, default_value = "info")]
    log_level: String,

    /// Disable color output
    #[arg(short = 'm', long)]
    no_color: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    log::info!("renb-gtpud v{} starting...", env!("CARGO_PKG_VERSION"));

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    // One socket serves both directions: the original fd feeds the async rx
    // loop, a clone is the egress path. The shared non-blocking flag turns a
    // full send buffer into a logged drop instead of a stalled pump.
    let s1u_socket = open_s1u_socket(args.gtp_bind_addr)?;
    let tx_socket = s1u_socket.try_clone().context("Failed to clone S1-U socket")?;
    s1u_socket.set_nonblocking(true)?;
    let s1u_socket = tokio::net::UdpSocket::from_std(s1u_socket)?;

    let pdcp = Arc::new(CountingPdcp::default());
    let endpoint = Arc::new(GtpuEndpoint::new(
        Arc::new(UdpTransport::new(tx_socket)),
        pdcp.clone(),
    ));
    log::info!(
        "S1-U serving on {}:{GTPU_PORT}, MME at {}",
        args.gtp_bind_addr,
        args.mme_addr
    );

    let s1u_task = tokio::spawn(run_s1u_rx(endpoint.clone(), s1u_socket, shutdown.clone()));

    let m1u_task = if args.enable_mbsfn {
        let m1u_socket = open_m1u_socket(args.m1u_multiaddr, args.m1u_if_addr)?;
        m1u_socket.set_nonblocking(true)?;
        let m1u_socket = tokio::net::UdpSocket::from_std(m1u_socket)?;
        let handler = Arc::new(M1uHandler::new(pdcp.clone()));
        Some(tokio::spawn(run_m1u_rx(handler, m1u_socket, shutdown.clone())))
    } else {
        None
    };

    let stats_task = tokio::spawn(dump_stats(endpoint.clone(), pdcp.clone()));

    log::info!("renb-gtpud ready");

    while !shutdown.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
    }

    log::info!("Shutting down...");
    s1u_task.abort();
    if let Some(task) = m1u_task {
        task.abort();
    }
    stats_task.abort();

    log::info!("renb-gtpud stopped");
    Ok(())
}

/// Initialize logging based on command line arguments
fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };
    builder.filter_level(level);
    builder.format_timestamp_millis();

    if args.no_color {
        builder.write_style(env_logger::WriteStyle::Never);
    }

    builder.init();
}

/// Set up signal handlers for graceful shutdown
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    Ok(())
}

/// Periodically log traffic counters when they moved.
async fn dump_stats(endpoint: Arc<GtpuEndpoint>, pdcp: Arc<CountingPdcp>) {
    let mut last = endpoint.counters.snapshot();
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(5));
    loop {
        interval.tick().await;
        let now = endpoint.counters.snapshot();
        if now == last {
            continue;
        }
        log::info!(
            "S1-U rx pkts={} bytes={} tx pkts={} bytes={} | DL delivered pkts={} bytes={} | tunnels={}",
            now.rx_pkts,
            now.rx_bytes,
            now.tx_pkts,
            now.tx_bytes,
            pdcp.dl_pkts.load(Ordering::Relaxed),
            pdcp.dl_bytes.load(Ordering::Relaxed),
            endpoint.tunnel_count()
        );
        if now.rx_dropped != last.rx_dropped || now.tx_dropped != last.tx_dropped {
            log::warn!(
                "S1-U DROPS rx={} tx={}",
                now.rx_dropped,
                now.tx_dropped
            );
        }
        last = now;
    }
}

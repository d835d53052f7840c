use std::io;

use clap::Parser;
use rtsp::{Options, Server};
use tracing_subscriber::EnvFilter;

/// Standalone RTSP media server for live and file-backed streams.
///
/// Live streams are reached by number (rtsp://host/0); file streams by
/// path (rtsp://host/clips/demo.264, an H.264 elementary stream).
#[derive(Parser)]
#[command(name = "rtspd", about = "RTSP media server")]
struct Args {
    /// Bind address
    #[arg(long, short, default_value = "0.0.0.0")]
    bind: String,

    /// RTSP port to listen on
    #[arg(long, short, default_value_t = 554)]
    port: u16,

    /// RTP packet size in bytes
    #[arg(long, default_value_t = 1456)]
    packet_size: usize,

    /// Frames per second for file streams
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// RTP timestamp clock for file streams, in Hz
    #[arg(long, default_value_t = 90_000)]
    ts_clock: u32,

    /// TCP send buffer size for interleaved clients (0 keeps the OS default)
    #[arg(long, default_value_t = 0)]
    send_buff_size: usize,

    /// TCP receive buffer size for control connections (0 keeps the OS default)
    #[arg(long, default_value_t = 0)]
    recv_buff_size: usize,

    /// Do not set TCP_NODELAY on interleaved clients
    #[arg(long)]
    no_tcp_nodelay: bool,

    /// Set TCP_CORK on interleaved clients
    #[arg(long)]
    tcp_cork: bool,

    /// Enable receiver-report driven congestion control
    #[arg(long, short = 'e')]
    temporal_levels: bool,

    /// Seconds without loss before a client's rate increases again
    #[arg(long, default_value_t = 60)]
    increase_time: u64,

    /// Gap between packet sends in nanoseconds (0 disables pacing)
    #[arg(long, default_value_t = 0)]
    packet_gap: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let options = Options {
        packet_size: args.packet_size,
        fps: args.fps,
        ts_clock: args.ts_clock,
        send_buff_size: args.send_buff_size,
        recv_buff_size: args.recv_buff_size,
        tcp_nodelay: !args.no_tcp_nodelay,
        tcp_cork: args.tcp_cork,
        temporal_levels: args.temporal_levels,
        increase_time: args.increase_time,
        packet_gap: args.packet_gap,
    };

    let bind_addr = format!("{}:{}", args.bind, args.port);
    let server = match Server::start(&bind_addr, options) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Failed to start server on {}: {}", bind_addr, e);
            std::process::exit(1);
        }
    };

    println!("RTSP server on {} — press Enter to stop", bind_addr);
    let mut input = String::new();
    let _ = io::stdin().read_line(&mut input);

    server.stop();
}

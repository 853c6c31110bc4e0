//! Echo RPC Client
//!
//! Memanggil `EchoServer.Echo` dan `EchoServer.Print` secara periodik
//! lewat timer scheduler.
//!
//! Usage:
//!   cargo run --release --bin echo_rpc_client -- 127.0.0.1:12321 --interval-ms 1000

use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use loomnet::protocol::Postcard;
use loomnet::{Client, ClientConfig, EventLoop, NetAddress, RpcChannel, SchedulerConfig, TimerScheduler};

#[derive(Parser, Debug)]
#[command(name = "echo_rpc_client")]
#[command(about = "Periodic caller for the EchoServer RPC service")]
struct Args {
    /// Server address (`host:port` atau `unix:/path`)
    #[arg(default_value = "127.0.0.1:12321")]
    server: NetAddress,

    /// Jarak antar call per method
    #[arg(short, long, default_value_t = 1000)]
    interval_ms: u64,

    /// Isi pesan
    #[arg(short, long, default_value = "hello, from client")]
    message: String,

    /// Reconnect otomatis kalau connection putus
    #[arg(long)]
    retry: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EchoMessage {
    message: String,
}

type Echo = Postcard<EchoMessage>;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();
}

fn run(args: Args) -> loomnet::Result<()> {
    let event_loop = EventLoop::new()?;
    let scheduler = TimerScheduler::start(SchedulerConfig::default())?;

    let config = ClientConfig {
        name: "EchoRpcClient".to_string(),
        retry: args.retry,
        ..ClientConfig::default()
    };
    let client = Client::new(&event_loop, &scheduler, args.server, config);
    let channel = RpcChannel::new();
    channel.attach(&client);
    client.connect();

    let request = Postcard(EchoMessage {
        message: args.message,
    });
    let interval = Duration::from_millis(args.interval_ms.max(1));
    for method in ["Echo", "Print"] {
        let channel = channel.clone();
        let request = request.clone();
        scheduler.run_every(interval, move || {
            info!(method, "echo client call");
            let sent = channel.call::<Echo, Echo, _>("EchoServer", method, &request, move |resp| {
                match resp {
                    Ok(resp) => info!(method, reply = %resp.message, "response"),
                    Err(e) => warn!(method, error = %e, "undecodable response"),
                }
            });
            if let Err(e) = sent {
                warn!(method, error = %e, "call skipped");
            }
        });
    }

    event_loop.run();
    scheduler.stop();
    Ok(())
}

fn main() {
    init_tracing();
    let args = Args::parse();

    if let Err(e) = run(args) {
        error!(error = %e, "client error");
        std::process::exit(1);
    }
}

//! Echo RPC Server
//!
//! Service `EchoServer` dengan dua method:
//! - `Echo`: balas pesan dengan prefix `[Echo]`
//! - `Print`: log pesan lalu balas dengan prefix `[Print]`
//!
//! Usage:
//!   cargo run --release --bin echo_rpc_server -- --listen 127.0.0.1:12321

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use loomnet::protocol::Postcard;
use loomnet::rpc::{Responder, RpcServer, Service};
use loomnet::{ConnectionConfig, EventLoop, NetAddress, SchedulerConfig, ServerConfig, TimerScheduler};

#[derive(Parser, Debug)]
#[command(name = "echo_rpc_server")]
#[command(about = "Echo RPC server (service EchoServer: Echo, Print)")]
struct Args {
    /// Listen address (`host:port` atau `unix:/path`)
    #[arg(short, long, default_value = "127.0.0.1:12321")]
    listen: NetAddress,

    /// SO_REUSEPORT pada socket listen
    #[arg(long)]
    reuse_port: bool,

    /// Disable Nagle untuk connection TCP
    #[arg(long)]
    tcp_nodelay: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EchoMessage {
    message: String,
}

type Echo = Postcard<EchoMessage>;

fn reply(tag: &str, request: &EchoMessage) -> Echo {
    Postcard(EchoMessage {
        message: format!("[{tag}] server say: received msg: ***{}***", request.message),
    })
}

fn echo_service() -> Service {
    Service::new("EchoServer")
        .method("Echo", |req: Echo, resp: Responder<Echo>| {
            info!(id = resp.id(), msg = %req.message, "[Echo] server received client msg");
            resp.send(&reply("Echo", &req));
        })
        .method("Print", |req: Echo, resp: Responder<Echo>| {
            info!(id = resp.id(), msg = %req.message, "[Print] server received client msg");
            resp.send(&reply("Print", &req));
        })
}

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

    let config = ServerConfig {
        name: "EchoRpcServer".to_string(),
        reuse_port: args.reuse_port,
        connection: ConnectionConfig {
            tcp_nodelay: args.tcp_nodelay,
            ..ConnectionConfig::default()
        },
    };
    let server = RpcServer::new(&event_loop, &scheduler, &args.listen, config)?;
    server.register_service(echo_service());
    server.start();
    info!(addr = %server.listen_address(), "echo rpc server started");

    event_loop.run();
    scheduler.stop();
    Ok(())
}

fn main() {
    init_tracing();
    let args = Args::parse();

    if let Err(e) = run(args) {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}

//! Loomnet - Reactor-style Network Framework
//!
//! Arsitektur:
//! - Reactor: satu `EventLoop` per thread, readiness lewat mio (epoll)
//! - Network: Acceptor/Connector, Connection dengan output buffer, Server/Client
//! - Timer: satu scheduler thread dengan virtual tick
//! - RPC: framing length-prefixed + korelasi call id
//!
//! Semua state loop hanya disentuh dari thread pemiliknya. Thread lain
//! mengirim task lewat `EventLoop::run_in_loop` / `queue_in_loop`.

pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod protocol;
pub mod reactor;
pub mod rpc;

pub use crate::config::{
    ClientConfig, ConnectionConfig, ConnectorConfig, LoopConfig, SchedulerConfig, ServerConfig,
};
pub use crate::core::{Buffer, TimerId, TimerScheduler};
pub use crate::error::{CodecError, Error, Result, RpcError};
pub use crate::network::{Client, Connection, ConnectionPtr, ConnectionState, NetAddress, Server};
pub use crate::reactor::{EventLoop, EventLoopThread};
pub use crate::rpc::{RpcChannel, RpcServer, Service};

//! Network Layer: TCP dan Unix-domain di atas reactor
//!
//! Fitur:
//! - Acceptor dengan teknik idle-fd untuk EMFILE
//! - Connector dengan retry dan backoff eksponensial
//! - Connection dengan output buffer, high-water mark, dan half-close
//! - Server (banyak connection) dan Client (satu connection)

mod acceptor;
mod address;
mod callbacks;
mod client;
mod connection;
mod connector;
mod server;
mod socket;

pub use acceptor::{Acceptor, NewConnectionCallback};
pub use address::NetAddress;
pub use callbacks::{
    default_connection_callback, default_message_callback, CloseCallback, ConnectionCallback,
    ConnectionPtr, HighWaterMarkCallback, MessageCallback, WriteCompleteCallback,
};
pub use client::Client;
pub use connection::{Connection, ConnectionState};
pub use connector::{classify_connect_errno, Backoff, ConnectCallback, ConnectOutcome, Connector, ConnectorState};
pub use server::Server;

//! RPC Layer: call correlation di atas framing `protocol`
//!
//! - `RpcChannel`: sisi client, id call naik terus, response dicocokkan per id
//! - `RpcServer`: sisi server, dispatch `(service, method)` ke handler

mod channel;
mod server;

pub use channel::{Completion, RpcChannel};
pub use server::{RawResponder, Responder, RpcServer, Service};

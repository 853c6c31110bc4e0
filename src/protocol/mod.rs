//! Protocol Layer: framing RPC dan boundary payload codec
//!
//! Prinsip desain:
//! - Length-prefixed: `[i32 BE meta_len][meta][payload]`
//! - Metadata di-encode postcard, payload opaque
//! - Frame parsial menunggu byte berikutnya, tidak pernah error

mod frame;
mod message;

pub use frame::{Frame, RpcMeta, MAX_META_SIZE, META_LEN_SIZE};
pub use message::{Postcard, RpcMessage};

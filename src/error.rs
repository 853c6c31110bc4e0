//! Error types

use std::io;

/// Error utama library
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Error framing dan payload codec
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame metadata: {0}")]
    Metadata(String),

    #[error("malformed payload: {0}")]
    Payload(String),

    #[error("frame metadata too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Error di sisi pemanggil RPC
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("rpc channel is not connected")]
    NotConnected,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Kegagalan yang tidak bisa dilanjutkan di dalam loop: log lalu abort.
#[cold]
pub(crate) fn fatal(context: &str, err: &io::Error) -> ! {
    tracing::error!(error = %err, "{context}");
    std::process::abort()
}

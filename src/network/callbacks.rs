//! Tipe callback untuk connection

use std::sync::Arc;

use tracing::trace;

use super::connection::Connection;
use crate::core::Buffer;

/// Handle bersama ke satu connection
pub type ConnectionPtr = Arc<Connection>;

/// Connection UP atau DOWN (cek `conn.connected()`)
pub type ConnectionCallback = Arc<dyn Fn(&ConnectionPtr) + Send + Sync>;
/// Data baru tersedia di input buffer
pub type MessageCallback = Arc<dyn Fn(&ConnectionPtr, &mut Buffer) + Send + Sync>;
/// Output buffer sudah terkirim semua
pub type WriteCompleteCallback = Arc<dyn Fn(&ConnectionPtr) + Send + Sync>;
/// Output buffer melewati high-water mark; argumen kedua = ukuran buffer
pub type HighWaterMarkCallback = Arc<dyn Fn(&ConnectionPtr, usize) + Send + Sync>;
/// Internal: dipakai Server/Client untuk melepas connection
pub type CloseCallback = Arc<dyn Fn(&ConnectionPtr) + Send + Sync>;

pub fn default_connection_callback(conn: &ConnectionPtr) {
    trace!(
        local = %conn.local_address(),
        peer = %conn.peer_address(),
        state = if conn.connected() { "UP" } else { "DOWN" },
        "connection"
    );
}

/// Buang semua data yang masuk
pub fn default_message_callback(_conn: &ConnectionPtr, buf: &mut Buffer) {
    buf.retrieve_all();
}

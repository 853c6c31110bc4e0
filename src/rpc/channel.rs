//! Sisi client RPC: alokasi call id dan korelasi response
//!
//! Setiap call dicatat di `CallTable` sebelum frame dikirim. Response
//! dicocokkan lewat id; id yang tidak dikenal dibuang diam-diam.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::core::Buffer;
use crate::error::{CodecError, RpcError};
use crate::network::{Client, Connection, ConnectionPtr};
use crate::protocol::{Frame, RpcMessage};

/// Dipanggil sekali dengan payload response mentah
pub type Completion = Box<dyn FnOnce(Bytes) + Send>;

/// Tabel call yang menunggu response
pub(crate) struct CallTable {
    next_id: u64,
    pending: HashMap<u64, Completion>,
}

impl CallTable {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Catat completion, kembalikan id baru (naik terus, mulai 1)
    pub(crate) fn register(&mut self, done: Completion) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(id, done);
        id
    }

    pub(crate) fn complete(&mut self, id: u64) -> Option<Completion> {
        self.pending.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

struct Inner {
    calls: Mutex<CallTable>,
    conn: Mutex<Option<Weak<Connection>>>,
}

/// Handle RPC client. Clone murah; aman dipakai dari thread mana pun.
#[derive(Clone)]
pub struct RpcChannel {
    inner: Arc<Inner>,
}

impl Default for RpcChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcChannel {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                calls: Mutex::new(CallTable::new()),
                conn: Mutex::new(None),
            }),
        }
    }

    /// Pasang callback connection dan message milik `client` ke channel ini
    pub fn attach(&self, client: &Client) {
        let ch = self.clone();
        client.set_connection_callback(move |conn| ch.on_connection(conn));
        let ch = self.clone();
        client.set_message_callback(move |conn, buf| ch.on_message(conn, buf));
    }

    pub fn set_connection(&self, conn: Option<&ConnectionPtr>) {
        *self.inner.conn.lock() = conn.map(Arc::downgrade);
    }

    pub fn connection(&self) -> Option<ConnectionPtr> {
        self.inner
            .conn
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .filter(|c| c.connected())
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_some()
    }

    /// Call yang belum dapat response
    pub fn pending_calls(&self) -> usize {
        self.inner.calls.lock().len()
    }

    /// Connection callback: UP memasang connection, DOWN melepasnya
    pub fn on_connection(&self, conn: &ConnectionPtr) {
        let mut slot = self.inner.conn.lock();
        if conn.connected() {
            debug!(conn = %conn.name(), "rpc channel attached");
            *slot = Some(Arc::downgrade(conn));
        } else if slot.as_ref().is_some_and(|w| w.as_ptr() == Arc::as_ptr(conn)) {
            debug!(conn = %conn.name(), "rpc channel detached");
            *slot = None;
        }
    }

    /// Message callback: rakit frame lalu selesaikan call yang cocok
    pub fn on_message(&self, conn: &ConnectionPtr, buf: &mut Buffer) {
        loop {
            match Frame::decode(buf) {
                Ok(Some(frame)) => self.complete(frame),
                Ok(None) => break,
                Err(e) => {
                    warn!(conn = %conn.name(), error = %e, "malformed rpc frame, closing connection");
                    buf.retrieve_all();
                    conn.force_close();
                    break;
                }
            }
        }
    }

    fn complete(&self, frame: Frame) {
        let done = self.inner.calls.lock().complete(frame.meta.id);
        match done {
            Some(done) => done(frame.payload),
            None => trace!(id = frame.meta.id, "response for unknown call id dropped"),
        }
    }

    /// Call dengan payload mentah. Response diteruskan ke `done` dari
    /// thread loop connection.
    pub fn call_raw<F>(
        &self,
        service: &str,
        method: &str,
        payload: impl Into<Bytes>,
        done: F,
    ) -> Result<u64, RpcError>
    where
        F: FnOnce(Bytes) + Send + 'static,
    {
        let conn = self.connection().ok_or(RpcError::NotConnected)?;
        let id = self.inner.calls.lock().register(Box::new(done));
        let frame = Frame::new(id, service, method, payload);
        match frame.encode() {
            Ok(mut buf) => {
                trace!(id, service, method, bytes = buf.readable_bytes(), "rpc call");
                conn.send_buffer(&mut buf);
                Ok(id)
            }
            Err(e) => {
                self.inner.calls.lock().complete(id);
                Err(e.into())
            }
        }
    }

    /// Call bertipe; `done` menerima response yang sudah di-decode
    pub fn call<Req, Resp, F>(
        &self,
        service: &str,
        method: &str,
        request: &Req,
        done: F,
    ) -> Result<u64, RpcError>
    where
        Req: RpcMessage,
        Resp: RpcMessage,
        F: FnOnce(Result<Resp, CodecError>) + Send + 'static,
    {
        let payload = request.serialize()?;
        self.call_raw(service, method, payload, move |bytes| {
            done(Resp::deserialize(&bytes))
        })
    }
}

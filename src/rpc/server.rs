//! Sisi server RPC: registry service dan dispatch request
//!
//! Request diarahkan ke handler lewat `(service, method)`. Handler
//! menerima responder yang mengirim response dengan call id asli lewat
//! connection yang sama. Responder boleh dipakai belakangan dan dari
//! thread lain.

use std::collections::HashMap;
use std::io;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::core::{Buffer, TimerScheduler};
use crate::network::{Connection, ConnectionPtr, NetAddress, Server};
use crate::protocol::{Frame, RpcMessage};
use crate::reactor::EventLoop;

type MethodHandler = Box<dyn Fn(Bytes, RawResponder) + Send + Sync>;

type Registry = Arc<RwLock<HashMap<String, Arc<Service>>>>;

/// Kumpulan method di bawah satu nama service
pub struct Service {
    name: String,
    methods: HashMap<String, MethodHandler>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handler dengan payload mentah
    pub fn raw_method<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Bytes, RawResponder) + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Box::new(handler));
        self
    }

    /// Handler bertipe. Request yang gagal di-decode di-log lalu dibuang.
    pub fn method<Req, Resp, F>(self, name: impl Into<String>, handler: F) -> Self
    where
        Req: RpcMessage,
        Resp: RpcMessage,
        F: Fn(Req, Responder<Resp>) + Send + Sync + 'static,
    {
        self.raw_method(name, move |bytes, raw| match Req::deserialize(&bytes) {
            Ok(request) => handler(request, Responder::new(raw)),
            Err(e) => warn!(id = raw.id(), method = %raw.method, error = %e, "undecodable request"),
        })
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

/// Mengirim satu response untuk satu request
#[derive(Debug)]
pub struct RawResponder {
    id: u64,
    service: String,
    method: String,
    conn: Weak<Connection>,
}

impl RawResponder {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Kirim response. No-op kalau connection sudah hilang.
    pub fn send(self, payload: impl Into<Bytes>) {
        let Some(conn) = self.conn.upgrade() else {
            debug!(id = self.id, "connection gone, response dropped");
            return;
        };
        let frame = Frame::new(self.id, self.service, self.method, payload);
        match frame.encode() {
            Ok(mut buf) => conn.send_buffer(&mut buf),
            Err(e) => warn!(id = frame.meta.id, error = %e, "failed to encode response"),
        }
    }
}

/// Responder bertipe
pub struct Responder<Resp> {
    raw: RawResponder,
    _resp: PhantomData<fn(Resp)>,
}

impl<Resp: RpcMessage> Responder<Resp> {
    fn new(raw: RawResponder) -> Self {
        Self {
            raw,
            _resp: PhantomData,
        }
    }

    pub fn id(&self) -> u64 {
        self.raw.id
    }

    pub fn send(self, response: &Resp) {
        match response.serialize() {
            Ok(bytes) => self.raw.send(bytes),
            Err(e) => warn!(id = self.raw.id, error = %e, "failed to serialize response"),
        }
    }
}

/// Server RPC di atas `Server`
pub struct RpcServer {
    server: Server,
    services: Registry,
}

impl RpcServer {
    pub fn new(
        event_loop: &Arc<EventLoop>,
        scheduler: &TimerScheduler,
        listen_addr: &NetAddress,
        config: ServerConfig,
    ) -> io::Result<Self> {
        let server = Server::new(event_loop, scheduler, listen_addr, config)?;
        let services: Registry = Arc::default();

        server.set_connection_callback(|conn| {
            info!(
                conn = %conn.name(),
                peer = %conn.peer_address(),
                state = if conn.connected() { "UP" } else { "DOWN" },
                "rpc connection"
            );
        });
        let registry = Arc::clone(&services);
        server.set_message_callback(move |conn, buf| dispatch(&registry, conn, buf));

        Ok(Self { server, services })
    }

    /// Daftarkan service; nama yang sama menimpa yang lama
    pub fn register_service(&self, service: Service) {
        info!(service = %service.name, methods = service.methods.len(), "register service");
        self.services
            .write()
            .insert(service.name.clone(), Arc::new(service));
    }

    pub fn service_count(&self) -> usize {
        self.services.read().len()
    }

    pub fn start(&self) {
        self.server.start();
    }

    pub fn listen_address(&self) -> &NetAddress {
        self.server.listen_address()
    }

    pub fn server(&self) -> &Server {
        &self.server
    }
}

fn dispatch(services: &Registry, conn: &ConnectionPtr, buf: &mut Buffer) {
    loop {
        match Frame::decode(buf) {
            Ok(Some(frame)) => handle_request(services, conn, frame),
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

fn handle_request(services: &Registry, conn: &ConnectionPtr, frame: Frame) {
    let Frame { meta, payload } = frame;
    let service = services.read().get(&meta.service).cloned();
    let Some(service) = service else {
        warn!(conn = %conn.name(), service = %meta.service, "unknown service");
        return;
    };
    let Some(handler) = service.methods.get(&meta.method) else {
        warn!(conn = %conn.name(), service = %meta.service, method = %meta.method, "unknown method");
        return;
    };
    trace!(id = meta.id, service = %meta.service, method = %meta.method, "rpc request");
    let responder = RawResponder {
        id: meta.id,
        service: meta.service,
        method: meta.method,
        conn: Arc::downgrade(conn),
    };
    handler(payload, responder);
}

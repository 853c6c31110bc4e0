//! Server: satu Acceptor + registry connection berdasarkan nama
//!
//! Alur:
//! 1. Acceptor menerima socket baru (di thread loop)
//! 2. Connection dibuat, diberi nama `{name}-{ip:port}#{n}`, didaftarkan
//! 3. Saat close, entry dilepas lalu `connect_destroyed` diantrekan ke loop

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use socket2::Socket;
use tracing::{debug, info};

use super::acceptor::Acceptor;
use super::address::NetAddress;
use super::callbacks::{
    default_connection_callback, default_message_callback, ConnectionCallback, ConnectionPtr,
    MessageCallback, WriteCompleteCallback,
};
use super::connection::Connection;
use super::socket as sock;
use crate::config::{ConnectionConfig, ServerConfig};
use crate::core::{Buffer, TimerScheduler};
use crate::reactor::EventLoop;

struct UserCallbacks {
    connection: ConnectionCallback,
    message: MessageCallback,
    write_complete: Option<WriteCompleteCallback>,
}

struct ServerInner {
    event_loop: Arc<EventLoop>,
    scheduler: TimerScheduler,
    name: String,
    ip_port: String,
    acceptor: Arc<Acceptor>,
    config: ConnectionConfig,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<String, ConnectionPtr>>,
    callbacks: Mutex<UserCallbacks>,
}

/// TCP / Unix-domain server di atas satu `EventLoop`
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Bind alamat (port 0 = ephemeral). Listen baru dimulai di `start`.
    pub fn new(
        event_loop: &Arc<EventLoop>,
        scheduler: &TimerScheduler,
        listen_addr: &NetAddress,
        config: ServerConfig,
    ) -> io::Result<Self> {
        let acceptor = Acceptor::new(event_loop, listen_addr, config.reuse_port)?;
        let ip_port = acceptor.listen_address().to_string();

        let inner = Arc::new(ServerInner {
            event_loop: Arc::clone(event_loop),
            scheduler: scheduler.clone(),
            name: config.name,
            ip_port,
            acceptor: Arc::clone(&acceptor),
            config: config.connection,
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(0),
            connections: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(UserCallbacks {
                connection: Arc::new(default_connection_callback),
                message: Arc::new(default_message_callback),
                write_complete: None,
            }),
        });

        let weak: Weak<ServerInner> = Arc::downgrade(&inner);
        acceptor.set_new_connection_callback(move |socket, peer| {
            if let Some(server) = weak.upgrade() {
                server.new_connection(socket, peer);
            }
        });

        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn ip_port(&self) -> &str {
        &self.inner.ip_port
    }

    /// Alamat yang benar-benar di-bind
    pub fn listen_address(&self) -> &NetAddress {
        self.inner.acceptor.listen_address()
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.inner.event_loop
    }

    pub fn set_connection_callback<F>(&self, cb: F)
    where
        F: Fn(&ConnectionPtr) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().connection = Arc::new(cb);
    }

    pub fn set_message_callback<F>(&self, cb: F)
    where
        F: Fn(&ConnectionPtr, &mut Buffer) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().message = Arc::new(cb);
    }

    pub fn set_write_complete_callback<F>(&self, cb: F)
    where
        F: Fn(&ConnectionPtr) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().write_complete = Some(Arc::new(cb));
    }

    /// Mulai listen. Idempotent, aman dari thread mana pun.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let acceptor = Arc::clone(&self.inner.acceptor);
        self.inner.event_loop.run_in_loop(move || {
            if !acceptor.listening() {
                acceptor.listen();
            }
        });
    }

    pub fn started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// True setelah `listen(2)` benar-benar jalan di thread loop. `start`
    /// hanya mengantrekan listen, jadi bisa tertinggal sebentar.
    pub fn listening(&self) -> bool {
        self.inner.acceptor.listening()
    }

    /// Jumlah connection yang masih terdaftar
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Snapshot connection yang terdaftar
    pub fn connections(&self) -> Vec<ConnectionPtr> {
        self.inner.connections.lock().values().cloned().collect()
    }
}

impl ServerInner {
    fn new_connection(self: &Arc<Self>, socket: Socket, peer: NetAddress) {
        self.event_loop.assert_in_loop_thread();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("{}-{}#{}", self.name, self.ip_port, id);
        info!(server = %self.name, conn = %name, %peer, "new connection");

        let local = sock::local_address(&socket)
            .unwrap_or_else(|| self.acceptor.listen_address().clone());
        let conn = Connection::new(
            &self.event_loop,
            &self.scheduler,
            name.clone(),
            socket,
            local,
            peer,
            &self.config,
        );
        {
            let cbs = self.callbacks.lock();
            conn.install_callbacks(
                cbs.connection.clone(),
                cbs.message.clone(),
                cbs.write_complete.clone(),
            );
        }
        let weak = Arc::downgrade(self);
        conn.set_close_callback(move |c| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(c);
            }
        });
        self.connections.lock().insert(name, Arc::clone(&conn));
        self.event_loop.run_in_loop(move || conn.connect_established());
    }

    /// Lepas dari registry, lalu serahkan ownership ke task destroy
    fn remove_connection(&self, conn: &ConnectionPtr) {
        self.event_loop.assert_in_loop_thread();
        info!(server = %self.name, conn = %conn.name(), "remove connection");
        let removed = self.connections.lock().remove(conn.name());
        if let Some(conn) = removed {
            self.event_loop.queue_in_loop(move || conn.connect_destroyed());
        }
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        debug!(server = %self.name, "server destroyed");
        let conns: Vec<ConnectionPtr> = self.connections.get_mut().drain().map(|(_, c)| c).collect();
        for conn in conns {
            self.event_loop.run_in_loop(move || conn.connect_destroyed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;

    #[test]
    fn test_server_binds_ephemeral_port_without_listening() {
        let lp = EventLoop::new().unwrap();
        let sched = TimerScheduler::start(SchedulerConfig::default()).unwrap();
        let config = ServerConfig {
            name: "unit".to_string(),
            ..ServerConfig::default()
        };
        let server = Server::new(&lp, &sched, &"127.0.0.1:0".parse().unwrap(), config).unwrap();

        assert_eq!(server.name(), "unit");
        assert_ne!(server.listen_address().port(), Some(0));
        assert_eq!(server.ip_port(), server.listen_address().to_string());
        assert!(!server.started());
        assert!(!server.listening());
        assert_eq!(server.connection_count(), 0);

        // start di thread loop = listen langsung
        server.start();
        server.start();
        assert!(server.started());
        assert!(server.listening());
        drop(server);
        sched.stop();
    }
}

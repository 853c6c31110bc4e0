//! Client: satu Connector + paling banyak satu connection aktif
//!
//! Handle connection dijaga mutex karena boleh dibaca dari thread lain.
//! Dengan retry aktif, Connector di-restart setiap kali connection tertutup.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use socket2::Socket;
use tracing::{debug, info};

use super::address::NetAddress;
use super::callbacks::{
    default_connection_callback, default_message_callback, ConnectionCallback, ConnectionPtr,
    MessageCallback, WriteCompleteCallback,
};
use super::connection::Connection;
use super::connector::Connector;
use super::socket as sock;
use crate::config::{ClientConfig, ConnectionConfig};
use crate::core::{Buffer, TimerScheduler};
use crate::reactor::EventLoop;

struct UserCallbacks {
    connection: ConnectionCallback,
    message: MessageCallback,
    write_complete: Option<WriteCompleteCallback>,
}

struct ClientInner {
    event_loop: Arc<EventLoop>,
    scheduler: TimerScheduler,
    name: String,
    connector: Arc<Connector>,
    config: ConnectionConfig,
    retry: AtomicBool,
    connect: AtomicBool,
    next_conn_id: AtomicU64,
    connection: Mutex<Option<ConnectionPtr>>,
    callbacks: Mutex<UserCallbacks>,
}

pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(
        event_loop: &Arc<EventLoop>,
        scheduler: &TimerScheduler,
        server_addr: NetAddress,
        config: ClientConfig,
    ) -> Self {
        let connector = Connector::new(event_loop, scheduler, server_addr, &config.connector);
        let inner = Arc::new(ClientInner {
            event_loop: Arc::clone(event_loop),
            scheduler: scheduler.clone(),
            name: config.name,
            connector: Arc::clone(&connector),
            config: config.connection,
            retry: AtomicBool::new(config.retry),
            connect: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(0),
            connection: Mutex::new(None),
            callbacks: Mutex::new(UserCallbacks {
                connection: Arc::new(default_connection_callback),
                message: Arc::new(default_message_callback),
                write_complete: None,
            }),
        });

        let weak: Weak<ClientInner> = Arc::downgrade(&inner);
        connector.set_new_connection_callback(move |socket| {
            if let Some(client) = weak.upgrade() {
                client.new_connection(socket);
            }
        });
        debug!(client = %inner.name, "client created");
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.inner.event_loop
    }

    pub fn server_address(&self) -> &NetAddress {
        self.inner.connector.server_address()
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

    pub fn retry(&self) -> bool {
        self.inner.retry.load(Ordering::Acquire)
    }

    /// Reconnect otomatis setelah connection tertutup
    pub fn enable_retry(&self) {
        self.inner.retry.store(true, Ordering::Release);
    }

    /// Mulai connect. Aman dari thread mana pun.
    pub fn connect(&self) {
        info!(
            client = %self.inner.name,
            addr = %self.inner.connector.server_address(),
            "connecting"
        );
        self.inner.connect.store(true, Ordering::Release);
        self.inner.connector.start();
    }

    /// Half-close connection aktif; tidak ada reconnect setelahnya
    pub fn disconnect(&self) {
        self.inner.connect.store(false, Ordering::Release);
        let conn = self.inner.connection.lock().clone();
        if let Some(conn) = conn {
            conn.shutdown();
        }
    }

    /// Batalkan connect yang sedang berjalan (termasuk retry yang tertunda)
    pub fn stop(&self) {
        self.inner.connect.store(false, Ordering::Release);
        self.inner.connector.stop();
    }

    /// Connection aktif, kalau ada
    pub fn connection(&self) -> Option<ConnectionPtr> {
        self.inner.connection.lock().clone()
    }
}

impl ClientInner {
    fn new_connection(self: &Arc<Self>, socket: Socket) {
        self.event_loop.assert_in_loop_thread();
        let peer = sock::peer_address(&socket)
            .unwrap_or_else(|| self.connector.server_address().clone());
        let local = sock::local_address(&socket).unwrap_or_else(|| NetAddress::unix(""));
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("{}:{}#{}", self.name, peer, id);

        let conn = Connection::new(
            &self.event_loop,
            &self.scheduler,
            name,
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
            if let Some(client) = weak.upgrade() {
                client.remove_connection(c);
            }
        });
        *self.connection.lock() = Some(Arc::clone(&conn));
        conn.connect_established();
    }

    fn remove_connection(&self, conn: &ConnectionPtr) {
        self.event_loop.assert_in_loop_thread();
        {
            let mut slot = self.connection.lock();
            if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
                *slot = None;
            }
        }
        let c = Arc::clone(conn);
        self.event_loop.queue_in_loop(move || c.connect_destroyed());

        if self.retry.load(Ordering::Acquire) && self.connect.load(Ordering::Acquire) {
            info!(
                client = %self.name,
                addr = %self.connector.server_address(),
                "reconnecting"
            );
            self.connector.restart();
        }
    }
}

/// Connection yang tertinggal setelah client hilang membereskan dirinya sendiri
fn detached_close(conn: &ConnectionPtr) {
    let c = Arc::clone(conn);
    conn.event_loop().queue_in_loop(move || c.connect_destroyed());
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        debug!(client = %self.name, "client destroyed");
        match self.connection.get_mut().take() {
            Some(conn) => {
                conn.set_close_callback(detached_close);
                // Masih dipegang user: biarkan hidup sampai ditutup peer / user
                if Arc::strong_count(&conn) == 1 {
                    conn.force_close();
                }
            }
            None => self.connector.stop(),
        }
    }
}

//! Connection: state machine per socket dengan input/output buffer
//!
//! State hanya bergerak maju:
//! `Connecting -> Connected -> Disconnecting -> Disconnected`.
//!
//! Prinsip desain:
//! - Semua I/O dan transisi state di thread loop pemilik
//! - `send` aman dari thread mana pun (payload di-copy ke loop)
//! - Half-close ditunda sampai output buffer kosong
//! - fd baru ditutup saat `Connection` di-drop

use std::fmt;
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::Socket;
use tracing::{debug, error, trace, warn};

use super::address::NetAddress;
use super::callbacks::{
    default_connection_callback, default_message_callback, CloseCallback, ConnectionCallback,
    ConnectionPtr, HighWaterMarkCallback, MessageCallback, WriteCompleteCallback,
};
use super::socket as sock;
use crate::config::ConnectionConfig;
use crate::core::{Buffer, TimerId, TimerScheduler};
use crate::reactor::{Channel, EventLoop};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::Disconnected => "Disconnected",
        };
        f.write_str(s)
    }
}

/// True kalau antrean naik dari bawah threshold ke >= threshold
#[inline]
pub(crate) fn crosses_high_water_mark(queued: usize, added: usize, mark: usize) -> bool {
    queued < mark && queued.saturating_add(added) >= mark
}

struct Callbacks {
    connection: ConnectionCallback,
    message: MessageCallback,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

pub struct Connection {
    event_loop: Arc<EventLoop>,
    scheduler: TimerScheduler,
    name: String,
    state: AtomicU8,
    reading: AtomicBool,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: NetAddress,
    peer_addr: NetAddress,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    callbacks: Mutex<Callbacks>,
}

impl Connection {
    /// Bungkus socket yang sudah terhubung. Dipanggil Server/Client; event
    /// baru diproses setelah `connect_established`.
    pub fn new(
        event_loop: &Arc<EventLoop>,
        scheduler: &TimerScheduler,
        name: impl Into<String>,
        socket: Socket,
        local_addr: NetAddress,
        peer_addr: NetAddress,
        config: &ConnectionConfig,
    ) -> ConnectionPtr {
        let name = name.into();
        if !local_addr.is_unix() {
            if let Err(e) = socket.set_keepalive(config.keepalive) {
                warn!(conn = %name, error = %e, "SO_KEEPALIVE failed");
            }
            if config.tcp_nodelay {
                if let Err(e) = socket.set_nodelay(true) {
                    warn!(conn = %name, error = %e, "TCP_NODELAY failed");
                }
            }
        }
        let fd = socket.as_raw_fd();
        debug!(conn = %name, fd, "connection created");

        Arc::new_cyclic(|me: &Weak<Connection>| {
            let channel = Channel::new(event_loop, fd);
            let w = me.clone();
            channel.set_read_callback(move || {
                if let Some(c) = w.upgrade() {
                    c.handle_read();
                }
            });
            let w = me.clone();
            channel.set_write_callback(move || {
                if let Some(c) = w.upgrade() {
                    c.handle_write();
                }
            });
            let w = me.clone();
            channel.set_close_callback(move || {
                if let Some(c) = w.upgrade() {
                    c.handle_close();
                }
            });
            let w = me.clone();
            channel.set_error_callback(move || {
                if let Some(c) = w.upgrade() {
                    c.handle_error();
                }
            });

            Connection {
                event_loop: Arc::clone(event_loop),
                scheduler: scheduler.clone(),
                name,
                state: AtomicU8::new(ConnectionState::Connecting as u8),
                reading: AtomicBool::new(false),
                socket,
                channel,
                local_addr,
                peer_addr,
                input: Mutex::new(Buffer::new()),
                output: Mutex::new(Buffer::new()),
                high_water_mark: AtomicUsize::new(config.high_water_mark),
                callbacks: Mutex::new(Callbacks {
                    connection: Arc::new(default_connection_callback),
                    message: Arc::new(default_message_callback),
                    write_complete: None,
                    high_water_mark: None,
                    close: None,
                }),
            }
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn local_address(&self) -> &NetAddress {
        &self.local_addr
    }

    pub fn peer_address(&self) -> &NetAddress {
        &self.peer_addr
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    #[inline]
    pub fn disconnected(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    /// Byte yang masih antre di output buffer
    pub fn output_bytes(&self) -> usize {
        self.output.lock().readable_bytes()
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark.load(Ordering::Relaxed)
    }

    pub fn set_connection_callback<F>(&self, cb: F)
    where
        F: Fn(&ConnectionPtr) + Send + Sync + 'static,
    {
        self.callbacks.lock().connection = Arc::new(cb);
    }

    pub fn set_message_callback<F>(&self, cb: F)
    where
        F: Fn(&ConnectionPtr, &mut Buffer) + Send + Sync + 'static,
    {
        self.callbacks.lock().message = Arc::new(cb);
    }

    pub fn set_write_complete_callback<F>(&self, cb: F)
    where
        F: Fn(&ConnectionPtr) + Send + Sync + 'static,
    {
        self.callbacks.lock().write_complete = Some(Arc::new(cb));
    }

    pub fn set_high_water_mark_callback<F>(&self, cb: F, mark: usize)
    where
        F: Fn(&ConnectionPtr, usize) + Send + Sync + 'static,
    {
        self.callbacks.lock().high_water_mark = Some(Arc::new(cb));
        self.high_water_mark.store(mark, Ordering::Relaxed);
    }

    /// Internal: dipasang Server/Client untuk melepas connection dari registry
    pub fn set_close_callback<F>(&self, cb: F)
    where
        F: Fn(&ConnectionPtr) + Send + Sync + 'static,
    {
        self.callbacks.lock().close = Some(Arc::new(cb));
    }

    /// Pasang callback yang sudah di-share (dari Server/Client)
    pub(crate) fn install_callbacks(
        &self,
        connection: ConnectionCallback,
        message: MessageCallback,
        write_complete: Option<WriteCompleteCallback>,
    ) {
        let mut cbs = self.callbacks.lock();
        cbs.connection = connection;
        cbs.message = message;
        cbs.write_complete = write_complete;
    }

    /// Kirim data. Di luar thread loop, payload di-copy lalu dikirim dari loop.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if !self.connected() {
            trace!(conn = %self.name, state = %self.state(), "send on inactive connection ignored");
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            self.send_owned(data.to_vec());
        }
    }

    /// Seperti `send`, tanpa copy tambahan saat pindah thread
    pub fn send_owned(self: &Arc<Self>, data: Vec<u8>) {
        if !self.connected() {
            trace!(conn = %self.name, state = %self.state(), "send on inactive connection ignored");
            return;
        }
        let me = Arc::clone(self);
        self.event_loop.run_in_loop(move || me.send_in_loop(&data));
    }

    /// Kirim seluruh isi `buf` lalu kosongkan
    pub fn send_buffer(self: &Arc<Self>, buf: &mut Buffer) {
        if !self.connected() {
            trace!(conn = %self.name, state = %self.state(), "send on inactive connection ignored");
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(buf.peek());
            buf.retrieve_all();
        } else {
            self.send_owned(buf.retrieve_all_as_vec());
        }
    }

    /// Half-close setelah output buffer kosong
    pub fn shutdown(self: &Arc<Self>) {
        let switched = self
            .state
            .compare_exchange(
                ConnectionState::Connected as u8,
                ConnectionState::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if switched {
            let me = Arc::clone(self);
            self.event_loop.run_in_loop(move || me.shutdown_in_loop());
        }
    }

    /// Tutup sekarang (lewat antrean loop), tanpa menunggu output buffer
    pub fn force_close(self: &Arc<Self>) {
        if self.is_closable() {
            self.set_state(ConnectionState::Disconnecting);
            let me = Arc::clone(self);
            self.event_loop.queue_in_loop(move || me.force_close_in_loop());
        }
    }

    /// Tutup setelah `delay`. Timer hanya memegang weak reference, jadi
    /// connection yang sudah hilang tidak disentuh.
    pub fn force_close_with_delay(self: &Arc<Self>, delay: Duration) -> Option<TimerId> {
        if !self.is_closable() {
            return None;
        }
        self.set_state(ConnectionState::Disconnecting);
        let weak = Arc::downgrade(self);
        let id = self.scheduler.run_after(delay, move || {
            if let Some(conn) = weak.upgrade() {
                conn.force_close();
            }
        });
        Some(id)
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        if self.local_addr.is_unix() {
            return Ok(());
        }
        self.socket.set_nodelay(on)
    }

    pub fn start_read(self: &Arc<Self>) {
        let me = Arc::clone(self);
        self.event_loop.run_in_loop(move || {
            if !me.reading.load(Ordering::Acquire) || !me.channel.is_reading() {
                me.channel.enable_reading();
                me.reading.store(true, Ordering::Release);
            }
        });
    }

    pub fn stop_read(self: &Arc<Self>) {
        let me = Arc::clone(self);
        self.event_loop.run_in_loop(move || {
            if me.reading.load(Ordering::Acquire) || me.channel.is_reading() {
                me.channel.disable_reading();
                me.reading.store(false, Ordering::Release);
            }
        });
    }

    /// Dipanggil sekali dari thread loop setelah connection didaftarkan
    pub fn connect_established(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        debug_assert_eq!(self.state(), ConnectionState::Connecting);
        self.set_state(ConnectionState::Connected);
        self.channel.tie(self);
        self.channel.enable_reading();
        self.reading.store(true, Ordering::Release);

        let cb = self.callbacks.lock().connection.clone();
        cb(self);
    }

    /// Langkah terakhir sebelum connection dilepas: callback connection
    /// dipanggil sekali lagi (DOWN) lalu channel dikeluarkan dari poller.
    pub fn connect_destroyed(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if self.is_closable() {
            self.set_state(ConnectionState::Disconnected);
            self.channel.disable_all();
            let cb = self.callbacks.lock().connection.clone();
            cb(self);
        } else if !self.channel.is_none_event() {
            self.channel.disable_all();
        }
        self.channel.remove();
    }

    fn is_closable(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Disconnecting
        )
    }

    /// Maju ke `state`; tidak pernah mundur. Mengembalikan state sebelumnya.
    fn set_state(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.state.fetch_max(state as u8, Ordering::AcqRel))
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();
        if self.disconnected() {
            warn!(conn = %self.name, "disconnected, give up writing");
            return;
        }

        let mut written = 0;
        let mut fault = false;
        let mut output = self.output.lock();

        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            match (&self.socket).write(data) {
                Ok(n) => {
                    written = n;
                    if n == data.len() {
                        self.queue_write_complete();
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    error!(conn = %self.name, error = %e, "send failed");
                    if matches!(e.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                        fault = true;
                    }
                }
            }
        }

        let remaining = data.len() - written;
        if fault || remaining == 0 {
            return;
        }

        let queued = output.readable_bytes();
        let mark = self.high_water_mark();
        if crosses_high_water_mark(queued, remaining, mark) {
            let cb = self.callbacks.lock().high_water_mark.clone();
            if let Some(cb) = cb {
                let me = Arc::clone(self);
                let size = queued + remaining;
                self.event_loop.queue_in_loop(move || cb(&me, size));
            }
        }
        output.append(&data[written..]);
        if !self.channel.is_writing() {
            self.channel.enable_writing();
        }
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            sock::shutdown_write(&self.socket);
        }
    }

    fn force_close_in_loop(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if self.is_closable() {
            self.handle_close();
        }
    }

    fn queue_write_complete(self: &Arc<Self>) {
        let cb = self.callbacks.lock().write_complete.clone();
        if let Some(cb) = cb {
            let me = Arc::clone(self);
            self.event_loop.queue_in_loop(move || cb(&me));
        }
    }

    fn handle_read(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        let mut input = self.input.lock();
        let mut received = 0;
        let mut eof = false;
        let mut failure = None;

        loop {
            match input.read_from(&mut &self.socket) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => received += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if received > 0 {
            trace!(conn = %self.name, received, "read");
            let cb = self.callbacks.lock().message.clone();
            cb(self, &mut input);
        }
        drop(input);

        if let Some(e) = failure {
            error!(conn = %self.name, error = %e, "read failed");
            self.handle_error();
            self.handle_close();
        } else if eof {
            self.handle_close();
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!(conn = %self.name, "connection is down, no more writing");
            return;
        }

        let mut output = self.output.lock();
        loop {
            match (&self.socket).write(output.peek()) {
                Ok(n) if n > 0 => {
                    output.retrieve(n);
                    if output.readable_bytes() == 0 {
                        self.channel.disable_writing();
                        self.queue_write_complete();
                        drop(output);
                        if self.state() == ConnectionState::Disconnecting {
                            self.shutdown_in_loop();
                        }
                        return;
                    }
                }
                Ok(_) => return,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(conn = %self.name, error = %e, "write failed");
                    // edge-triggered: tidak akan ada event write lagi
                    output.retrieve_all();
                    drop(output);
                    self.handle_error();
                    self.handle_close();
                    return;
                }
            }
        }
    }

    fn handle_close(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        let prev = self.state();
        if prev == ConnectionState::Disconnected {
            return;
        }
        trace!(conn = %self.name, fd = self.channel.fd(), state = %prev, "handle close");
        self.set_state(ConnectionState::Disconnected);
        self.channel.disable_all();

        let (connection_cb, close_cb) = {
            let cbs = self.callbacks.lock();
            (cbs.connection.clone(), cbs.close.clone())
        };
        connection_cb(self);
        // Harus terakhir: close callback melepas connection dari registry
        if let Some(close_cb) = close_cb {
            close_cb(self);
        }
    }

    fn handle_error(&self) {
        let err = sock::pending_error(&self.socket);
        if err != 0 {
            error!(
                conn = %self.name,
                errno = err,
                error = %sock::errno_message(err),
                "connection error"
            );
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("local", &self.local_addr)
            .field("peer", &self.peer_addr)
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let state = self.state();
        if state == ConnectionState::Disconnected {
            debug!(conn = %self.name, fd = self.channel.fd(), "connection destroyed");
        } else {
            warn!(conn = %self.name, %state, "connection dropped without close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use std::os::unix::net::UnixStream;

    fn pair_connection(lp: &Arc<EventLoop>, sched: &TimerScheduler) -> (ConnectionPtr, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let conn = Connection::new(
            lp,
            sched,
            "pair#1",
            Socket::from(a),
            NetAddress::unix(""),
            NetAddress::unix(""),
            &ConnectionConfig::default(),
        );
        (conn, b)
    }

    /// Jalankan task yang antre lalu keluar dari loop
    fn drain(lp: &Arc<EventLoop>) {
        let l = Arc::clone(lp);
        lp.queue_in_loop(move || l.quit());
        lp.wakeup();
        lp.run();
    }

    #[test]
    fn test_high_water_mark_crossing() {
        assert!(crosses_high_water_mark(0, 100, 100));
        assert!(crosses_high_water_mark(99, 1, 100));
        assert!(!crosses_high_water_mark(0, 99, 100));
        assert!(!crosses_high_water_mark(100, 10, 100));
        assert!(!crosses_high_water_mark(150, 10, 100));
    }

    #[test]
    fn test_state_never_moves_backward() {
        let lp = EventLoop::new().unwrap();
        let sched = TimerScheduler::start(SchedulerConfig::default()).unwrap();
        let (conn, _peer) = pair_connection(&lp, &sched);

        assert_eq!(conn.state(), ConnectionState::Connecting);
        conn.connect_established();
        assert!(conn.connected());
        assert!(conn.is_reading());

        conn.force_close();
        assert_eq!(conn.state(), ConnectionState::Disconnecting);
        assert_eq!(conn.set_state(ConnectionState::Connected), ConnectionState::Disconnecting);
        assert_eq!(conn.state(), ConnectionState::Disconnecting);

        drain(&lp);
        assert!(conn.disconnected());
        assert_eq!(conn.set_state(ConnectionState::Connecting), ConnectionState::Disconnected);
        assert!(conn.disconnected());

        // force_close pada connection yang sudah Disconnected = no-op
        conn.force_close();
        assert_eq!(lp.queue_size(), 0);
        assert!(conn.force_close_with_delay(Duration::from_millis(1)).is_none());

        conn.connect_destroyed();
        sched.stop();
    }

    #[test]
    fn test_connection_callback_up_and_down() {
        let lp = EventLoop::new().unwrap();
        let sched = TimerScheduler::start(SchedulerConfig::default()).unwrap();
        let (conn, _peer) = pair_connection(&lp, &sched);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        conn.set_connection_callback(move |c| s.lock().push(c.connected()));

        conn.connect_established();
        conn.connect_destroyed();
        assert_eq!(*seen.lock(), vec![true, false]);
        assert!(!lp.has_channel(&conn.channel));
        sched.stop();
    }

    #[test]
    fn test_send_in_loop_writes_directly() {
        use std::io::Read;

        let lp = EventLoop::new().unwrap();
        let sched = TimerScheduler::start(SchedulerConfig::default()).unwrap();
        let (conn, mut peer) = pair_connection(&lp, &sched);
        conn.connect_established();

        conn.send(b"hello");
        assert_eq!(conn.output_bytes(), 0);
        let mut got = [0u8; 5];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"hello");

        conn.force_close();
        drain(&lp);
        conn.connect_destroyed();
        sched.stop();
    }

    #[test]
    fn test_hard_write_error_closes_connection() {
        let lp = EventLoop::new().unwrap();
        let sched = TimerScheduler::start(SchedulerConfig::default()).unwrap();
        let (conn, peer) = pair_connection(&lp, &sched);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        conn.set_connection_callback(move |c| s.lock().push(c.connected()));
        conn.connect_established();

        // socket penuh: sisa payload antre dan write interest aktif
        conn.send(&vec![7u8; 4 * 1024 * 1024]);
        assert!(conn.output_bytes() > 0);
        assert!(conn.channel.is_writing());

        drop(peer);
        conn.handle_write();

        assert!(conn.disconnected());
        assert!(!conn.channel.is_writing());
        assert_eq!(conn.output_bytes(), 0);
        assert_eq!(*seen.lock(), vec![true, false]);

        conn.connect_destroyed();
        sched.stop();
    }
}

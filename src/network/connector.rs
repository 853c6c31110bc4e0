//! Connector: connect non-blocking dengan retry dan backoff eksponensial
//!
//! Alur:
//! - `start`/`stop` aman dari thread mana pun, dieksekusi di thread loop
//! - errno dari `connect` langsung diklasifikasi (watch / retry / abandon)
//! - writable = connect selesai; SO_ERROR dan self-connect dicek dulu
//! - retry lewat `TimerScheduler`, delay digandakan sampai batas atas

use std::fmt;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::Socket;
use tracing::{debug, error, info, trace, warn};

use super::address::NetAddress;
use super::socket as sock;
use crate::config::ConnectorConfig;
use crate::core::{TimerId, TimerScheduler};
use crate::error::fatal;
use crate::reactor::{Channel, EventLoop};

/// Dipanggil dengan socket yang sudah terhubung
pub type ConnectCallback = Arc<dyn Fn(Socket) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectorState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectorState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectorState::Connecting,
            2 => ConnectorState::Connected,
            _ => ConnectorState::Disconnected,
        }
    }
}

/// Hasil klasifikasi errno dari `connect`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Tunggu writable
    Watch,
    /// Tutup socket, coba lagi setelah backoff
    Retry,
    /// Tutup socket, tidak ada retry
    Abandon,
}

/// Klasifikasi errno `connect` (0 = sukses langsung)
pub fn classify_connect_errno(errno: i32) -> ConnectOutcome {
    match errno {
        0 | libc::EINPROGRESS | libc::EINTR | libc::EISCONN => ConnectOutcome::Watch,
        libc::EAGAIN
        | libc::EADDRINUSE
        | libc::EADDRNOTAVAIL
        | libc::ECONNREFUSED
        | libc::ENETUNREACH => ConnectOutcome::Retry,
        _ => ConnectOutcome::Abandon,
    }
}

/// Delay retry: mulai `initial`, digandakan tiap retry, maksimal `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial.min(max),
        }
    }

    /// Delay untuk retry berikutnya
    #[inline]
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Ambil delay sekarang lalu gandakan
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }
}

impl From<&ConnectorConfig> for Backoff {
    fn from(config: &ConnectorConfig) -> Self {
        Backoff::new(config.initial_retry_delay, config.max_retry_delay)
    }
}

/// Socket yang sedang menunggu connect selesai, beserta channel-nya
struct InFlight {
    socket: Socket,
    channel: Arc<Channel>,
}

pub struct Connector {
    event_loop: Arc<EventLoop>,
    scheduler: TimerScheduler,
    server_addr: NetAddress,
    connect: AtomicBool,
    state: AtomicU8,
    backoff: Mutex<Backoff>,
    in_flight: Mutex<Option<InFlight>>,
    retry_timer: Mutex<Option<TimerId>>,
    new_connection_callback: Mutex<Option<ConnectCallback>>,
}

impl Connector {
    pub fn new(
        event_loop: &Arc<EventLoop>,
        scheduler: &TimerScheduler,
        server_addr: NetAddress,
        config: &ConnectorConfig,
    ) -> Arc<Self> {
        debug!(addr = %server_addr, "connector created");
        Arc::new(Self {
            event_loop: Arc::clone(event_loop),
            scheduler: scheduler.clone(),
            server_addr,
            connect: AtomicBool::new(false),
            state: AtomicU8::new(ConnectorState::Disconnected as u8),
            backoff: Mutex::new(Backoff::from(config)),
            in_flight: Mutex::new(None),
            retry_timer: Mutex::new(None),
            new_connection_callback: Mutex::new(None),
        })
    }

    pub fn set_new_connection_callback<F>(&self, cb: F)
    where
        F: Fn(Socket) + Send + Sync + 'static,
    {
        *self.new_connection_callback.lock() = Some(Arc::new(cb));
    }

    pub fn server_address(&self) -> &NetAddress {
        &self.server_addr
    }

    pub fn state(&self) -> ConnectorState {
        ConnectorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Delay yang akan dipakai retry berikutnya
    pub fn retry_delay(&self) -> Duration {
        self.backoff.lock().current()
    }

    /// Bisa dipanggil dari thread mana pun
    pub fn start(self: &Arc<Self>) {
        self.connect.store(true, Ordering::Release);
        let me = Arc::clone(self);
        self.event_loop.run_in_loop(move || me.start_in_loop());
    }

    /// Reset backoff lalu connect lagi. Hanya dari thread loop.
    pub fn restart(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        self.cancel_retry();
        self.set_state(ConnectorState::Disconnected);
        self.backoff.lock().reset();
        self.connect.store(true, Ordering::Release);
        self.start_in_loop();
    }

    /// Bisa dipanggil dari thread mana pun. Retry yang tertunda dibatalkan.
    pub fn stop(self: &Arc<Self>) {
        self.connect.store(false, Ordering::Release);
        self.cancel_retry();
        let me = Arc::clone(self);
        self.event_loop.queue_in_loop(move || me.stop_in_loop());
    }

    fn start_in_loop(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if self.state() != ConnectorState::Disconnected {
            debug!(addr = %self.server_addr, state = ?self.state(), "connector already active");
            return;
        }
        if self.connect.load(Ordering::Acquire) {
            self.connect_now();
        } else {
            debug!(addr = %self.server_addr, "do not connect");
        }
    }

    fn stop_in_loop(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        // retry yang dijadwalkan loop setelah `stop` dipanggil
        self.cancel_retry();
        if self.state() == ConnectorState::Connecting {
            self.set_state(ConnectorState::Disconnected);
            if let Some(socket) = self.remove_and_reset_channel() {
                self.retry(socket);
            }
        }
    }

    fn connect_now(self: &Arc<Self>) {
        let socket = match sock::new_stream(self.server_addr.domain()) {
            Ok(s) => s,
            Err(e) => fatal("failed to create connector socket", &e),
        };
        let addr = match self.server_addr.to_sock_addr() {
            Ok(a) => a,
            Err(e) => {
                error!(addr = %self.server_addr, error = %e, "invalid server address");
                return;
            }
        };
        let errno = match socket.connect(&addr) {
            Ok(()) => 0,
            Err(e) => e.raw_os_error().unwrap_or(libc::EIO),
        };

        match classify_connect_errno(errno) {
            ConnectOutcome::Watch => self.connecting(socket),
            ConnectOutcome::Retry => {
                debug!(addr = %self.server_addr, errno, "connect failed, will retry");
                self.retry(socket);
            }
            ConnectOutcome::Abandon => {
                error!(
                    addr = %self.server_addr,
                    errno,
                    error = %sock::errno_message(errno),
                    "connect error, giving up"
                );
            }
        }
    }

    fn connecting(self: &Arc<Self>, socket: Socket) {
        self.set_state(ConnectorState::Connecting);
        let channel = Channel::new(&self.event_loop, socket.as_raw_fd());

        let weak: Weak<Connector> = Arc::downgrade(self);
        channel.set_write_callback(move || {
            if let Some(c) = weak.upgrade() {
                c.handle_write();
            }
        });
        let weak: Weak<Connector> = Arc::downgrade(self);
        channel.set_error_callback(move || {
            if let Some(c) = weak.upgrade() {
                c.handle_error();
            }
        });

        *self.in_flight.lock() = Some(InFlight {
            socket,
            channel: Arc::clone(&channel),
        });
        channel.enable_writing();
    }

    /// Lepas channel dari poller dan kembalikan socket-nya.
    ///
    /// Active list milik loop masih memegang channel sampai dispatch selesai.
    fn remove_and_reset_channel(&self) -> Option<Socket> {
        let in_flight = self.in_flight.lock().take()?;
        in_flight.channel.disable_all();
        in_flight.channel.remove();
        Some(in_flight.socket)
    }

    fn handle_write(self: &Arc<Self>) {
        trace!(addr = %self.server_addr, state = ?self.state(), "connector writable");
        if self.state() != ConnectorState::Connecting {
            debug_assert_eq!(self.state(), ConnectorState::Disconnected);
            return;
        }
        let Some(socket) = self.remove_and_reset_channel() else {
            return;
        };

        let err = sock::pending_error(&socket);
        if err != 0 {
            warn!(
                addr = %self.server_addr,
                errno = err,
                error = %sock::errno_message(err),
                "connect failed (SO_ERROR)"
            );
            self.retry(socket);
        } else if sock::is_self_connect(&socket) {
            warn!(addr = %self.server_addr, "self connect");
            self.retry(socket);
        } else {
            self.set_state(ConnectorState::Connected);
            let cb = self.new_connection_callback.lock().clone();
            match (self.connect.load(Ordering::Acquire), cb) {
                (true, Some(cb)) => cb(socket),
                _ => drop(socket),
            }
        }
    }

    fn handle_error(self: &Arc<Self>) {
        if self.state() != ConnectorState::Connecting {
            return;
        }
        if let Some(socket) = self.remove_and_reset_channel() {
            let err = sock::pending_error(&socket);
            trace!(addr = %self.server_addr, errno = err, "connector error");
            self.retry(socket);
        }
    }

    fn retry(self: &Arc<Self>, socket: Socket) {
        drop(socket);
        self.set_state(ConnectorState::Disconnected);
        if !self.connect.load(Ordering::Acquire) {
            debug!(addr = %self.server_addr, "do not connect");
            return;
        }

        let delay = self.backoff.lock().next_delay();
        info!(addr = %self.server_addr, ?delay, "retry connecting");
        let me = Arc::clone(self);
        let id = self.scheduler.run_after(delay, move || {
            let target = Arc::clone(&me);
            me.event_loop.run_in_loop(move || {
                target.retry_timer.lock().take();
                target.start_in_loop();
            });
        });
        *self.retry_timer.lock() = Some(id);
    }

    fn cancel_retry(&self) {
        if let Some(id) = self.retry_timer.lock().take() {
            trace!(addr = %self.server_addr, %id, "pending retry cancelled");
            self.scheduler.delete_timer(id);
        }
    }

    fn set_state(&self, state: ConnectorState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("server_addr", &self.server_addr)
            .field("state", &self.state())
            .field("connect", &self.connect.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        if self.in_flight.get_mut().is_some() {
            debug!(addr = %self.server_addr, "connector destroyed while connecting");
        } else {
            debug!(addr = %self.server_addr, "connector destroyed");
        }
    }
}

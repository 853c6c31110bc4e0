//! Channel: binding satu file descriptor ke interest set dan callback
//!
//! Channel tidak memiliki fd; pemiliknya (Acceptor, Connector, Connection,
//! atau wakeup fd milik EventLoop) yang menutup fd.

use std::any::Any;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::Mutex;
use tracing::{trace, warn};

use super::event_loop::EventLoop;

bitflags! {
    /// Interest set yang didaftarkan ke poller
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Interest: u8 {
        const READ = 0b0000_0001;
        const WRITE = 0b0000_0010;
    }
}

bitflags! {
    /// Readiness terakhir yang dilaporkan poller
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Ready: u8 {
        const READABLE = 0b0000_0001;
        const WRITABLE = 0b0000_0010;
        const PRIORITY = 0b0000_0100;
        /// Peer sudah menutup arah tulisnya
        const READ_CLOSED = 0b0000_1000;
        /// Kedua arah tertutup (hang-up)
        const HUP = 0b0001_0000;
        const ERROR = 0b0010_0000;
    }
}

/// Status channel di dalam poller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PollerIndex {
    /// Belum pernah terdaftar
    New = 0,
    /// Terdaftar di kernel
    Added = 1,
    /// Dikenal poller tapi interest kosong, tidak terdaftar di kernel
    Deleted = 2,
}

impl PollerIndex {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PollerIndex::Added,
            2 => PollerIndex::Deleted,
            _ => PollerIndex::New,
        }
    }
}

/// Callback event channel
pub type EventCallback = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Default, Clone)]
struct Handlers {
    read: Option<EventCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

/// Channel untuk satu fd, milik satu `EventLoop`.
///
/// Semua method yang mengubah interest hanya boleh dipanggil dari thread
/// loop pemilik; `EventLoop::update_channel` meng-assert hal tersebut.
pub struct Channel {
    owner: Weak<EventLoop>,
    fd: RawFd,
    interest: AtomicU8,
    revents: AtomicU8,
    index: AtomicU8,
    log_hup: AtomicBool,
    event_handling: AtomicBool,
    added_to_loop: AtomicBool,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    handlers: Mutex<Handlers>,
    me: Weak<Channel>,
}

impl Channel {
    /// Membuat channel baru untuk `fd` di `owner`
    pub fn new(owner: &Arc<EventLoop>, fd: RawFd) -> Arc<Self> {
        Self::with_owner(Arc::downgrade(owner), fd)
    }

    pub(crate) fn with_owner(owner: Weak<EventLoop>, fd: RawFd) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            owner,
            fd,
            interest: AtomicU8::new(0),
            revents: AtomicU8::new(0),
            index: AtomicU8::new(PollerIndex::New as u8),
            log_hup: AtomicBool::new(true),
            event_handling: AtomicBool::new(false),
            added_to_loop: AtomicBool::new(false),
            tie: Mutex::new(None),
            handlers: Mutex::new(Handlers::default()),
            me: me.clone(),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn interest(&self) -> Interest {
        Interest::from_bits_truncate(self.interest.load(Ordering::Acquire))
    }

    #[inline]
    pub fn revents(&self) -> Ready {
        Ready::from_bits_truncate(self.revents.load(Ordering::Acquire))
    }

    /// Dipanggil poller sebelum channel masuk active list
    #[inline]
    pub fn set_revents(&self, ready: Ready) {
        self.revents.store(ready.bits(), Ordering::Release);
    }

    #[inline]
    pub fn index(&self) -> PollerIndex {
        PollerIndex::from_u8(self.index.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_index(&self, index: PollerIndex) {
        self.index.store(index as u8, Ordering::Release);
    }

    /// Weak handle ke channel ini, untuk disimpan di map poller
    pub fn downgrade(&self) -> Weak<Channel> {
        self.me.clone()
    }

    pub fn owner_loop(&self) -> Option<Arc<EventLoop>> {
        self.owner.upgrade()
    }

    pub(crate) fn owner_ptr(&self) -> *const EventLoop {
        self.owner.as_ptr()
    }

    #[inline]
    pub fn is_none_event(&self) -> bool {
        self.interest().is_empty()
    }

    #[inline]
    pub fn is_reading(&self) -> bool {
        self.interest().contains(Interest::READ)
    }

    #[inline]
    pub fn is_writing(&self) -> bool {
        self.interest().contains(Interest::WRITE)
    }

    pub fn set_read_callback<F>(&self, cb: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.handlers.lock().read = Some(Arc::new(cb));
    }

    pub fn set_write_callback<F>(&self, cb: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.handlers.lock().write = Some(Arc::new(cb));
    }

    pub fn set_close_callback<F>(&self, cb: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.handlers.lock().close = Some(Arc::new(cb));
    }

    pub fn set_error_callback<F>(&self, cb: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.handlers.lock().error = Some(Arc::new(cb));
    }

    /// Ikat channel ke pemilik yang bisa hilang saat dispatch. Event untuk
    /// pemilik yang sudah di-drop dibuang tanpa memanggil callback.
    pub fn tie<T: Any + Send + Sync>(&self, owner: &Arc<T>) {
        let weak: Weak<T> = Arc::downgrade(owner);
        *self.tie.lock() = Some(weak as Weak<dyn Any + Send + Sync>);
    }

    pub fn set_log_hup(&self, on: bool) {
        self.log_hup.store(on, Ordering::Relaxed);
    }

    pub fn enable_reading(&self) {
        self.interest.fetch_or(Interest::READ.bits(), Ordering::AcqRel);
        self.update();
    }

    pub fn disable_reading(&self) {
        self.interest
            .fetch_and(!Interest::READ.bits(), Ordering::AcqRel);
        self.update();
    }

    pub fn enable_writing(&self) {
        self.interest.fetch_or(Interest::WRITE.bits(), Ordering::AcqRel);
        self.update();
    }

    pub fn disable_writing(&self) {
        self.interest
            .fetch_and(!Interest::WRITE.bits(), Ordering::AcqRel);
        self.update();
    }

    pub fn disable_all(&self) {
        self.interest.store(0, Ordering::Release);
        self.update();
    }

    /// Lepas channel dari poller. Interest harus sudah kosong.
    pub fn remove(&self) {
        debug_assert!(self.is_none_event(), "remove channel with live interest");
        self.added_to_loop.store(false, Ordering::Release);
        if let Some(owner) = self.owner.upgrade() {
            owner.remove_channel(self);
        }
    }

    /// Dispatch readiness terakhir: read, write, close, lalu error.
    pub fn handle_event(&self) {
        let tied = self.tie.lock().clone();
        // Pemilik ditahan hidup sampai dispatch selesai
        let _owner = match tied {
            Some(weak) => match weak.upgrade() {
                Some(owner) => Some(owner),
                None => {
                    trace!(fd = self.fd, "tied owner gone, event dropped");
                    return;
                }
            },
            None => None,
        };
        self.handle_event_with_guard();
    }

    fn handle_event_with_guard(&self) {
        self.event_handling.store(true, Ordering::Release);
        let revents = self.revents();
        let handlers = self.handlers.lock().clone();
        trace!(fd = self.fd, ?revents, interest = ?self.interest(), "channel event");

        if revents.intersects(Ready::READABLE | Ready::PRIORITY | Ready::READ_CLOSED)
            && self.is_reading()
        {
            if let Some(cb) = &handlers.read {
                cb();
            }
        }

        if revents.contains(Ready::WRITABLE) && self.is_writing() {
            if let Some(cb) = &handlers.write {
                cb();
            }
        }

        if revents.contains(Ready::HUP)
            && !revents.contains(Ready::READABLE)
            && !self.is_none_event()
        {
            if self.log_hup.load(Ordering::Relaxed) {
                warn!(fd = self.fd, "channel hang-up");
            }
            if let Some(cb) = &handlers.close {
                cb();
            }
        }

        if revents.contains(Ready::ERROR) && !self.is_none_event() {
            if let Some(cb) = &handlers.error {
                cb();
            }
        }

        self.event_handling.store(false, Ordering::Release);
    }

    pub(crate) fn is_event_handling(&self) -> bool {
        self.event_handling.load(Ordering::Acquire)
    }

    fn update(&self) {
        self.added_to_loop.store(true, Ordering::Release);
        if let Some(owner) = self.owner.upgrade() {
            owner.update_channel(self);
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("interest", &self.interest())
            .field("revents", &self.revents())
            .field("index", &self.index())
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(!self.event_handling.load(Ordering::Acquire));
        if self.added_to_loop.load(Ordering::Acquire) {
            trace!(fd = self.fd, "channel dropped while still known to its loop");
        }
    }
}

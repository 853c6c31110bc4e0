//! Event loop: satu per thread
//!
//! Siklus tiap iterasi:
//! 1. poll multiplexer dengan timeout terbatas
//! 2. dispatch event setiap channel aktif
//! 3. jalankan task dari thread lain (queue di-swap kosong dulu)
//!
//! Semua mutasi poller dan state internal komponen network terjadi di
//! thread loop; thread lain masuk lewat `run_in_loop`/`queue_in_loop`.

use std::cell::Cell;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use super::channel::Channel;
use super::poller::{new_default_poller, Poller};
use crate::config::LoopConfig;
use crate::error::fatal;

/// Task lintas thread
pub type Task = Box<dyn FnOnce() + Send + 'static>;

static NEXT_LOOP_ID: AtomicUsize = AtomicUsize::new(1);
static IGNORE_SIGPIPE: Once = Once::new();

thread_local! {
    /// Id loop yang hidup di thread ini (0 = tidak ada)
    static LOOP_IN_THIS_THREAD: Cell<usize> = const { Cell::new(0) };
}

/// eventfd untuk membangunkan poll dari thread lain
struct WakeupFd(OwnedFd);

impl WakeupFd {
    fn new() -> io::Result<Self> {
        // SAFETY: eventfd tidak menyentuh memori; fd dicek sebelum dipakai
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd baru saja dibuat dan hanya dimiliki di sini
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    fn raw(&self) -> RawFd {
        self.0.as_raw_fd()
    }

    fn notify(&self) {
        let one: u64 = 1;
        // SAFETY: menulis 8 byte dari stack ke eventfd milik kita
        let n = unsafe {
            libc::write(
                self.raw(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            error!(written = n, "wakeup wrote wrong number of bytes");
        }
    }

    fn drain(&self) {
        let mut value: u64 = 0;
        // SAFETY: membaca 8 byte ke variabel di stack
        let n = unsafe {
            libc::read(
                self.raw(),
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                error!(read = n, error = %err, "wakeup read wrong number of bytes");
            }
        }
    }
}

/// Reactor untuk satu thread.
///
/// Dibuat lewat `EventLoop::new` di thread yang nantinya memanggil `run`.
/// Handle `Arc<EventLoop>` boleh dibagi ke thread lain untuk submit task.
pub struct EventLoop {
    id: usize,
    thread_id: ThreadId,
    looping: AtomicBool,
    quit: AtomicBool,
    event_handling: AtomicBool,
    calling_pending: AtomicBool,
    iteration: AtomicU64,
    poll_timeout: Duration,
    poller: Mutex<Box<dyn Poller>>,
    wakeup: WakeupFd,
    wakeup_channel: Arc<Channel>,
    pending: Mutex<Vec<Task>>,
}

impl EventLoop {
    /// Membuat loop untuk thread ini dengan konfigurasi default
    pub fn new() -> io::Result<Arc<Self>> {
        Self::with_config(LoopConfig::default())
    }

    /// Membuat loop untuk thread ini.
    ///
    /// Abort kalau thread ini sudah punya loop lain.
    pub fn with_config(config: LoopConfig) -> io::Result<Arc<Self>> {
        IGNORE_SIGPIPE.call_once(|| {
            // SAFETY: hanya mengganti disposition SIGPIPE ke SIG_IGN
            unsafe {
                libc::signal(libc::SIGPIPE, libc::SIG_IGN);
            }
        });

        let existing = LOOP_IN_THIS_THREAD.with(Cell::get);
        if existing != 0 {
            error!(
                existing,
                thread = ?thread::current().id(),
                "another EventLoop already exists in this thread"
            );
            std::process::abort();
        }

        let poller = new_default_poller(&config)?;
        let wakeup = WakeupFd::new()?;
        let id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
        let wakeup_fd = wakeup.raw();

        let event_loop = Arc::new_cyclic(|me| EventLoop {
            id,
            thread_id: thread::current().id(),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            event_handling: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
            poll_timeout: config.poll_timeout,
            poller: Mutex::new(poller),
            wakeup,
            wakeup_channel: Channel::with_owner(me.clone(), wakeup_fd),
            pending: Mutex::new(Vec::new()),
        });
        LOOP_IN_THIS_THREAD.with(|c| c.set(id));

        let weak = Arc::downgrade(&event_loop);
        event_loop.wakeup_channel.set_read_callback(move || {
            if let Some(lp) = weak.upgrade() {
                lp.wakeup.drain();
            }
        });
        event_loop.wakeup_channel.enable_reading();

        debug!(id, thread = ?event_loop.thread_id, "event loop created");
        Ok(event_loop)
    }

    /// Jalankan loop sampai `quit`. Harus dari thread pembuat.
    pub fn run(&self) {
        assert!(
            !self.looping.load(Ordering::Acquire),
            "EventLoop::run called while already looping"
        );
        self.assert_in_loop_thread();
        self.looping.store(true, Ordering::Release);
        info!(id = self.id, "event loop start looping");

        let mut active: Vec<Arc<Channel>> = Vec::new();
        while !self.quit.load(Ordering::Acquire) {
            active.clear();
            let polled = self
                .poller
                .lock()
                .poll(Some(self.poll_timeout), &mut active);
            if let Err(e) = polled {
                error!(id = self.id, error = %e, "poll error");
            }
            self.iteration.fetch_add(1, Ordering::Relaxed);

            self.event_handling.store(true, Ordering::Release);
            for channel in &active {
                channel.handle_event();
            }
            // Lepas referensi channel sebelum task: channel yang di-remove
            // selama dispatch bisa di-drop di sini
            active.clear();
            self.event_handling.store(false, Ordering::Release);

            self.do_pending_tasks();
        }

        info!(id = self.id, "event loop stop looping");
        self.looping.store(false, Ordering::Release);
        self.quit.store(false, Ordering::Release);
    }

    /// Minta loop berhenti setelah iterasi sekarang selesai.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Jalankan langsung kalau di thread loop, selain itu antre dan bangunkan.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Selalu antre. Task yang diantre saat dispatch atau saat task lain
    /// berjalan tetap dieksekusi sebelum poll berikutnya.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending.lock().push(Box::new(task));
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    pub fn queue_size(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn wakeup(&self) {
        self.wakeup.notify();
    }

    pub fn update_channel(&self, channel: &Channel) {
        debug_assert!(std::ptr::eq(channel.owner_ptr(), self));
        self.assert_in_loop_thread();
        if let Err(e) = self.poller.lock().update_channel(channel) {
            fatal("failed to register channel with the poller", &e);
        }
    }

    pub fn remove_channel(&self, channel: &Channel) {
        debug_assert!(std::ptr::eq(channel.owner_ptr(), self));
        self.assert_in_loop_thread();
        if let Err(e) = self.poller.lock().remove_channel(channel) {
            error!(fd = channel.fd(), error = %e, "failed to deregister channel");
        }
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        self.poller.lock().has_channel(channel)
    }

    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        self.thread_id == thread::current().id()
    }

    /// Panic kalau dipanggil dari thread lain
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            self.abort_not_in_loop_thread();
        }
    }

    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    pub fn is_event_handling(&self) -> bool {
        self.event_handling.load(Ordering::Acquire)
    }

    /// Jumlah iterasi poll sejak loop dibuat
    pub fn iteration(&self) -> u64 {
        self.iteration.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    fn do_pending_tasks(&self) {
        self.calling_pending.store(true, Ordering::Release);
        let tasks = std::mem::take(&mut *self.pending.lock());
        if !tasks.is_empty() {
            trace!(id = self.id, count = tasks.len(), "running pending tasks");
        }
        for task in tasks {
            task();
        }
        self.calling_pending.store(false, Ordering::Release);
    }

    #[cold]
    fn abort_not_in_loop_thread(&self) -> ! {
        error!(
            id = self.id,
            owner = ?self.thread_id,
            current = ?thread::current().id(),
            "EventLoop accessed from a foreign thread"
        );
        panic!(
            "EventLoop {} was created in thread {:?}, current thread is {:?}",
            self.id,
            self.thread_id,
            thread::current().id()
        );
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.id)
            .field("thread_id", &self.thread_id)
            .field("looping", &self.is_looping())
            .field("iteration", &self.iteration())
            .finish()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        debug!(id = self.id, "event loop destroyed");
        // Owner sudah tidak bisa di-upgrade: disable_all hanya mengosongkan interest
        self.wakeup_channel.disable_all();
        let poller = self.poller.get_mut();
        if let Err(e) = poller.remove_channel(&self.wakeup_channel) {
            trace!(id = self.id, error = %e, "wakeup channel already gone");
        }
        if self.is_in_loop_thread() {
            LOOP_IN_THIS_THREAD.with(|c| {
                if c.get() == self.id {
                    c.set(0);
                }
            });
        }
    }
}

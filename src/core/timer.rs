//! Timer scheduler berbasis min-heap dengan virtual tick
//!
//! Satu thread khusus memajukan counter tick setiap `tick` (default 1ms).
//! Deadline dihitung dalam tick, bukan wall-clock, jadi timer tetap urut
//! walaupun thread scheduler sempat tertunda.
//!
//! Dua jalur pemanggilan:
//! - Dari thread scheduler sendiri (di dalam action): operasi di-stage di
//!   thread-local tanpa lock, lalu diterapkan setelah action selesai
//! - Dari thread lain: lewat mutex heap

use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::config::SchedulerConfig;

/// Identitas timer untuk `delete_timer`. `TimerId(0)` tidak pernah valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl TimerId {
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.0 >= 1
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

type TimerAction = Box<dyn FnMut() + Send + 'static>;

struct Timer {
    id: u64,
    deadline: u64,
    interval: u64,
    repeat: bool,
    action: TimerAction,
}

// BinaryHeap adalah max-heap: urutan dibalik supaya deadline terkecil di atas.
// Tie-break dengan id supaya urutan deterministik.
impl Ord for Timer {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for Timer {}

/// Heap plus status timer yang sedang dieksekusi.
#[derive(Default)]
struct TimerQueue {
    heap: BinaryHeap<Timer>,
    running: Option<u64>,
    running_cancelled: bool,
}

impl TimerQueue {
    fn push(&mut self, timer: Timer) {
        self.heap.push(timer);
    }

    /// Hapus timer `id`. Timer yang sedang berjalan ditandai supaya tidak
    /// di-insert ulang.
    fn remove(&mut self, id: u64) -> bool {
        if self.running == Some(id) {
            self.running_cancelled = true;
        }
        let before = self.heap.len();
        self.heap.retain(|t| t.id != id);
        before != self.heap.len()
    }

    fn pop_expired(&mut self, now: u64) -> Option<Timer> {
        if self.heap.peek().is_some_and(|t| t.deadline <= now) {
            let timer = self.heap.pop()?;
            self.running = Some(timer.id);
            self.running_cancelled = false;
            Some(timer)
        } else {
            None
        }
    }

    /// Selesai menjalankan timer: true kalau timer tersebut dihapus
    /// selama action berjalan.
    fn finish_running(&mut self) -> bool {
        self.running = None;
        std::mem::take(&mut self.running_cancelled)
    }

    fn len(&self) -> usize {
        self.heap.len()
    }
}

/// Operasi yang di-stage dari dalam action (jalur tanpa lock).
/// Diterapkan sesuai urutan pemanggilan.
enum StagedOp {
    Add(Timer),
    Delete(u64),
}

#[derive(Default)]
struct Staged {
    owner: usize,
    ops: Vec<StagedOp>,
}

thread_local! {
    static STAGED: RefCell<Option<Staged>> = const { RefCell::new(None) };
}

struct Shared {
    queue: Mutex<TimerQueue>,
    timeline: AtomicU64,
    next_id: AtomicU64,
    running: AtomicBool,
    tick: Duration,
    thread_id: OnceLock<ThreadId>,
}

impl Shared {
    fn new(tick: Duration) -> Self {
        Self {
            queue: Mutex::new(TimerQueue::default()),
            timeline: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
            tick,
            thread_id: OnceLock::new(),
        }
    }

    #[inline]
    fn key(&self) -> usize {
        self as *const Shared as usize
    }

    fn ticks_for(&self, interval: Duration) -> u64 {
        let tick = self.tick.as_nanos().max(1);
        let ticks = interval.as_nanos().div_ceil(tick);
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    /// Jalankan semua timer yang deadline-nya sudah lewat pada tick sekarang.
    fn run_tick(&self) {
        let now = self.timeline.load(Ordering::Acquire);
        loop {
            let due = self.queue.lock().pop_expired(now);
            let Some(mut timer) = due else {
                break;
            };

            STAGED.with(|s| {
                *s.borrow_mut() = Some(Staged {
                    owner: self.key(),
                    ..Staged::default()
                })
            });
            trace!(id = timer.id, now, "timer fired");
            (timer.action)();
            let staged = STAGED.with(|s| s.borrow_mut().take()).unwrap_or_default();

            let mut queue = self.queue.lock();
            for op in staged.ops {
                match op {
                    StagedOp::Add(t) => queue.push(t),
                    StagedOp::Delete(id) => {
                        queue.remove(id);
                    }
                }
            }
            let cancelled = queue.finish_running();
            if timer.repeat && !cancelled {
                timer.deadline = now + timer.interval;
                queue.push(timer);
            }
        }
    }

    fn is_staging(&self) -> bool {
        if self.thread_id.get() != Some(&thread::current().id()) {
            return false;
        }
        STAGED.with(|s| s.borrow().as_ref().is_some_and(|st| st.owner == self.key()))
    }
}

/// Handle ke scheduler; murah untuk di-clone dan aman dipakai dari thread mana pun.
#[derive(Clone)]
pub struct TimerScheduler {
    shared: Arc<Shared>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl fmt::Debug for TimerScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerScheduler")
            .field("tick", &self.shared.tick)
            .field("timeline", &self.now_ticks())
            .field("pending", &self.pending_timers())
            .finish()
    }
}

impl TimerScheduler {
    /// Start thread scheduler.
    pub fn start(config: SchedulerConfig) -> io::Result<Self> {
        let shared = Arc::new(Shared::new(config.tick));
        shared.running.store(true, Ordering::Release);

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                let _ = worker_shared.thread_id.set(thread::current().id());
                debug!(tick = ?worker_shared.tick, "timer scheduler started");
                while worker_shared.running.load(Ordering::Acquire) {
                    worker_shared.run_tick();
                    thread::sleep(worker_shared.tick);
                    worker_shared.timeline.fetch_add(1, Ordering::AcqRel);
                }
                debug!("timer scheduler stopped");
            })?;

        info!(tick = ?config.tick, thread = %config.thread_name, "timer scheduler running");
        Ok(Self {
            shared,
            worker: Arc::new(Mutex::new(Some(handle))),
        })
    }

    /// Tambah timer. Deadline = `now` kalau `no_delay`, selain itu `now + interval`.
    pub fn add_timer<F>(&self, interval: Duration, repeat: bool, no_delay: bool, action: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.insert(id, interval, repeat, no_delay, Box::new(action))
    }

    /// Seperti `add_timer` dengan id dari caller. Timer lama dengan id yang
    /// sama tidak diganti.
    pub fn add_timer_with_id<F>(
        &self,
        id: TimerId,
        interval: Duration,
        repeat: bool,
        no_delay: bool,
        action: F,
    ) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.insert(id.0, interval, repeat, no_delay, Box::new(action))
    }

    /// One-shot setelah `delay`
    pub fn run_after<F>(&self, delay: Duration, action: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let mut action = Some(action);
        self.add_timer(delay, false, false, move || {
            if let Some(f) = action.take() {
                f()
            }
        })
    }

    /// Berulang setiap `interval`, pertama kali setelah satu interval
    pub fn run_every<F>(&self, interval: Duration, action: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.add_timer(interval, true, false, action)
    }

    /// Hapus timer. Id yang tidak dikenal atau sudah dihapus = no-op.
    pub fn delete_timer(&self, id: TimerId) {
        if !id.is_valid() {
            return;
        }
        if self.shared.is_staging() {
            STAGED.with(|s| {
                if let Some(staged) = s.borrow_mut().as_mut() {
                    staged.ops.push(StagedOp::Delete(id.0));
                }
            });
            return;
        }
        let removed = self.shared.queue.lock().remove(id.0);
        trace!(%id, removed, "timer deleted");
    }

    /// Tick virtual sekarang
    pub fn now_ticks(&self) -> u64 {
        self.shared.timeline.load(Ordering::Acquire)
    }

    pub fn tick(&self) -> Duration {
        self.shared.tick
    }

    /// Jumlah timer di heap (tidak termasuk yang sedang di-stage)
    pub fn pending_timers(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Hentikan thread scheduler dan join. Dari dalam action hanya
    /// menghentikan loop tanpa join.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("timer scheduler thread panicked");
            }
        }
    }

    fn insert(&self, id: u64, interval: Duration, repeat: bool, no_delay: bool, action: TimerAction) -> TimerId {
        let mut interval = self.shared.ticks_for(interval);
        // interval 0 yang berulang akan di-insert ulang di tick yang sama terus
        if repeat {
            interval = interval.max(1);
        }
        let now = self.shared.timeline.load(Ordering::Acquire);
        let timer = Timer {
            id,
            deadline: if no_delay { now } else { now.saturating_add(interval) },
            interval,
            repeat,
            action,
        };
        trace!(id, deadline = timer.deadline, repeat, "timer added");

        if self.shared.is_staging() {
            STAGED.with(|s| {
                if let Some(staged) = s.borrow_mut().as_mut() {
                    staged.ops.push(StagedOp::Add(timer));
                }
            });
        } else {
            self.shared.queue.lock().push(timer);
        }
        TimerId(id)
    }

    /// Scheduler tanpa thread; tick dimajukan manual lewat `advance`.
    #[cfg(test)]
    fn manual(tick: Duration) -> Self {
        let shared = Arc::new(Shared::new(tick));
        shared.running.store(true, Ordering::Release);
        let _ = shared.thread_id.set(thread::current().id());
        Self {
            shared,
            worker: Arc::new(Mutex::new(None)),
        }
    }

    #[cfg(test)]
    fn advance(&self, ticks: u64) {
        for _ in 0..ticks {
            self.shared.run_tick();
            self.shared.timeline.fetch_add(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    fn recorder() -> (Arc<Mutex<Vec<u64>>>, impl Fn(u64) -> Box<dyn FnMut() + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        let make = move |tag: u64| {
            let l = Arc::clone(&l);
            Box::new(move || l.lock().push(tag)) as Box<dyn FnMut() + Send>
        };
        (log, make)
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let sched = TimerScheduler::manual(Duration::from_millis(1));
        let (log, make) = recorder();

        sched.add_timer(Duration::from_millis(30), false, false, make(3));
        sched.add_timer(Duration::from_millis(10), false, false, make(1));
        sched.add_timer(Duration::from_millis(20), false, false, make(2));

        sched.advance(9);
        assert!(log.lock().is_empty());
        sched.advance(30);
        assert_eq!(*log.lock(), vec![1, 2, 3]);
        assert_eq!(sched.pending_timers(), 0);
    }

    #[test]
    fn test_no_delay_fires_on_next_tick() {
        let sched = TimerScheduler::manual(Duration::from_millis(1));
        let (log, make) = recorder();
        sched.add_timer(Duration::from_millis(100), false, true, make(7));
        sched.advance(1);
        assert_eq!(*log.lock(), vec![7]);
    }

    #[test]
    fn test_repeat_until_deleted() {
        let sched = TimerScheduler::manual(Duration::from_millis(1));
        let fired = Arc::new(Mutex::new(Vec::new()));
        let f = Arc::clone(&fired);
        let handle = sched.clone();
        let id = sched.add_timer(Duration::from_millis(5), true, false, move || {
            f.lock().push(handle.now_ticks());
        });

        sched.advance(21);
        assert_eq!(*fired.lock(), vec![5, 10, 15, 20]);

        sched.delete_timer(id);
        sched.advance(20);
        assert_eq!(fired.lock().len(), 4);
    }

    #[test]
    fn test_delete_before_fire() {
        let sched = TimerScheduler::manual(Duration::from_millis(1));
        let (log, make) = recorder();
        let a = sched.add_timer(Duration::from_millis(5), false, false, make(1));
        sched.add_timer(Duration::from_millis(5), false, false, make(2));

        sched.delete_timer(a);
        sched.delete_timer(TimerId(9999));
        sched.delete_timer(TimerId(0));
        sched.advance(10);
        assert_eq!(*log.lock(), vec![2]);
    }

    #[test]
    fn test_action_deletes_itself() {
        let sched = TimerScheduler::manual(Duration::from_millis(1));
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let handle = sched.clone();
        let id = TimerId(42);
        sched.add_timer_with_id(id, Duration::from_millis(2), true, false, move || {
            if c.fetch_add(1, Ordering::SeqCst) == 2 {
                handle.delete_timer(id);
            }
        });

        sched.advance(50);
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(sched.pending_timers(), 0);
    }

    #[test]
    fn test_action_adds_timer_via_staging() {
        let sched = TimerScheduler::manual(Duration::from_millis(1));
        let (log, make) = recorder();
        let handle = sched.clone();
        let mut follow_up = Some(make(2));
        sched.run_after(Duration::from_millis(3), move || {
            if let Some(f) = follow_up.take() {
                handle.add_timer(Duration::from_millis(3), false, false, f);
            }
        });
        let mut first = make(1);
        sched.run_after(Duration::from_millis(1), move || first());

        sched.advance(4);
        assert_eq!(*log.lock(), vec![1]);
        assert_eq!(sched.pending_timers(), 1);
        sched.advance(4);
        assert_eq!(*log.lock(), vec![1, 2]);
    }

    #[test]
    fn test_add_then_delete_inside_action() {
        let sched = TimerScheduler::manual(Duration::from_millis(1));
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let handle = sched.clone();
        sched.run_after(Duration::from_millis(1), move || {
            let c = Arc::clone(&c);
            let id = handle.add_timer(Duration::from_millis(2), false, false, move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
            handle.delete_timer(id);
        });

        sched.advance(10);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(sched.pending_timers(), 0);
    }

    #[test]
    fn test_delete_then_add_same_id_inside_action() {
        let sched = TimerScheduler::manual(Duration::from_millis(1));
        let (log, make) = recorder();
        let id = TimerId(77);
        sched.add_timer_with_id(id, Duration::from_millis(5), false, false, make(1));

        let handle = sched.clone();
        let mut replacement = Some(make(2));
        sched.run_after(Duration::from_millis(1), move || {
            handle.delete_timer(id);
            if let Some(f) = replacement.take() {
                handle.add_timer_with_id(id, Duration::from_millis(2), false, false, f);
            }
        });

        sched.advance(10);
        assert_eq!(*log.lock(), vec![2]);
    }

    #[test]
    fn test_action_deletes_other_timer() {
        let sched = TimerScheduler::manual(Duration::from_millis(1));
        let (log, make) = recorder();
        let victim = sched.add_timer(Duration::from_millis(5), true, false, make(9));
        let handle = sched.clone();
        let mut killer = make(1);
        sched.run_after(Duration::from_millis(2), move || {
            killer();
            handle.delete_timer(victim);
        });

        sched.advance(30);
        assert_eq!(*log.lock(), vec![1]);
        assert_eq!(sched.pending_timers(), 0);
    }

    #[test]
    fn test_zero_interval_repeat_advances() {
        let sched = TimerScheduler::manual(Duration::from_millis(1));
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        sched.add_timer(Duration::ZERO, true, false, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        sched.advance(5);
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_interval_rounds_up_to_tick() {
        let shared = Shared::new(Duration::from_millis(2));
        assert_eq!(shared.ticks_for(Duration::from_millis(5)), 3);
        assert_eq!(shared.ticks_for(Duration::from_millis(4)), 2);
        assert_eq!(shared.ticks_for(Duration::ZERO), 0);
    }

    #[test]
    fn test_threaded_scheduler_from_other_thread() {
        let sched = TimerScheduler::start(SchedulerConfig::default()).unwrap();
        let (tx, rx) = mpsc::channel();

        let started = Instant::now();
        for (delay, tag) in [(60u64, 3u32), (20, 1), (40, 2)] {
            let tx = tx.clone();
            sched.run_after(Duration::from_millis(delay), move || {
                let _ = tx.send(tag);
            });
        }

        let got: Vec<u32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(got, vec![1, 2, 3]);
        assert!(started.elapsed() >= Duration::from_millis(60));

        sched.stop();
        assert!(!sched.is_running());
    }
}

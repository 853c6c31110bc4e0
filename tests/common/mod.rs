//! Helper bersama untuk integration test
#![allow(dead_code)]

use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use loomnet::EventLoop;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polling sampai `cond` true atau timeout
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Jalankan `f` di thread loop dan tunggu hasilnya
pub fn in_loop<T, F>(lp: &Arc<EventLoop>, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    lp.run_in_loop(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(TIMEOUT).expect("loop did not run the task")
}

/// Barrier: task yang antre sebelum ini, termasuk task yang mereka
/// antrekan lagi, sudah jalan
pub fn sync(lp: &Arc<EventLoop>) {
    in_loop(lp, || ());
    in_loop(lp, || ());
}

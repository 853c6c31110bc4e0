//! Thread khusus yang menjalankan satu `EventLoop`

use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use super::event_loop::EventLoop;
use crate::config::LoopConfig;

/// Hook yang dijalankan di thread loop sebelum `run`
pub type ThreadInitCallback = Box<dyn FnOnce(&Arc<EventLoop>) + Send + 'static>;

/// Memiliki satu thread dan loop di dalamnya.
///
/// `start` baru kembali setelah loop selesai dibuat. Drop = `stop`.
pub struct EventLoopThread {
    name: String,
    config: LoopConfig,
    init: Option<ThreadInitCallback>,
    event_loop: Option<Arc<EventLoop>>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: LoopConfig::default(),
            init: None,
            event_loop: None,
            thread: None,
        }
    }

    pub fn with_config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    /// Set hook init (dipanggil di thread loop)
    pub fn with_init<F>(mut self, init: F) -> Self
    where
        F: FnOnce(&Arc<EventLoop>) + Send + 'static,
    {
        self.init = Some(Box::new(init));
        self
    }

    /// Spawn thread dan tunggu sampai loop siap.
    pub fn start(&mut self) -> io::Result<Arc<EventLoop>> {
        if let Some(lp) = &self.event_loop {
            return Ok(Arc::clone(lp));
        }

        let (tx, rx) = mpsc::sync_channel::<io::Result<Arc<EventLoop>>>(1);
        let init = self.init.take();
        let config = self.config.clone();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let event_loop = match EventLoop::with_config(config) {
                    Ok(lp) => lp,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                if let Some(init) = init {
                    init(&event_loop);
                }
                if tx.send(Ok(Arc::clone(&event_loop))).is_err() {
                    return;
                }
                event_loop.run();
                debug!(id = event_loop.id(), "event loop thread exiting");
            })?;

        let event_loop = rx
            .recv()
            .map_err(|_| io::Error::other("event loop thread exited during startup"))??;
        self.thread = Some(handle);
        self.event_loop = Some(Arc::clone(&event_loop));
        Ok(event_loop)
    }

    pub fn event_loop(&self) -> Option<&Arc<EventLoop>> {
        self.event_loop.as_ref()
    }

    /// Quit loop lalu join thread.
    pub fn stop(&mut self) {
        if let Some(lp) = self.event_loop.take() {
            lp.quit();
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!(name = %self.name, "event loop thread panicked");
            }
        }
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.stop();
    }
}

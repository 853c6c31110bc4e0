//! Readiness multiplexer
//!
//! `Poller` adalah capability interface; `EpollPoller` adalah satu-satunya
//! backend dan memakai mio (epoll di Linux). mio selalu edge-triggered, jadi
//! handler wajib membaca/menulis sampai `WouldBlock`.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use std::time::Duration;

use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use tracing::{debug, error, trace};

use super::channel::{Channel, Interest, PollerIndex, Ready};
use crate::config::LoopConfig;

/// Backend multiplexer milik satu `EventLoop`.
///
/// Semua method hanya dipanggil dari thread loop pemilik.
pub trait Poller: Send {
    /// Tunggu readiness maksimal `timeout` lalu push channel aktif ke `active`.
    fn poll(&mut self, timeout: Option<Duration>, active: &mut Vec<Arc<Channel>>) -> io::Result<()>;

    /// Sinkronkan interest channel dengan kernel.
    fn update_channel(&mut self, channel: &Channel) -> io::Result<()>;

    /// Lupakan channel. Interest channel harus sudah kosong.
    fn remove_channel(&mut self, channel: &Channel) -> io::Result<()>;

    fn has_channel(&self, channel: &Channel) -> bool;
}

/// Backend default untuk platform ini
pub fn new_default_poller(config: &LoopConfig) -> io::Result<Box<dyn Poller>> {
    Ok(Box::new(EpollPoller::new(config.initial_events)?))
}

/// Poller berbasis mio
pub struct EpollPoller {
    poll: Poll,
    events: Events,
    channels: HashMap<RawFd, Weak<Channel>>,
}

impl EpollPoller {
    pub fn new(initial_events: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(initial_events.max(1)),
            channels: HashMap::new(),
        })
    }

    /// Kapasitas event batch sekarang
    pub fn events_capacity(&self) -> usize {
        self.events.capacity()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn register(&self, fd: RawFd, interest: mio::Interest) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), interest)
    }

    fn reregister(&self, fd: RawFd, interest: mio::Interest) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout: Option<Duration>, active: &mut Vec<Arc<Channel>>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                trace!("poll interrupted");
                return Ok(());
            }
            Err(e) => {
                error!(error = %e, "poll failed");
                return Err(e);
            }
        }

        let mut num_events = 0;
        for event in self.events.iter() {
            num_events += 1;
            let fd = event.token().0 as RawFd;
            match self.channels.get(&fd).and_then(Weak::upgrade) {
                Some(channel) => {
                    channel.set_revents(readiness(event));
                    active.push(channel);
                }
                None => trace!(fd, "event for unknown channel"),
            }
        }

        if num_events == 0 {
            trace!("nothing happened");
        } else if num_events == self.events.capacity() {
            // Batch penuh: gandakan kapasitas untuk iterasi berikutnya
            let capacity = num_events * 2;
            self.events = Events::with_capacity(capacity);
            debug!(capacity, "event batch grown");
        }
        Ok(())
    }

    fn update_channel(&mut self, channel: &Channel) -> io::Result<()> {
        let fd = channel.fd();
        let index = channel.index();
        trace!(fd, interest = ?channel.interest(), ?index, "update channel");

        match index {
            PollerIndex::New | PollerIndex::Deleted => {
                if index == PollerIndex::New {
                    self.channels.insert(fd, channel.downgrade());
                }
                match to_mio_interest(channel.interest()) {
                    Some(interest) => {
                        self.register(fd, interest)?;
                        channel.set_index(PollerIndex::Added);
                    }
                    None => channel.set_index(PollerIndex::Deleted),
                }
            }
            PollerIndex::Added => match to_mio_interest(channel.interest()) {
                Some(interest) => self.reregister(fd, interest)?,
                None => {
                    self.deregister(fd)?;
                    channel.set_index(PollerIndex::Deleted);
                }
            },
        }
        Ok(())
    }

    fn remove_channel(&mut self, channel: &Channel) -> io::Result<()> {
        let fd = channel.fd();
        trace!(fd, "remove channel");
        debug_assert!(channel.is_none_event());

        let known = self
            .channels
            .get(&fd)
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), channel));
        if known {
            self.channels.remove(&fd);
        }
        let index = channel.index();
        channel.set_index(PollerIndex::New);
        if index == PollerIndex::Added {
            self.deregister(fd)?;
        }
        Ok(())
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), channel))
    }
}

fn to_mio_interest(interest: Interest) -> Option<mio::Interest> {
    match (
        interest.contains(Interest::READ),
        interest.contains(Interest::WRITE),
    ) {
        (true, true) => Some(mio::Interest::READABLE.add(mio::Interest::WRITABLE)),
        (true, false) => Some(mio::Interest::READABLE),
        (false, true) => Some(mio::Interest::WRITABLE),
        (false, false) => None,
    }
}

fn readiness(event: &Event) -> Ready {
    let mut ready = Ready::empty();
    if event.is_readable() {
        ready |= Ready::READABLE;
    }
    if event.is_writable() {
        ready |= Ready::WRITABLE;
    }
    if event.is_priority() {
        ready |= Ready::PRIORITY;
    }
    if event.is_read_closed() {
        ready |= Ready::READ_CLOSED;
        if event.is_write_closed() {
            ready |= Ready::HUP;
        }
    }
    if event.is_error() {
        ready |= Ready::ERROR;
    }
    ready
}

//! Reactor Layer: event loop, channel, dan readiness multiplexer
//!
//! Prinsip desain:
//! - Satu loop per thread, dicek lewat thread-local
//! - State loop hanya disentuh dari thread-nya; thread lain submit task
//! - Backend multiplexer di balik trait `Poller`

mod channel;
mod event_loop;
mod loop_thread;
mod poller;

pub use channel::{Channel, EventCallback, Interest, PollerIndex, Ready};
pub use event_loop::{EventLoop, Task};
pub use loop_thread::{EventLoopThread, ThreadInitCallback};
pub use poller::{new_default_poller, EpollPoller, Poller};

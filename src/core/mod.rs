//! Core module: byte buffer dan timer scheduler
//!
//! Prinsip desain:
//! - Buffer: cheap prepend, compact sebelum grow, codec big-endian
//! - Timer: satu thread, min-heap, virtual tick

mod buffer;
mod timer;

pub use buffer::{Buffer, CHEAP_PREPEND, INITIAL_SIZE};
pub use timer::{TimerId, TimerScheduler};

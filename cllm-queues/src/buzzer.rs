//! A type that can unpark specific threads.

use std::thread::Thread;

/// Can unpark the thread that created it.
///
/// Workers and the coordinator construct one of these on their own thread and hand clones
/// to whichever producer should wake them once new work is available.
#[derive(Clone)]
pub struct Buzzer {
    thread: Thread,
}

impl Default for Buzzer {
    fn default() -> Self {
        Self { thread: std::thread::current() }
    }
}

impl Buzzer {
    /// Unparks the target thread.
    pub fn buzz(&self) {
        self.thread.unpark();
    }
}

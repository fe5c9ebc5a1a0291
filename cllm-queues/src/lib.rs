//! Bounded lock-free batch pipeline shared by the cllm training runtime.
//!
//! This crate holds the pieces of the system that cross thread boundaries without a
//! mutex: the [`PrefetchQueue`] (disk-reader to coordinator), the [`WorkQueue`]
//! (coordinator to worker spheres), the [`Running`] cancellation flag, and [`Buzzer`],
//! a thread-parking handle used to wake a consumer without a busy poll loop.

mod buzzer;
mod prefetch;
mod running;
mod work;

pub use buzzer::Buzzer;
pub use prefetch::{PrefetchQueue, DEFAULT_PREFETCH_CAPACITY};
pub use running::Running;
pub use work::{SharedWorkQueue, WorkQueue, DEFAULT_WORK_QUEUE_CAPACITY};

//! Watch entries: one per monitored live stream.

mod entry;
mod schedule;
mod state;

pub use entry::{MonitorMode, OfflineOutcome, WatchEntry};
pub use schedule::ScheduledWindow;
pub use state::WatchStatus;

//! Domain types.

pub mod watch;

pub use watch::{MonitorMode, ScheduledWindow, WatchEntry, WatchStatus};

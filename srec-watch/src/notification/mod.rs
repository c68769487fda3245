//! Notification delivery.
//!
//! Short text alerts are published to the [`NotificationDispatcher`], which
//! drops duplicates seen within the dedup window and feeds the rest through
//! a single FIFO queue. One consumer drains the queue, fanning each job out
//! to every enabled [`NotificationChannel`].
//!
//! # Example
//!
//! ```ignore
//! use srec_watch::notification::{NotificationDispatcher, DispatcherConfig, NotificationMessage};
//!
//! let dispatcher = Arc::new(NotificationDispatcher::new(DispatcherConfig::default()));
//! dispatcher.add_channel(build_channel(&config));
//! dispatcher.start(cancel.clone());
//! dispatcher.publish(NotificationMessage::stream_start("Streamer", Some("title")));
//! ```

pub mod channels;
mod dispatcher;
mod message;

pub use channels::{ChannelConfig, NotificationChannel, build_channel};
pub use dispatcher::{DispatcherConfig, DispatcherStats, NotificationDispatcher, NotificationJob, PublishOutcome};
pub use message::{NotificationKind, NotificationMessage, NotificationPriority};

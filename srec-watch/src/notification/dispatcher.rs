//! Deduplicating single-consumer notification queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChannelConfig, NotificationChannel, NotificationMessage, build_channel};

/// Dispatcher tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Identical (title, body) pairs within this window collapse into one.
    pub dedup_window: Duration,
    /// Pause between consecutive jobs.
    pub inter_job_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(30),
            inter_job_delay: Duration::from_millis(500),
        }
    }
}

/// A queued notification.
#[derive(Debug, Clone)]
pub struct NotificationJob {
    pub message: NotificationMessage,
    pub hash: String,
    pub enqueued_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Queued,
    /// Same content was published within the dedup window.
    Duplicate,
    /// The consumer is gone.
    Closed,
}

/// Dispatcher counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatcherStats {
    pub published: u64,
    pub duplicates: u64,
    /// Successful channel sends.
    pub delivered: u64,
    /// Failed channel sends.
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    duplicates: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Fans notifications out to the configured channels, one job at a time.
pub struct NotificationDispatcher {
    config: DispatcherConfig,
    channels: RwLock<Vec<Arc<dyn NotificationChannel>>>,
    recent: Mutex<HashMap<String, Instant>>,
    tx: mpsc::UnboundedSender<NotificationJob>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<NotificationJob>>>,
    counters: Counters,
}

impl NotificationDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config,
            channels: RwLock::new(Vec::new()),
            recent: Mutex::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            counters: Counters::default(),
        }
    }

    /// Build a dispatcher and register every enabled channel from `configs`.
    pub fn with_channels(config: DispatcherConfig, configs: &[ChannelConfig]) -> Self {
        let dispatcher = Self::new(config);
        for channel_config in configs {
            dispatcher.add_channel(build_channel(channel_config));
        }
        dispatcher
    }

    /// Register a channel. Disabled or incomplete channels are skipped.
    pub fn add_channel(&self, channel: Arc<dyn NotificationChannel>) -> bool {
        if !channel.is_enabled() {
            warn!(channel = channel.channel_type(), "Notification channel disabled or missing target, skipping");
            return false;
        }
        debug!(channel = channel.channel_type(), "Registered notification channel");
        self.channels.write().push(channel);
        true
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Queue a message unless identical content went out within the dedup window.
    pub fn publish(&self, message: NotificationMessage) -> PublishOutcome {
        let hash = message.dedup_hash();
        let now = Instant::now();

        {
            let mut recent = self.recent.lock();
            let window = self.config.dedup_window;
            recent.retain(|_, seen| now.duration_since(*seen) < window);
            if recent.contains_key(&hash) {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(title = %message.title, "Dropping duplicate notification");
                return PublishOutcome::Duplicate;
            }
            recent.insert(hash.clone(), now);
        }

        let job = NotificationJob {
            message,
            hash,
            enqueued_at: now,
        };
        match self.tx.send(job) {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                PublishOutcome::Queued
            }
            Err(_) => PublishOutcome::Closed,
        }
    }

    /// Spawn the single queue consumer. Returns `None` if already started.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let mut rx = self.rx.lock().take()?;
        let dispatcher = self.clone();

        Some(tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };

                dispatcher.deliver(&job).await;
                tokio::time::sleep(dispatcher.config.inter_job_delay).await;
            }
            debug!("Notification consumer shutting down");
        }))
    }

    /// Send one job to every channel concurrently and wait for all of them.
    async fn deliver(&self, job: &NotificationJob) {
        let channels: Vec<Arc<dyn NotificationChannel>> = self.channels.read().clone();
        if channels.is_empty() {
            debug!(title = %job.message.title, "No notification channels configured");
            return;
        }

        let sends = channels.iter().map(|channel| {
            let message = &job.message;
            async move { (channel.channel_type(), channel.send(message).await) }
        });

        let mut delivered = 0;
        for (channel, result) in futures::future::join_all(sends).await {
            match result {
                Ok(()) => {
                    delivered += 1;
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(channel, error = %e, title = %job.message.title, "Notification delivery failed");
                }
            }
        }

        info!(
            kind = %job.message.kind,
            delivered,
            channels = channels.len(),
            queued_for = ?job.enqueued_at.elapsed(),
            "Notification dispatched"
        );
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            published: self.counters.published.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::NotificationKind;
    use async_trait::async_trait;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<NotificationMessage>>,
    }

    #[async_trait]
    impl NotificationChannel for Recording {
        fn channel_type(&self) -> &'static str {
            "recording"
        }

        fn is_enabled(&self) -> bool {
            true
        }

        async fn send(&self, message: &NotificationMessage) -> crate::Result<()> {
            self.sent.lock().push(message.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl NotificationChannel for Failing {
        fn channel_type(&self) -> &'static str {
            "failing"
        }

        fn is_enabled(&self) -> bool {
            true
        }

        async fn send(&self, _message: &NotificationMessage) -> crate::Result<()> {
            Err(crate::Error::Other("boom".to_string()))
        }
    }

    struct Disabled;

    #[async_trait]
    impl NotificationChannel for Disabled {
        fn channel_type(&self) -> &'static str {
            "disabled"
        }

        fn is_enabled(&self) -> bool {
            false
        }

        async fn send(&self, _message: &NotificationMessage) -> crate::Result<()> {
            unreachable!()
        }
    }

    fn msg(body: &str) -> NotificationMessage {
        NotificationMessage::new(NotificationKind::StreamStart, "Stream started", body)
    }

    async fn wait_for(channel: &Recording, count: usize) {
        for _ in 0..200 {
            if channel.sent.lock().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn setup() -> (Arc<NotificationDispatcher>, Arc<Recording>, CancellationToken) {
        let dispatcher = Arc::new(NotificationDispatcher::new(DispatcherConfig::default()));
        let channel = Arc::new(Recording::default());
        dispatcher.add_channel(channel.clone());
        let cancel = CancellationToken::new();
        dispatcher.start(cancel.clone()).unwrap();
        (dispatcher, channel, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_within_window_delivered_once() {
        let (dispatcher, channel, _cancel) = setup();

        assert_eq!(dispatcher.publish(msg("a")), PublishOutcome::Queued);
        assert_eq!(dispatcher.publish(msg("a")), PublishOutcome::Duplicate);
        wait_for(&channel, 1).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(channel.sent.lock().len(), 1);
        assert_eq!(dispatcher.stats().duplicates, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_after_window_delivered_twice() {
        let (dispatcher, channel, _cancel) = setup();

        dispatcher.publish(msg("a"));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(dispatcher.publish(msg("a")), PublishOutcome::Queued);
        wait_for(&channel, 2).await;

        assert_eq!(channel.sent.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_order() {
        let (dispatcher, channel, _cancel) = setup();
        for body in ["1", "2", "3"] {
            dispatcher.publish(msg(body));
        }
        wait_for(&channel, 3).await;

        let bodies: Vec<String> = channel.sent.lock().iter().map(|m| m.body.clone()).collect();
        assert_eq!(bodies, ["1", "2", "3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_channel_does_not_block_others() {
        let dispatcher = Arc::new(NotificationDispatcher::new(DispatcherConfig::default()));
        let channel = Arc::new(Recording::default());
        dispatcher.add_channel(Arc::new(Failing));
        dispatcher.add_channel(channel.clone());
        dispatcher.start(CancellationToken::new()).unwrap();

        dispatcher.publish(msg("x"));
        dispatcher.publish(msg("y"));
        wait_for(&channel, 2).await;

        let stats = dispatcher.stats();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.failed, 2);
    }

    #[tokio::test]
    async fn test_disabled_channel_skipped() {
        let dispatcher = NotificationDispatcher::new(DispatcherConfig::default());
        assert!(!dispatcher.add_channel(Arc::new(Disabled)));
        assert_eq!(dispatcher.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_start_only_once() {
        let dispatcher = Arc::new(NotificationDispatcher::new(DispatcherConfig::default()));
        let cancel = CancellationToken::new();
        assert!(dispatcher.start(cancel.clone()).is_some());
        assert!(dispatcher.start(cancel.clone()).is_none());
        cancel.cancel();
    }
}

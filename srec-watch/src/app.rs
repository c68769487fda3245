//! Application state.
//!
//! `AppState` holds every shared component and manages their lifecycle:
//! it is built once at startup, handed out as `Arc<AppState>`, and torn
//! down by [`Recorder::shutdown`](crate::recorder::Recorder::shutdown).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::admission::{AdmissionGate, DiskProbe, LogWarningSink, SysinfoDiskProbe, WarningSink};
use crate::config::AppSettings;
use crate::handler::{HandlerCache, ResolverFactory};
use crate::notification::{DispatcherConfig, NotificationDispatcher};
use crate::supervisor::{DrainWorker, ProcessSupervisor, StopTimeouts};

/// Wait for background tasks to exit after cancellation.
const BACKGROUND_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared components, owned for the lifetime of the process.
pub struct AppState {
    pub settings: AppSettings,
    pub admission: AdmissionGate,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub handlers: Arc<HandlerCache>,
    pub supervisor: Arc<ProcessSupervisor>,
    /// Deferred post-capture work.
    pub drain: DrainWorker,
    /// Cancelled at shutdown; every background loop watches it.
    pub cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AppState {
    /// Build the state with the sysinfo disk probe and a log-only warning sink.
    pub fn new(settings: AppSettings, resolvers: Arc<dyn ResolverFactory>) -> Result<Arc<Self>> {
        Self::with_parts(
            settings,
            resolvers,
            Arc::new(SysinfoDiskProbe),
            Arc::new(LogWarningSink),
        )
    }

    pub fn with_parts(
        settings: AppSettings,
        resolvers: Arc<dyn ResolverFactory>,
        probe: Arc<dyn DiskProbe>,
        warnings: Arc<dyn WarningSink>,
    ) -> Result<Arc<Self>> {
        info!("Initializing application state");

        let dispatcher = Arc::new(NotificationDispatcher::with_channels(
            DispatcherConfig {
                dedup_window: Duration::from_secs(settings.dedup_window_secs),
                inter_job_delay: Duration::from_millis(settings.inter_job_delay_ms),
            },
            &settings.channels,
        ));

        let admission = AdmissionGate::new(
            settings.disk_threshold_bytes(),
            Duration::from_secs(settings.disk_notify_throttle_secs),
            probe,
            dispatcher.clone(),
            warnings,
        );

        let handlers = Arc::new(HandlerCache::new(
            resolvers,
            Duration::from_secs(settings.handler_idle_secs),
        ));
        let supervisor = Arc::new(ProcessSupervisor::new(StopTimeouts::from(&settings.stop_grace)));
        let drain = DrainWorker::start()?;

        debug!(
            channels = dispatcher.channel_count(),
            threshold_bytes = admission.threshold_bytes(),
            "Application state ready"
        );

        Ok(Arc::new(Self {
            settings,
            admission,
            dispatcher,
            handlers,
            supervisor,
            drain,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn the notification consumer, the handler sweeper and the process watcher.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        if let Some(consumer) = self.dispatcher.start(self.cancel.child_token()) {
            tasks.push(consumer);
        }
        tasks.push(self.handlers.spawn_sweeper(
            Duration::from_secs(self.settings.handler_sweep_secs),
            self.cancel.child_token(),
        ));
        tasks.push(self.supervisor.spawn_watcher(
            Duration::from_secs(self.settings.process_poll_secs),
            self.cancel.child_token(),
        ));
        info!(tasks = tasks.len(), "Background services started");
    }

    /// Cancel background loops and wait briefly for them to exit.
    pub async fn stop_background(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        let joined = tokio::time::timeout(BACKGROUND_STOP_TIMEOUT, futures::future::join_all(tasks)).await;
        if joined.is_err() {
            warn!("Background services did not stop in time");
        }
    }
}

//! The recording state machine.
//!
//! The [`Recorder`] owns every [`WatchEntry`] and drives the
//! detect → decide → act loop for each of them:
//!
//! 1. a scheduler tick finds entries whose check interval elapsed,
//! 2. a detect cycle queries liveness through the [`HandlerCache`](crate::handler::HandlerCache),
//! 3. live entries are either announced or captured, depending on the
//!    monitoring mode, the notify-only setting and the admission gate,
//! 4. an exit watcher per capture process folds the result back into the entry.
//!
//! Every per-entry failure ends up as the entry's status; nothing escapes
//! to the scheduler loop.

mod slot;
mod store;

pub use store::{EntryStore, JsonFileStore, MemoryStore};

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::slot::WatchSlot;
use crate::app::AppState;
use crate::capture::{CaptureCommand, CaptureRequest, CommandBuilder, convert_to_mp4, produced_files};
use crate::config::{VALID_FORMATS, validate_proxy};
use crate::domain::{MonitorMode, WatchEntry, WatchStatus};
use crate::domain::watch::OfflineOutcome;
use crate::handler::{HandlerKey, StreamInfo};
use crate::notification::NotificationMessage;
use crate::supervisor::{ExitOutcome, ProcessHandle};
use crate::utils::sanitize_filename;
use crate::{Error, Result};

/// Bound on waiting for deferred jobs at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shutdown waits one second per active capture, within these bounds.
const MIN_CAPTURE_GRACE_SECS: u64 = 2;
const MAX_CAPTURE_GRACE_SECS: u64 = 10;

/// Slack on top of the liveness timeout for in-flight detect cycles at shutdown.
const CYCLE_GRACE: Duration = Duration::from_secs(5);
/// Bound on exit watchers recording their results after the final stop.
const WATCHER_GRACE: Duration = Duration::from_secs(5);

/// Orchestrates liveness checks and captures for all watch entries.
pub struct Recorder {
    state: Arc<AppState>,
    builder: Arc<dyn CommandBuilder>,
    store: Arc<dyn EntryStore>,
    slots: DashMap<String, Arc<WatchSlot>>,
    save_lock: tokio::sync::Mutex<()>,
    /// Detect cycles spawned by the scheduler.
    cycles: Mutex<JoinSet<()>>,
    /// One exit watcher per running capture.
    watchers: Mutex<JoinSet<()>>,
}

impl Recorder {
    pub fn new(state: Arc<AppState>, builder: Arc<dyn CommandBuilder>, store: Arc<dyn EntryStore>) -> Arc<Self> {
        Arc::new(Self {
            state,
            builder,
            store,
            slots: DashMap::new(),
            save_lock: tokio::sync::Mutex::new(()),
            cycles: Mutex::new(JoinSet::new()),
            watchers: Mutex::new(JoinSet::new()),
        })
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    // ========== Entry management ==========

    /// Load persisted entries. Captures never survive a restart.
    pub async fn load(&self) -> Result<usize> {
        let entries = self.store.load().await?;
        let count = entries.len();

        for mut entry in entries {
            entry.reset_after_restart();
            if entry.platform.is_none() {
                entry.platform = self.state.handlers.platform_for(&entry.url);
            }
            self.slots.insert(entry.id.clone(), Arc::new(WatchSlot::new(entry)));
        }

        info!(count, "Loaded watch entries");
        Ok(count)
    }

    /// Validate and register a new entry. Returns its id.
    pub async fn add_entry(&self, mut entry: WatchEntry) -> Result<String> {
        let url = url::Url::parse(&entry.url)
            .map_err(|e| Error::validation(format!("invalid URL '{}': {e}", entry.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::validation(format!("unsupported URL scheme '{}'", url.scheme())));
        }
        if let Some(proxy) = &entry.proxy {
            validate_proxy(proxy)?;
        }
        if let Some(format) = &entry.format
            && !VALID_FORMATS.contains(&format.as_str())
        {
            return Err(Error::validation(format!("unsupported format '{format}'")));
        }
        if entry.check_interval_secs == 0 {
            return Err(Error::validation("check interval must be greater than zero"));
        }
        if !entry.invariant_holds() {
            return Err(Error::validation("entry cannot be capturing while offline"));
        }
        if self.slots.contains_key(&entry.id) {
            return Err(Error::validation(format!("entry {} already exists", entry.id)));
        }
        if self.slots.iter().any(|slot| slot.value().entry.lock().url == entry.url) {
            return Err(Error::validation(format!("{} is already watched", entry.url)));
        }

        entry.platform = self.state.handlers.platform_for(&entry.url);
        let id = entry.id.clone();
        info!(entry_id = %id, name = %entry.name, url = %entry.url, "Adding watch entry");
        self.slots.insert(id.clone(), Arc::new(WatchSlot::new(entry)));
        self.persist().await?;
        Ok(id)
    }

    /// Stop any capture, then forget the entry.
    pub async fn remove_entry(&self, id: &str) -> Result<WatchEntry> {
        let slot = self.slot(id)?;
        let handle = {
            let mut entry = slot.entry.lock();
            entry.stop_monitoring(Utc::now());
            slot.capture_handle()
        };
        if let Some(handle) = handle {
            self.stop_process(&handle).await;
        }

        let (_, slot) = self
            .slots
            .remove(id)
            .ok_or_else(|| Error::not_found("WatchEntry", id))?;
        self.persist().await?;

        info!(entry_id = %id, "Removed watch entry");
        Ok(slot.snapshot())
    }

    pub fn get(&self, id: &str) -> Option<WatchEntry> {
        self.slots.get(id).map(|slot| slot.snapshot())
    }

    /// All entries, oldest first.
    pub fn snapshot(&self) -> Vec<WatchEntry> {
        let mut entries: Vec<WatchEntry> = self.slots.iter().map(|slot| slot.snapshot()).collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Apply `f` to the entry and persist. Changes that break an entry
    /// invariant or touch the id are rolled back.
    pub async fn update_entry<F>(&self, id: &str, f: F) -> Result<WatchEntry>
    where
        F: FnOnce(&mut WatchEntry),
    {
        let slot = self.slot(id)?;
        let updated = {
            let mut entry = slot.entry.lock();
            let before = entry.clone();
            f(&mut entry);
            if entry.id != before.id || !entry.invariant_holds() {
                *entry = before;
                return Err(Error::validation(format!("rejected update of entry {id}")));
            }
            entry.clone()
        };
        self.persist().await?;
        Ok(updated)
    }

    /// The running capture process of an entry.
    pub fn capture_handle(&self, id: &str) -> Option<ProcessHandle> {
        self.slots.get(id).and_then(|slot| slot.capture_handle())
    }

    // ========== User actions ==========

    /// Enable monitoring with fresh notification state. Refused while disk space is low.
    pub async fn start_monitoring(&self, id: &str) -> Result<()> {
        let slot = self.slot(id)?;
        if slot.entry.lock().monitor_enabled {
            return Ok(());
        }

        if !self
            .state
            .admission
            .check_free_space(&self.state.settings.output_dir)
            .await
        {
            return Err(Error::validation("insufficient free disk space to start monitoring"));
        }

        {
            let mut entry = slot.entry.lock();
            entry.start_monitoring();
            if entry.platform.is_none() {
                entry.platform = self.state.handlers.platform_for(&entry.url);
            }
            info!(entry_id = %id, name = %entry.name, "Monitoring started");
        }
        self.persist().await
    }

    /// Disable monitoring. A running capture is stopped without an end notification.
    pub async fn stop_monitoring(&self, id: &str) -> Result<()> {
        let slot = self.slot(id)?;
        let handle = {
            let mut entry = slot.entry.lock();
            if let Some(session) = entry.stop_monitoring(Utc::now()) {
                info!(entry_id = %id, duration_secs = session.num_seconds(), "Capture stopped with monitoring");
            }
            info!(entry_id = %id, name = %entry.name, "Monitoring stopped");
            slot.capture_handle()
        };

        self.persist().await?;
        if let Some(handle) = handle {
            self.stop_process(&handle).await;
        }
        Ok(())
    }

    /// Stop the current capture but keep monitoring.
    ///
    /// Auto capture stays off and the end notification is suppressed until
    /// the stream is seen offline. Returns `false` if nothing was capturing.
    pub async fn stop_capture(&self, id: &str) -> Result<bool> {
        let slot = self.slot(id)?;
        let Some(handle) = slot.capture_handle() else {
            return Ok(false);
        };

        {
            let mut entry = slot.entry.lock();
            entry.stop_capture_manually(Utc::now());
            if entry.status == WatchStatus::Capturing {
                entry.set_status(WatchStatus::NotifyOnly)?;
            }
        }

        self.persist().await?;
        self.stop_process(&handle).await;
        info!(entry_id = %id, "Capture stopped manually");
        Ok(true)
    }

    // ========== Detect cycle ==========

    /// Run one detect cycle for `id` and return the resulting status.
    ///
    /// A cycle already in flight for the same entry makes this a no-op.
    pub async fn check_entry(self: &Arc<Self>, id: &str) -> Result<WatchStatus> {
        let slot = self.slot(id)?;
        let Some(_guard) = slot.try_begin_check() else {
            debug!(entry_id = %id, "Detect cycle already in flight");
            return Ok(slot.status());
        };

        let (url, key) = {
            let mut entry = slot.entry.lock();
            if !entry.monitor_enabled || entry.capturing {
                return Ok(entry.status);
            }
            if !entry.in_window(Local::now().time()) {
                if entry.status != WatchStatus::NotInScheduledWindow {
                    entry.set_status(WatchStatus::NotInScheduledWindow)?;
                    debug!(entry_id = %id, "Outside scheduled window");
                }
                return Ok(entry.status);
            }
            entry.set_status(WatchStatus::Checking)?;
            entry.last_check = Some(Utc::now());

            let key = self.state.handlers.platform_for(&entry.url).map(|platform| HandlerKey {
                platform,
                proxy: entry.proxy.clone().or_else(|| self.state.settings.proxy.clone()),
                credentials: entry.credentials.clone(),
                quality: entry.quality.clone(),
            });
            (entry.url.clone(), key)
        };

        let Some(key) = key else {
            return self.mark_unsupported(&slot, format!("no handler supports {url}")).await;
        };

        let lease = match self.state.handlers.acquire(&key) {
            Ok(lease) => lease,
            Err(e) => return self.handler_unavailable(&slot, e.to_string()).await,
        };

        let timeout = self.state.settings.liveness_timeout();
        let result = tokio::time::timeout(timeout, lease.resolver().resolve(&url)).await;
        self.state.handlers.release(lease);

        match result {
            Err(_) => {
                self.check_failed(&slot, format!("liveness query timed out after {timeout:?}"))
                    .await
            }
            Ok(Err(e)) if !e.is_transient() => self.mark_unsupported(&slot, e.to_string()).await,
            Ok(Err(e)) => self.check_failed(&slot, e.to_string()).await,
            Ok(Ok(info)) if info.is_live => self.went_live(&slot, info).await,
            Ok(Ok(info)) => self.went_offline(&slot, info).await,
        }
    }

    /// Spawn a detect cycle for every monitoring, idle entry that is due.
    pub fn check_due(self: &Arc<Self>) -> usize {
        if self.state.cancel.is_cancelled() {
            return 0;
        }
        let now = Utc::now();
        let due: Vec<String> = self
            .slots
            .iter()
            .filter(|item| {
                let slot = item.value();
                let entry = slot.entry.lock();
                entry.monitor_enabled && !entry.capturing && !slot.is_checking() && entry.is_due(now)
            })
            .map(|item| item.key().clone())
            .collect();

        let mut cycles = self.cycles.lock();
        while cycles.try_join_next().is_some() {}
        for id in &due {
            let recorder = self.clone();
            let id = id.clone();
            cycles.spawn(async move {
                if let Err(e) = recorder.check_entry(&id).await {
                    error!(entry_id = %id, error = %e, "Detect cycle failed");
                }
            });
        }
        due.len()
    }

    /// Query failed. A live entry is treated as having gone offline.
    async fn check_failed(&self, slot: &WatchSlot, reason: String) -> Result<WatchStatus> {
        let (message, was_live) = {
            let mut entry = slot.entry.lock();
            if !still_checking(&entry) {
                return Ok(entry.status);
            }
            let outcome = entry.mark_offline(Utc::now());
            entry.last_error = Some(reason.clone());
            entry.set_status(WatchStatus::CheckError)?;
            warn!(entry_id = %entry.id, error = %reason, "Liveness check failed");
            (self.end_message(&entry, outcome), outcome.was_live)
        };

        self.publish(message);
        if was_live {
            self.persist_logged().await;
        }
        Ok(WatchStatus::CheckError)
    }

    /// No resolver could be built for the entry's key. Retried on the next
    /// interval; the first failure of a run is also announced.
    async fn handler_unavailable(&self, slot: &WatchSlot, reason: String) -> Result<WatchStatus> {
        let (id, name, repeated) = {
            let entry = slot.entry.lock();
            let repeated = entry.last_error.as_deref() == Some(reason.as_str());
            (entry.id.clone(), entry.name.clone(), repeated)
        };

        let status = self.check_failed(slot, reason.clone()).await?;
        if status == WatchStatus::CheckError && !repeated {
            error!(entry_id = %id, error = %reason, "Liveness handler unavailable");
            self.publish(Some(NotificationMessage::handler_unavailable(&name, &reason).for_entry(id)));
        }
        Ok(status)
    }

    /// The URL can never be resolved: disable the entry.
    async fn mark_unsupported(&self, slot: &WatchSlot, reason: String) -> Result<WatchStatus> {
        let message = {
            let mut entry = slot.entry.lock();
            if !still_checking(&entry) {
                return Ok(entry.status);
            }
            let outcome = entry.mark_offline(Utc::now());
            entry.set_status(WatchStatus::Unsupported)?;
            entry.monitor_enabled = false;
            entry.last_error = Some(reason.clone());
            warn!(entry_id = %entry.id, url = %entry.url, error = %reason, "Entry unsupported, monitoring disabled");
            self.end_message(&entry, outcome)
        };
        self.publish(message);
        self.persist_logged().await;
        Ok(WatchStatus::Unsupported)
    }

    async fn went_offline(&self, slot: &WatchSlot, info: StreamInfo) -> Result<WatchStatus> {
        let (message, outcome, status) = {
            let mut entry = slot.entry.lock();
            if !still_checking(&entry) {
                return Ok(entry.status);
            }
            if info.platform.is_some() {
                entry.platform = info.platform;
            }
            entry.last_error = None;

            let outcome = entry.mark_offline(Utc::now());
            let status = if outcome.was_live {
                info!(entry_id = %entry.id, name = %entry.name, "Stream went offline");
                WatchStatus::OfflineWait
            } else {
                WatchStatus::Monitoring
            };
            entry.set_status(status)?;
            (self.end_message(&entry, outcome), outcome, status)
        };

        self.publish(message);
        if outcome.was_live {
            self.persist_logged().await;
        }
        Ok(status)
    }

    async fn went_live(self: &Arc<Self>, slot: &Arc<WatchSlot>, info: StreamInfo) -> Result<WatchStatus> {
        let (start_message, capture, interval_changed) = {
            let mut entry = slot.entry.lock();
            if !still_checking(&entry) {
                return Ok(entry.status);
            }
            if info.platform.is_some() {
                entry.platform = info.platform.clone();
            }
            if entry.name.is_empty()
                && let Some(display_name) = &info.display_name
            {
                entry.name = display_name.clone();
            }
            entry.last_error = None;

            if entry.mark_live(info.title.clone(), info.media_locator.clone()) {
                info!(entry_id = %entry.id, name = %entry.name, title = ?entry.title, "Stream is live");
            }
            let start_message = (entry.claim_start_notification() && self.state.settings.notify_on_start)
                .then(|| {
                    NotificationMessage::stream_start(&entry.name, entry.title.as_deref()).for_entry(&entry.id)
                });

            let mut interval_changed = false;
            let capture = if entry.mode == MonitorMode::Manual || entry.manually_stopped {
                false
            } else if self.state.settings.notify_only {
                let interval = self.state.settings.notify_interval_secs;
                interval_changed = entry.check_interval_secs != interval;
                entry.check_interval_secs = interval;
                false
            } else {
                true
            };
            if !capture {
                entry.set_status(WatchStatus::NotifyOnly)?;
            }
            (start_message, capture, interval_changed)
        };
        self.publish(start_message);

        if !capture {
            if interval_changed {
                self.persist_logged().await;
            }
            return Ok(WatchStatus::NotifyOnly);
        }

        let allowed = self
            .state
            .admission
            .check_free_space(&self.state.settings.output_dir)
            .await;

        let request = {
            let mut entry = slot.entry.lock();
            if !still_checking(&entry) {
                return Ok(entry.status);
            }
            if !allowed {
                entry.set_status(WatchStatus::AdmissionDenied)?;
                warn!(entry_id = %entry.id, "Capture refused, free disk space below threshold");
                return Ok(WatchStatus::AdmissionDenied);
            }
            entry.set_status(WatchStatus::PreparingCapture)?;
            self.capture_request(&entry)
        };

        match request {
            Some(request) => self.start_capture(slot, request).await,
            None => self.capture_failed(slot, "stream is live but has no media locator".to_string()),
        }
    }

    // ========== Capture ==========

    fn capture_request(&self, entry: &WatchEntry) -> Option<CaptureRequest> {
        let settings = &self.state.settings;
        Some(CaptureRequest {
            entry_id: entry.id.clone(),
            name: entry.name.clone(),
            title: entry.title.clone(),
            media_locator: entry.media_locator.clone()?,
            proxy: entry.proxy.clone().or_else(|| settings.proxy.clone()),
            credentials: entry.credentials.clone(),
            format: entry.format.clone().unwrap_or_else(|| settings.default_format.clone()),
            segment: entry.segment.unwrap_or(settings.segment_recording),
            segment_time_secs: settings.segment_time_secs,
            output_dir: settings.output_dir.join(sanitize_filename(&entry.name)),
            started_at: Local::now(),
        })
    }

    async fn start_capture(self: &Arc<Self>, slot: &Arc<WatchSlot>, request: CaptureRequest) -> Result<WatchStatus> {
        if self.state.admission.is_closed() || self.state.cancel.is_cancelled() {
            let mut entry = slot.entry.lock();
            if still_preparing(&entry) {
                entry.set_status(WatchStatus::AdmissionDenied)?;
            }
            debug!(entry_id = %request.entry_id, "Shutting down, capture not started");
            return Ok(entry.status);
        }

        let command = match self.builder.build(&request) {
            Ok(command) => command,
            Err(e) => return self.capture_failed(slot, e.to_string()),
        };
        if let Err(e) = tokio::fs::create_dir_all(&command.output_dir).await {
            return self.capture_failed(slot, format!("cannot create {}: {e}", command.output_dir.display()));
        }
        let handle = match self.state.supervisor.spawn(&request.entry_id, &command) {
            Ok(handle) => handle,
            Err(e) => return self.capture_failed(slot, e.to_string()),
        };

        let started = {
            let mut entry = slot.entry.lock();
            if still_preparing(&entry) && entry.begin_capture(Utc::now()) {
                entry.set_status(WatchStatus::Capturing)?;
                *slot.capture.lock() = Some(handle.clone());
                true
            } else {
                false
            }
        };

        if !started {
            debug!(entry_id = %request.entry_id, "Monitoring stopped while preparing, discarding capture");
            self.stop_process(&handle).await;
            return Ok(slot.status());
        }

        info!(
            entry_id = %request.entry_id,
            pid = ?handle.pid(),
            output = %command.output_dir.display(),
            "Capture started"
        );
        self.persist_logged().await;

        let recorder = self.clone();
        let slot = slot.clone();
        let mut watchers = self.watchers.lock();
        while watchers.try_join_next().is_some() {}
        watchers.spawn(async move { recorder.watch_capture(slot, handle, command).await });
        Ok(WatchStatus::Capturing)
    }

    fn capture_failed(&self, slot: &WatchSlot, reason: String) -> Result<WatchStatus> {
        let mut entry = slot.entry.lock();
        if entry.status != WatchStatus::PreparingCapture {
            return Ok(entry.status);
        }
        entry.set_status(WatchStatus::CaptureError)?;
        error!(entry_id = %entry.id, error = %reason, "Failed to start capture");
        entry.last_error = Some(reason);
        Ok(WatchStatus::CaptureError)
    }

    /// Wait for the capture process to exit and fold the result into the entry.
    async fn watch_capture(self: Arc<Self>, slot: Arc<WatchSlot>, handle: ProcessHandle, command: CaptureCommand) {
        let outcome = handle.wait().await;

        {
            let mut capture = slot.capture.lock();
            if capture.as_ref().is_some_and(|h| h.id() == handle.id()) {
                *capture = None;
            }
        }

        let message = self.apply_capture_exit(&slot, outcome);
        self.publish(message);
        self.persist_logged().await;

        if outcome.is_normal() && self.state.settings.convert_to_mp4 && command.format == "ts" {
            self.submit_conversions(&command).await;
        }
    }

    fn apply_capture_exit(&self, slot: &WatchSlot, outcome: ExitOutcome) -> Option<NotificationMessage> {
        let mut entry = slot.entry.lock();
        if let Some(session) = entry.end_capture(Utc::now()) {
            info!(
                entry_id = %entry.id,
                code = ?outcome.code,
                duration_secs = session.num_seconds(),
                total_secs = entry.cumulative_duration_secs,
                "Capture ended"
            );
        }

        if entry.status != WatchStatus::Capturing {
            return None;
        }

        let mut message = None;
        let target = if !outcome.is_normal() {
            let reason = format!("capture exited with {}", describe_code(outcome.code));
            error!(entry_id = %entry.id, error = %reason, "Capture failed");
            entry.last_error = Some(reason);
            message = Some(NotificationMessage::capture_error(&entry.name, outcome.code).for_entry(&entry.id));
            WatchStatus::CaptureError
        } else if !self.state.admission.is_allowed() {
            WatchStatus::AdmissionDenied
        } else if entry.is_live {
            // Recheck on the next tick; the capture may simply have dropped.
            entry.last_check = None;
            WatchStatus::NotifyOnly
        } else {
            WatchStatus::OfflineWait
        };

        if let Err(e) = entry.set_status(target) {
            warn!(entry_id = %entry.id, error = %e, "Unexpected status after capture exit");
        }
        message
    }

    async fn submit_conversions(&self, command: &CaptureCommand) {
        let files = match produced_files(command).await {
            Ok(files) => files,
            Err(e) => {
                warn!(dir = %command.output_dir.display(), error = %e, "Cannot list capture output");
                return;
            }
        };

        for file in files {
            let ffmpeg = self.state.settings.ffmpeg_path.clone();
            let delete_original = self.state.settings.delete_original;
            let name = format!("convert {}", file.display());
            let submitted = self.state.drain.submit(name, move || async move {
                if let Err(e) = convert_to_mp4(&ffmpeg, &file, delete_original).await {
                    warn!(file = %file.display(), error = %e, "mp4 conversion failed");
                }
            });
            if let Err(e) = submitted {
                warn!(error = %e, "Conversion not queued");
            }
        }
    }

    async fn stop_process(&self, handle: &ProcessHandle) {
        if let Err(e) = self.state.supervisor.stop(handle).await {
            error!(entry_id = %handle.owner(), error = %e, "Failed to stop capture process");
        }
    }

    fn active_captures(&self) -> Vec<ProcessHandle> {
        self.slots.iter().filter_map(|slot| slot.capture_handle()).collect()
    }

    // ========== Scheduler ==========

    /// Check free space on the output volume; stop every capture when denied.
    pub async fn enforce_admission(&self) -> bool {
        let allowed = self
            .state
            .admission
            .check_free_space(&self.state.settings.output_dir)
            .await;
        if allowed {
            return true;
        }

        for handle in self.active_captures() {
            if handle.stop_requested() || handle.has_exited() {
                continue;
            }
            warn!(entry_id = %handle.owner(), "Stopping capture, free disk space below threshold");
            let supervisor = self.state.supervisor.clone();
            tokio::spawn(async move {
                if let Err(e) = supervisor.stop(&handle).await {
                    error!(entry_id = %handle.owner(), error = %e, "Failed to stop capture process");
                }
            });
        }
        false
    }

    /// Scheduler loop: admission check, then detect cycles for due entries.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.state.settings.scheduler_tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(entries = self.slots.len(), "Recorder scheduler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.enforce_admission().await;
                    let spawned = self.check_due();
                    if spawned > 0 {
                        debug!(spawned, "Started detect cycles");
                    }
                }
            }
        }
        info!("Recorder scheduler stopped");
    }

    /// Close path: refuse new captures, let running ones finish, force the rest,
    /// persist, then wait for deferred jobs.
    pub async fn shutdown(&self) {
        info!("Shutting down recorder");
        self.state.admission.close();
        self.state.cancel.cancel();

        // A cycle that resolves now finds the gate closed and starts nothing.
        let cycles = std::mem::replace(&mut *self.cycles.lock(), JoinSet::new());
        let limit = self.state.settings.liveness_timeout() + CYCLE_GRACE;
        if !join_within(cycles, limit).await {
            warn!("Detect cycles still running at shutdown, aborted");
        }

        let handles = self.state.supervisor.request_quit_all().await;
        if !handles.is_empty() {
            let grace = Duration::from_secs(
                (handles.len() as u64).clamp(MIN_CAPTURE_GRACE_SECS, MAX_CAPTURE_GRACE_SECS),
            );
            info!(active = handles.len(), ?grace, "Waiting for captures to finish");
            let all_exited = futures::future::join_all(handles.iter().map(|h| h.wait()));
            if tokio::time::timeout(grace, all_exited).await.is_err() {
                warn!("Captures still running, forcing stop");
            }
        }
        self.state.supervisor.stop_all().await;

        let watchers = std::mem::replace(&mut *self.watchers.lock(), JoinSet::new());
        if !join_within(watchers, WATCHER_GRACE).await {
            warn!("Capture exit watchers still running at shutdown, aborted");
        }
        self.persist_logged().await;

        self.state.stop_background().await;
        if !self.state.drain.drain(DRAIN_TIMEOUT).await {
            warn!("Deferred jobs abandoned at shutdown");
        }
        info!("Recorder shut down");
    }

    // ========== Helpers ==========

    fn slot(&self, id: &str) -> Result<Arc<WatchSlot>> {
        self.slots
            .get(id)
            .map(|slot| slot.value().clone())
            .ok_or_else(|| Error::not_found("WatchEntry", id))
    }

    fn end_message(&self, entry: &WatchEntry, outcome: OfflineOutcome) -> Option<NotificationMessage> {
        (outcome.notify_end && self.state.settings.notify_on_end)
            .then(|| NotificationMessage::stream_end(&entry.name).for_entry(&entry.id))
    }

    fn publish(&self, message: Option<NotificationMessage>) {
        if let Some(message) = message {
            self.state.dispatcher.publish(message);
        }
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let entries = self.snapshot();
        self.store.save(&entries).await
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            error!(error = %e, "Failed to persist watch entries");
        }
    }
}

/// The cycle still owns the entry: nobody stopped or restarted it meanwhile.
fn still_checking(entry: &WatchEntry) -> bool {
    entry.monitor_enabled && entry.status == WatchStatus::Checking
}

fn still_preparing(entry: &WatchEntry) -> bool {
    entry.monitor_enabled && entry.status == WatchStatus::PreparingCapture
}

/// Wait for every task in `set`; the rest are aborted after `limit`.
async fn join_within(mut set: JoinSet<()>, limit: Duration) -> bool {
    let all = async {
        while let Some(result) = set.join_next().await {
            if let Err(e) = result
                && e.is_panic()
            {
                error!(error = %e, "Recorder task panicked");
            }
        }
    };
    tokio::time::timeout(limit, all).await.is_ok()
}

fn describe_code(code: Option<i32>) -> String {
    code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}"))
}

//! One sentinel pass over the configured mounts, plus the watch loop.
//!
//! Per mount: sample → gate (against the stored flag) → attribute ghost usage
//! for outgoing alerts → notify → apply the flag mutation. Mounts are handled
//! sequentially and independently; a failure on one never stops the others.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::config::Config;
use crate::core::errors::{DsnError, Result};
use crate::daemon::run_lock::RunLock;
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};
use crate::monitor::ghost::{GhostAttributor, top};
use crate::monitor::hysteresis::{Decision, FlagAction, HysteresisGate};
use crate::monitor::sampler::{MountSample, UsageSampler};
use crate::notify::message::{AlertKind, AlertMessage};
use crate::notify::sink::{Notifier, build_notifier};
use crate::platform::pal::Platform;
use crate::state::flags::{FileFlagStore, FlagLocation, FlagStore};

/// What happened to one mount during a pass.
#[derive(Debug, Clone, Serialize)]
pub struct MountOutcome {
    pub mount: PathBuf,
    /// `None` when the mount could not be sampled.
    pub decision: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent_used: Option<f64>,
    pub notified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flag_location: Option<FlagLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistence_error: Option<String>,
}

impl MountOutcome {
    fn new(mount: &Path) -> Self {
        Self {
            mount: mount.to_path_buf(),
            decision: None,
            percent_used: None,
            notified: false,
            flag_location: None,
            skipped: None,
            delivery_error: None,
            persistence_error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub mounts: Vec<MountOutcome>,
}

impl PassReport {
    #[must_use]
    pub fn notifications_sent(&self) -> usize {
        self.mounts.iter().filter(|outcome| outcome.notified).count()
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.mounts
            .iter()
            .filter(|outcome| outcome.skipped.is_some())
            .count()
    }
}

/// The alerting engine with its collaborators injected.
pub struct Sentinel {
    sampler: UsageSampler,
    attributor: GhostAttributor,
    gate: HysteresisGate,
    flags: Arc<dyn FlagStore>,
    notifier: Box<dyn Notifier>,
    activity: JsonlWriter,
    channel: String,
    host: String,
    ghost_top_n: usize,
    config_hash: Option<String>,
    dry_run: bool,
}

impl Sentinel {
    /// Wire a sentinel from explicit collaborators.
    ///
    /// In dry-run mode flags are read but never written.
    pub fn new(
        config: &Config,
        platform: Arc<dyn Platform>,
        flags: Arc<dyn FlagStore>,
        notifier: Box<dyn Notifier>,
        activity: JsonlWriter,
        dry_run: bool,
    ) -> Result<Self> {
        let thresholds = config.thresholds()?;
        let host = config
            .notifications
            .hostname
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| platform.hostname());
        Ok(Self {
            sampler: UsageSampler::new(Arc::clone(&platform)),
            attributor: GhostAttributor::new(platform, &config.ghost),
            gate: HysteresisGate::new(thresholds),
            flags,
            notifier,
            activity,
            channel: config.notifications.channel.clone(),
            host,
            ghost_top_n: config.ghost.top_n,
            config_hash: config.stable_hash().ok(),
            dry_run,
        })
    }

    /// Production wiring: file flag store, configured sink, activity log.
    pub fn from_config(
        config: &Config,
        platform: Arc<dyn Platform>,
        dry_run: bool,
    ) -> Result<Self> {
        let flags = Arc::new(FileFlagStore::new(
            &config.paths.flag_dir,
            &config.paths.fallback_flag_dir,
        ));
        let activity = JsonlWriter::open(JsonlConfig::new(
            &config.paths.activity_log,
            Some(&config.paths.activity_log_fallback),
        ));
        Self::new(
            config,
            platform,
            flags,
            build_notifier(&config.notifications, dry_run),
            activity,
            dry_run,
        )
    }

    /// Run one pass under the run lock. `None` when another pass holds it.
    pub fn run_locked(
        &mut self,
        mounts: &[PathBuf],
        lock_path: &Path,
        now: DateTime<Utc>,
    ) -> Option<PassReport> {
        let _lock = match RunLock::acquire(lock_path) {
            Ok(lock) => Some(lock),
            Err(DsnError::RunLocked { path }) => {
                eprintln!(
                    "[DSN-RUN] another pass holds {}; skipping this one",
                    path.display()
                );
                let mut entry = LogEntry::new(EventType::RunLocked, Severity::Info);
                entry.details = Some(path.display().to_string());
                self.log(&entry);
                return None;
            }
            Err(error) => {
                eprintln!("[DSN-RUN] warning: run lock unavailable, continuing unlocked: {error}");
                None
            }
        };
        Some(self.run_pass(mounts, now))
    }

    /// Evaluate every mount once.
    pub fn run_pass(&mut self, mounts: &[PathBuf], now: DateTime<Utc>) -> PassReport {
        let started = Instant::now();
        let mut entry = LogEntry::new(EventType::RunStart, Severity::Info);
        entry.mounts = Some(mounts.len());
        entry.config_hash.clone_from(&self.config_hash);
        if self.dry_run {
            entry.details = Some("dry run".to_string());
        }
        self.log(&entry);

        let outcomes: Vec<MountOutcome> = mounts
            .iter()
            .map(|mount| self.process_mount(mount, now))
            .collect();

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let mut entry = LogEntry::new(EventType::RunComplete, Severity::Info);
        entry.mounts = Some(outcomes.len());
        entry.duration_ms = Some(duration_ms);
        entry.ok = Some(true);
        self.log(&entry);
        self.activity.flush();

        PassReport {
            started_at: now,
            duration_ms,
            mounts: outcomes,
        }
    }

    /// Sample, gate, notify and persist for one mount.
    pub fn process_mount(&mut self, mount: &Path, now: DateTime<Utc>) -> MountOutcome {
        let mut outcome = MountOutcome::new(mount);

        let sample = match self.sampler.sample(mount) {
            Ok(sample) => sample,
            Err(error) => {
                eprintln!("[DSN-SAMPLE] skipping {}: {error}", mount.display());
                let entry = LogEntry::new(EventType::MountSkipped, Severity::Warning)
                    .mount(mount)
                    .error(&error);
                self.log(&entry);
                outcome.skipped = Some(error.to_string());
                return outcome;
            }
        };
        outcome.percent_used = sample.percent_used;

        let state = self.flags.exists(mount);
        let gated = self.gate.evaluate(&sample, state.as_ref(), now);
        outcome.decision = Some(gated.decision);

        if let Some(kind) = gated.decision.alert_kind() {
            let notified = self.notify(kind, &sample, &mut outcome);
            outcome.notified = notified;
        }

        if self.dry_run {
            if gated.action != FlagAction::Keep {
                eprintln!(
                    "[DSN-FLAGS] dry run: leaving flag for {} unchanged",
                    mount.display()
                );
            }
        } else {
            self.apply_flag_action(mount, gated.action, &mut outcome);
        }

        let mut entry = decision_entry(gated.decision, &sample);
        entry.flag_location = outcome.flag_location.map(|loc| location_name(loc).to_string());
        if gated.decision.alert_kind().is_some() {
            entry.sink = Some(self.notifier.name().to_string());
            entry.ok = Some(outcome.notified);
        }
        self.log(&entry);
        outcome
    }

    fn notify(
        &mut self,
        kind: AlertKind,
        sample: &MountSample,
        outcome: &mut MountOutcome,
    ) -> bool {
        // Ghost detail only matters while the mount is still full.
        let ghost = if kind == AlertKind::Resolved {
            Vec::new()
        } else {
            top(self.attributor.attribute(sample), self.ghost_top_n)
        };
        let message = AlertMessage::build(kind, &self.host, sample, &ghost, self.gate.thresholds());
        let attachment = message.attachment();

        match self
            .notifier
            .deliver(&self.channel, &message.body(), attachment.as_deref())
        {
            Ok(()) => true,
            Err(error) => {
                eprintln!(
                    "[DSN-NOTIFY] {kind} alert for {} not delivered: {error}",
                    sample.mount_path.display()
                );
                let mut entry = LogEntry::new(EventType::DeliveryFailed, Severity::Warning)
                    .mount(&sample.mount_path)
                    .error(&error);
                entry.sink = Some(self.notifier.name().to_string());
                self.log(&entry);
                outcome.delivery_error = Some(error.to_string());
                false
            }
        }
    }

    fn apply_flag_action(&mut self, mount: &Path, action: FlagAction, outcome: &mut MountOutcome) {
        let result = match action {
            FlagAction::Keep => return,
            FlagAction::Put(state) => self.flags.put(&state).map(Some),
            FlagAction::Delete => self.flags.delete(mount).map(|()| None),
        };

        match result {
            Ok(Some(FlagLocation::Fallback)) => {
                outcome.flag_location = Some(FlagLocation::Fallback);
                let mut entry =
                    LogEntry::new(EventType::PersistenceDegraded, Severity::Warning).mount(mount);
                entry.flag_location = Some(location_name(FlagLocation::Fallback).to_string());
                entry.details = Some("flag stored in volatile fallback".to_string());
                self.log(&entry);
            }
            Ok(location) => outcome.flag_location = location,
            Err(error) => {
                eprintln!(
                    "[DSN-FLAGS] flag update for {} failed; alert may repeat next pass: {error}",
                    mount.display()
                );
                let entry = LogEntry::new(EventType::PersistenceDegraded, Severity::Critical)
                    .mount(mount)
                    .error(&error);
                self.log(&entry);
                outcome.persistence_error = Some(error.to_string());
            }
        }
    }

    fn log(&mut self, entry: &LogEntry) {
        self.activity.write_entry(entry);
    }
}

fn decision_entry(decision: Decision, sample: &MountSample) -> LogEntry {
    let (event, severity) = match decision {
        Decision::New => (EventType::AlertNew, Severity::Warning),
        Decision::Reminder => (EventType::AlertReminder, Severity::Warning),
        Decision::Resolved => (EventType::AlertResolved, Severity::Info),
        Decision::Suppressed => (EventType::AlertSuppressed, Severity::Info),
        Decision::Hold => (EventType::MountHold, Severity::Info),
        Decision::Unmeasurable => (EventType::MountUnmeasurable, Severity::Info),
    };
    let mut entry = LogEntry::new(event, severity).mount(&sample.mount_path);
    entry.percent_used = sample.percent_used;
    entry.used_bytes = Some(sample.used_bytes);
    entry.total_bytes = Some(sample.total_bytes);
    entry.hidden_bytes = Some(sample.hidden_bytes);
    entry
}

const fn location_name(location: FlagLocation) -> &'static str {
    match location {
        FlagLocation::Primary => "primary",
        FlagLocation::Fallback => "fallback",
    }
}

// ──────────────────── watch loop ────────────────────

/// Repeat passes every `interval` until SIGTERM/SIGINT; SIGHUP reloads config.
///
/// A reload that fails validation keeps the previous configuration.
#[cfg(feature = "daemon")]
pub fn watch<F>(
    config_path: Option<&Path>,
    initial: Config,
    platform: &Arc<dyn Platform>,
    interval: std::time::Duration,
    dry_run: bool,
    signals: &crate::daemon::signals::SignalHandler,
    mut on_report: F,
) -> Result<()>
where
    F: FnMut(&PassReport),
{
    let mut config = initial;
    let mut sentinel = Sentinel::from_config(&config, Arc::clone(platform), dry_run)?;

    loop {
        if signals.should_shutdown() {
            eprintln!("[DSN-RUN] shutdown requested; stopping watch");
            return Ok(());
        }

        if signals.should_reload() {
            let reloaded = Config::load(config_path).and_then(|fresh| {
                Sentinel::from_config(&fresh, Arc::clone(platform), dry_run)
                    .map(|fresh_sentinel| (fresh, fresh_sentinel))
            });
            match reloaded {
                Ok((fresh, fresh_sentinel)) => {
                    config = fresh;
                    sentinel = fresh_sentinel;
                    let mut entry = LogEntry::new(EventType::ConfigReload, Severity::Info);
                    entry.config_hash.clone_from(&sentinel.config_hash);
                    sentinel.log(&entry);
                    eprintln!("[DSN-CONFIG] configuration reloaded");
                }
                Err(error) => {
                    eprintln!(
                        "[DSN-CONFIG] reload failed, keeping previous configuration: {error}"
                    );
                }
            }
        }

        let report =
            sentinel.run_locked(&config.mount_points, &config.paths.lock_file, Utc::now());
        if let Some(report) = report {
            on_report(&report);
        }

        signals.sleep(interval);
    }
}

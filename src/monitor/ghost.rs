//! Ghost-usage attribution: space held by deleted-but-open files, grouped by
//! owner and process. Paths never leave the platform layer.

#![allow(missing_docs)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::core::config::GhostConfig;
use crate::monitor::sampler::MountSample;
use crate::platform::pal::{OpenHandle, Platform};

/// Bytes held open by one owner + process pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GhostEntry {
    pub owner_identity: String,
    pub process_name: String,
    pub attributed_bytes: u64,
}

impl GhostEntry {
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}/{}", self.owner_identity, self.process_name)
    }
}

/// Best-effort attributor. Never fails; an unavailable handle scan yields no entries.
pub struct GhostAttributor {
    platform: Arc<dyn Platform>,
    enabled: bool,
    scan_budget: Duration,
}

impl GhostAttributor {
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>, config: &GhostConfig) -> Self {
        Self {
            platform,
            enabled: config.enabled,
            scan_budget: Duration::from_millis(config.scan_budget_ms),
        }
    }

    /// All attributed entries for the sample's device, largest first.
    #[must_use]
    pub fn attribute(&self, sample: &MountSample) -> Vec<GhostEntry> {
        if !self.enabled || sample.hidden_bytes == 0 {
            return Vec::new();
        }
        match self.platform.open_deleted_handles(self.scan_budget) {
            Ok(handles) => self.aggregate(sample.device_id, &handles),
            Err(error) => {
                eprintln!(
                    "[DSN-GHOST] attribution skipped for {}: {error}",
                    sample.mount_path.display()
                );
                Vec::new()
            }
        }
    }

    fn aggregate(&self, device_id: u64, handles: &[OpenHandle]) -> Vec<GhostEntry> {
        // One deleted inode holds its space once, however many fds or forked
        // workers keep it open. The lowest pid holding it is credited.
        let mut ordered: Vec<&OpenHandle> = handles
            .iter()
            .filter(|handle| handle.device_id == device_id)
            .collect();
        ordered.sort_by_key(|handle| handle.pid);

        let mut seen = HashSet::<u64>::new();
        let mut totals = HashMap::<(u32, &str), u64>::new();
        for handle in ordered {
            if !seen.insert(handle.inode) {
                continue;
            }
            let slot = totals
                .entry((handle.uid, handle.process_name.as_str()))
                .or_insert(0);
            *slot = slot.saturating_add(handle.size_bytes);
        }

        let mut owners = HashMap::<u32, String>::new();
        let mut merged = HashMap::<(String, String), u64>::new();
        for ((uid, process), bytes) in totals {
            let owner = owners
                .entry(uid)
                .or_insert_with(|| self.owner_identity(uid))
                .clone();
            let slot = merged.entry((owner, process.to_string())).or_insert(0);
            *slot = slot.saturating_add(bytes);
        }

        let mut entries: Vec<GhostEntry> = merged
            .into_iter()
            .filter(|(_, bytes)| *bytes > 0)
            .map(|((owner_identity, process_name), attributed_bytes)| GhostEntry {
                owner_identity,
                process_name,
                attributed_bytes,
            })
            .collect();
        entries.sort_by(|left, right| {
            right
                .attributed_bytes
                .cmp(&left.attributed_bytes)
                .then_with(|| left.owner_identity.cmp(&right.owner_identity))
                .then_with(|| left.process_name.cmp(&right.process_name))
        });
        entries
    }

    fn owner_identity(&self, uid: u32) -> String {
        self.platform
            .user_name(uid)
            .unwrap_or_else(|| format!("uid:{uid}"))
    }
}

/// Keep the `n` largest entries of an already sorted list.
#[must_use]
pub fn top(mut entries: Vec<GhostEntry>, n: usize) -> Vec<GhostEntry> {
    entries.truncate(n);
    entries
}

/// Sum of attributed bytes; the rest of `hidden_bytes` is filesystem overhead.
#[must_use]
pub fn attributed_total(entries: &[GhostEntry]) -> u64 {
    entries
        .iter()
        .fold(0_u64, |acc, entry| acc.saturating_add(entry.attributed_bytes))
}

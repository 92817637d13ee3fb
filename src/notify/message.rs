//! Alert message formatting. Transport lives in [`crate::notify::sink`].

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use std::fmt::{self, Write as _};
use std::path::PathBuf;

use serde::Serialize;

use crate::monitor::ghost::{GhostEntry, attributed_total};
use crate::monitor::hysteresis::Thresholds;
use crate::monitor::sampler::MountSample;
use crate::platform::pal::DirUsage;

/// Rows shown in the directory breakdown.
pub const BREAKDOWN_ROWS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    New,
    Reminder,
    Resolved,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Reminder => write!(f, "reminder"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// Everything a sink needs to render one notification.
#[derive(Debug, Clone, Serialize)]
pub struct AlertMessage {
    pub kind: AlertKind,
    pub host: String,
    pub mount: PathBuf,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub visible_bytes: u64,
    pub hidden_bytes: u64,
    pub percent_used: Option<f64>,
    pub high_percent: u32,
    pub recovery_percent: f64,
    pub directories: Vec<DirUsage>,
    pub ghost: Vec<GhostEntry>,
}

impl AlertMessage {
    /// Assemble a message. Directories are cut to the top five; `ghost` is
    /// taken as given, already limited to `ghost.top_n` by the caller.
    #[must_use]
    pub fn build(
        kind: AlertKind,
        host: &str,
        sample: &MountSample,
        ghost: &[GhostEntry],
        thresholds: &Thresholds,
    ) -> Self {
        Self {
            kind,
            host: host.to_string(),
            mount: sample.mount_path.clone(),
            total_bytes: sample.total_bytes,
            used_bytes: sample.used_bytes,
            visible_bytes: sample.visible_bytes,
            hidden_bytes: sample.hidden_bytes,
            percent_used: sample.percent_used,
            high_percent: thresholds.high_percent,
            recovery_percent: thresholds.recovery_percent(),
            directories: sample.top_entries.iter().take(BREAKDOWN_ROWS).cloned().collect(),
            ghost: ghost.to_vec(),
        }
    }

    #[must_use]
    pub fn header(&self) -> String {
        let target = format!("{}:{}", self.host, self.mount.display());
        match self.kind {
            AlertKind::New => format!(":rotating_light: Disk usage alert on {target}"),
            AlertKind::Reminder => format!(":warning: Reminder: disk usage still high on {target}"),
            AlertKind::Resolved => format!(":white_check_mark: Disk usage recovered on {target}"),
        }
    }

    #[must_use]
    pub fn summary(&self) -> String {
        let percent = self
            .percent_used
            .map_or_else(|| "n/a".to_string(), |p| format!("{p:.2}%"));
        format!(
            "Host {} | mount {} | used {} of {} ({percent}) | visible {} | hidden {}",
            self.host,
            self.mount.display(),
            format_bytes(self.used_bytes),
            format_bytes(self.total_bytes),
            format_bytes(self.visible_bytes),
            format_bytes(self.hidden_bytes),
        )
    }

    #[must_use]
    pub fn suggestion(&self) -> String {
        if self.kind == AlertKind::Resolved {
            return format!(
                "Usage is below the recovery threshold of {:.2}%; the alert is cleared.",
                self.recovery_percent
            );
        }
        let mut line = if self.recovery_percent <= 0.0 {
            format!(
                "Recovery threshold is {:.2}% (high {}%); this alert cannot clear on its own.",
                self.recovery_percent, self.high_percent
            )
        } else {
            format!(
                "Free space until usage drops below {:.2}% to clear this alert.",
                self.recovery_percent
            )
        };
        if !self.ghost.is_empty() {
            line.push_str(" Restarting the listed processes releases space held by deleted files.");
        }
        line
    }

    /// Header, summary and suggestion, one per line.
    #[must_use]
    pub fn body(&self) -> String {
        format!("{}\n{}\n{}", self.header(), self.summary(), self.suggestion())
    }

    /// Breakdown tables as a fenced code block, or `None` when both are empty.
    #[must_use]
    pub fn attachment(&self) -> Option<String> {
        if self.directories.is_empty() && self.ghost.is_empty() {
            return None;
        }

        let mut rows: Vec<(String, String)> = Vec::new();
        let mut block = String::from("```\n");

        if !self.directories.is_empty() {
            rows.extend(
                self.directories
                    .iter()
                    .map(|dir| (dir.label.clone(), format_bytes(dir.bytes))),
            );
        }
        let ghost_rows: Vec<(String, String)> = self
            .ghost
            .iter()
            .map(|entry| (entry.label(), format_bytes(entry.attributed_bytes)))
            .collect();
        let width = rows
            .iter()
            .chain(&ghost_rows)
            .map(|(label, _)| label.chars().count() + 1)
            .max()
            .unwrap_or(0);

        if !rows.is_empty() {
            block.push_str("Top directories:\n");
            for (label, size) in &rows {
                let key = format!("{label}:");
                let _ = writeln!(block, "  {key:<width$} {size:>9}");
            }
        }

        if !ghost_rows.is_empty() {
            if !rows.is_empty() {
                block.push('\n');
            }
            block.push_str("Ghost usage (deleted but still open):\n");
            for (label, size) in &ghost_rows {
                let key = format!("{label}:");
                let _ = writeln!(block, "  {key:<width$} {size:>9}");
            }
            let unattributed = self.hidden_bytes.saturating_sub(attributed_total(&self.ghost));
            if unattributed > 0 {
                let _ = writeln!(
                    block,
                    "  (filesystem overhead and unlisted: {})",
                    format_bytes(unattributed)
                );
            }
        }

        block.push_str("```");
        Some(block)
    }
}

/// Human-readable byte count (binary units).
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;
    const TIB: u64 = 1024 * GIB;

    if bytes >= TIB {
        format!("{:.1} TB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1} GB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn thresholds() -> Thresholds {
        Thresholds {
            high_percent: 90,
            recovery_offset_percent: 5,
            nag_interval_minutes: 480,
        }
    }

    fn dirs(sizes: &[(&str, u64)]) -> Vec<DirUsage> {
        sizes
            .iter()
            .map(|(label, gib)| DirUsage {
                label: (*label).to_string(),
                bytes: gib * GIB,
            })
            .collect()
    }

    fn sample() -> MountSample {
        MountSample::from_parts(
            Path::new("/data"),
            100 * GIB,
            92 * GIB,
            80 * GIB,
            1,
            dirs(&[
                ("pg", 40),
                ("logs", 20),
                ("home", 10),
                ("opt", 5),
                ("srv", 3),
                ("tmp", 2),
            ]),
        )
    }

    fn ghost() -> Vec<GhostEntry> {
        vec![GhostEntry {
            owner_identity: "alice".to_string(),
            process_name: "java".to_string(),
            attributed_bytes: 10 * GIB,
        }]
    }

    #[test]
    fn new_alert_carries_summary_and_hidden_breakdown() {
        let message =
            AlertMessage::build(AlertKind::New, "db01", &sample(), &ghost(), &thresholds());
        let body = message.body();
        assert!(body.starts_with(":rotating_light: Disk usage alert on db01:/data"));
        assert!(body.contains("92.00%"));
        assert!(body.contains("used 92.0 GB of 100.0 GB"));
        assert!(body.contains("hidden 12.0 GB"));
        assert!(body.contains("85.00%"));

        let attachment = message.attachment().expect("breakdown present");
        assert!(attachment.starts_with("```\n"));
        assert!(attachment.ends_with("```"));
        assert!(attachment.contains("Ghost usage"));
        assert!(attachment.contains("alice/java"));
        assert!(attachment.contains("filesystem overhead and unlisted: 2.0 GB"));
    }

    #[test]
    fn directory_breakdown_is_capped_at_five() {
        let message = AlertMessage::build(AlertKind::New, "db01", &sample(), &[], &thresholds());
        assert_eq!(message.directories.len(), 5);
        let attachment = message.attachment().unwrap();
        assert!(attachment.contains("srv"));
        assert!(!attachment.contains("tmp"));
    }

    #[test]
    fn rows_are_label_colon_size() {
        let message =
            AlertMessage::build(AlertKind::New, "db01", &sample(), &ghost(), &thresholds());
        let attachment = message.attachment().unwrap();
        let pg_row = attachment
            .lines()
            .find(|line| line.trim_start().starts_with("pg"))
            .expect("pg row");
        assert!(pg_row.trim_start().starts_with("pg:"));
        assert!(pg_row.trim_end().ends_with("40.0 GB"));
        assert!(attachment.contains("alice/java:"));
    }

    #[test]
    fn ghost_table_keeps_every_entry_passed_in() {
        let many: Vec<GhostEntry> = (0..8_u64)
            .map(|i| GhostEntry {
                owner_identity: "alice".to_string(),
                process_name: format!("worker{i}"),
                attributed_bytes: (8 - i) * 100,
            })
            .collect();
        let message = AlertMessage::build(AlertKind::New, "db01", &sample(), &many, &thresholds());
        assert_eq!(message.ghost.len(), 8);
        assert!(message.attachment().unwrap().contains("alice/worker7:"));
    }

    #[test]
    fn ghost_section_omitted_when_empty() {
        let message = AlertMessage::build(AlertKind::New, "db01", &sample(), &[], &thresholds());
        let attachment = message.attachment().unwrap();
        assert!(!attachment.contains("Ghost usage"));
        assert!(!message.suggestion().contains("Restarting"));
    }

    #[test]
    fn headers_differ_per_kind() {
        let reminder = AlertMessage::build(AlertKind::Reminder, "h", &sample(), &[], &thresholds());
        let resolved = AlertMessage::build(AlertKind::Resolved, "h", &sample(), &[], &thresholds());
        assert!(reminder.header().contains("Reminder"));
        assert!(resolved.header().contains("recovered"));
        assert!(resolved.suggestion().contains("cleared"));
        assert_eq!(reminder.summary(), resolved.summary());
    }

    #[test]
    fn no_breakdown_means_no_attachment() {
        let bare = MountSample::from_parts(Path::new("/x"), 10, 9, 0, 1, Vec::new());
        let message = AlertMessage::build(AlertKind::New, "h", &bare, &[], &thresholds());
        assert!(message.attachment().is_none());
    }

    #[test]
    fn degenerate_recovery_is_called_out() {
        let degenerate = Thresholds {
            high_percent: 3,
            recovery_offset_percent: 5,
            nag_interval_minutes: 60,
        };
        let message = AlertMessage::build(AlertKind::New, "h", &sample(), &[], &degenerate);
        assert!(message.suggestion().contains("cannot clear"));
    }

    #[test]
    fn format_bytes_ranges() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(12 * GIB), "12.0 GB");
        assert_eq!(format_bytes(2 * 1024 * GIB), "2.0 TB");
    }
}

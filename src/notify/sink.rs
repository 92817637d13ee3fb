//! Notification sinks: Slack-style webhook (via curl), JSONL file, stdout.
//!
//! Delivery is a single attempt. Failures come back as `DsnError::Delivery`
//! and the caller decides what to log; nothing here retries.

#![allow(missing_docs)]

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::errors::{DsnError, Result};

// ──────────────────── configuration ────────────────────

/// Which sink receives notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Webhook,
    File,
    Stdout,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Webhook => write!(f, "webhook"),
            Self::File => write!(f, "file"),
            Self::Stdout => write!(f, "stdout"),
        }
    }
}

impl FromStr for SinkKind {
    type Err = DsnError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "webhook" => Ok(Self::Webhook),
            "file" => Ok(Self::File),
            "stdout" => Ok(Self::Stdout),
            other => Err(DsnError::InvalidConfig {
                details: format!("unknown notification sink {other:?} (webhook, file, stdout)"),
            }),
        }
    }
}

/// `[notifications]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotificationConfig {
    pub sink: SinkKind,
    /// Channel identifier passed to the sink; empty means the webhook default.
    pub channel: String,
    pub webhook_url: String,
    pub username: String,
    pub icon_emoji: String,
    /// Hard cap on one delivery attempt.
    pub timeout_secs: u64,
    pub file_path: PathBuf,
    /// Overrides the detected hostname in message headers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("/tmp"), PathBuf::from);
        Self {
            sink: SinkKind::Webhook,
            channel: String::new(),
            webhook_url: String::new(),
            username: "disk-sentinel".to_string(),
            icon_emoji: ":floppy_disk:".to_string(),
            timeout_secs: 10,
            file_path: home
                .join(".local")
                .join("share")
                .join("disk-sentinel")
                .join("notifications.jsonl"),
            hostname: None,
        }
    }
}

impl NotificationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(DsnError::InvalidConfig {
                details: "notifications.timeout_secs must be > 0".to_string(),
            });
        }
        match self.sink {
            SinkKind::Webhook if self.webhook_url.trim().is_empty() => Err(DsnError::InvalidConfig {
                details: "notifications.webhook_url is required when sink = \"webhook\"".to_string(),
            }),
            SinkKind::File if self.file_path.as_os_str().is_empty() => Err(DsnError::InvalidConfig {
                details: "notifications.file_path is required when sink = \"file\"".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

// ──────────────────── notifier seam ────────────────────

/// External messaging boundary: one call per notification.
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;
    fn deliver(&self, channel: &str, body: &str, attachment: Option<&str>) -> Result<()>;
}

/// Pick the sink for `config`; `dry_run` always prints instead.
#[must_use]
pub fn build_notifier(config: &NotificationConfig, dry_run: bool) -> Box<dyn Notifier> {
    if dry_run {
        return Box::new(StdoutNotifier);
    }
    match config.sink {
        SinkKind::Webhook => Box::new(WebhookNotifier::new(config)),
        SinkKind::File => Box::new(FileNotifier::new(config.file_path.clone())),
        SinkKind::Stdout => Box::new(StdoutNotifier),
    }
}

fn full_text(body: &str, attachment: Option<&str>) -> String {
    attachment.map_or_else(|| body.to_string(), |block| format!("{body}\n{block}"))
}

// ──── Webhook (HTTP POST via curl) ────

pub struct WebhookNotifier {
    url: String,
    username: String,
    icon_emoji: String,
    timeout_secs: u64,
}

impl WebhookNotifier {
    #[must_use]
    pub fn new(config: &NotificationConfig) -> Self {
        Self {
            url: config.webhook_url.clone(),
            username: config.username.clone(),
            icon_emoji: config.icon_emoji.clone(),
            timeout_secs: config.timeout_secs,
        }
    }

    /// Incoming-webhook JSON payload.
    #[must_use]
    pub fn payload(
        &self,
        channel: &str,
        body: &str,
        attachment: Option<&str>,
    ) -> serde_json::Value {
        let mut payload = serde_json::json!({ "text": full_text(body, attachment) });
        if !channel.is_empty() {
            payload["channel"] = serde_json::Value::from(channel);
        }
        if !self.username.is_empty() {
            payload["username"] = serde_json::Value::from(self.username.as_str());
        }
        if !self.icon_emoji.is_empty() {
            payload["icon_emoji"] = serde_json::Value::from(self.icon_emoji.as_str());
        }
        payload
    }

    /// Command line for curl. Target and body are read from `--config -`.
    fn curl_args(&self) -> Vec<String> {
        vec![
            "--silent".to_string(),
            "--show-error".to_string(),
            "--fail".to_string(),
            "--max-time".to_string(),
            self.timeout_secs.to_string(),
            "--config".to_string(),
            "-".to_string(),
        ]
    }
}

/// curl config text posting `body` as JSON to `url`.
fn curl_config(url: &str, body: &str) -> String {
    format!(
        "url = \"{}\"\nheader = \"Content-Type: application/json\"\ndata = \"{}\"\n",
        quote_config_value(url),
        quote_config_value(body)
    )
}

/// Escape a value for a double-quoted curl config string.
fn quote_config_value(raw: &str) -> String {
    let mut quoted = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            other => quoted.push(other),
        }
    }
    quoted
}

impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn deliver(&self, channel: &str, body: &str, attachment: Option<&str>) -> Result<()> {
        let payload = self.payload(channel, body, attachment).to_string();
        let spawn_error = |error: std::io::Error| DsnError::Delivery {
            sink: "webhook",
            details: format!("failed to run curl: {error}"),
        };

        // The URL carries the webhook secret; it goes over stdin, never argv.
        // --max-time bounds the whole exchange; a timeout is exit code 28.
        let mut child = Command::new("curl")
            .args(self.curl_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(curl_config(&self.url, &payload).as_bytes())
                .map_err(spawn_error)?;
        }
        let output = child.wait_with_output().map_err(spawn_error)?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = match output.status.code() {
            Some(28) => format!("timed out after {}s", self.timeout_secs),
            Some(code) => format!("curl exit {code}: {}", stderr.trim()),
            None => "curl terminated by signal".to_string(),
        };
        Err(DsnError::Delivery {
            sink: "webhook",
            details: reason,
        })
    }
}

// ──── File (append-only JSONL) ────

#[derive(Serialize)]
struct NotificationRecord<'a> {
    ts: String,
    channel: &'a str,
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    attachment: Option<&'a str>,
}

pub struct FileNotifier {
    path: PathBuf,
}

impl FileNotifier {
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Notifier for FileNotifier {
    fn name(&self) -> &'static str {
        "file"
    }

    fn deliver(&self, channel: &str, body: &str, attachment: Option<&str>) -> Result<()> {
        let record = NotificationRecord {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            channel,
            body,
            attachment,
        };
        let json = serde_json::to_string(&record)?;
        let fail = |error: std::io::Error| DsnError::Delivery {
            sink: "file",
            details: format!("{}: {error}", self.path.display()),
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(fail)?;
        }

        let mut opts = OpenOptions::new();
        opts.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt as _;
            opts.mode(0o600);
        }
        let mut file = opts.open(&self.path).map_err(fail)?;
        writeln!(file, "{json}").map_err(fail)
    }
}

// ──── Stdout (dry run) ────

pub struct StdoutNotifier;

impl Notifier for StdoutNotifier {
    fn name(&self) -> &'static str {
        "stdout"
    }

    fn deliver(&self, channel: &str, body: &str, attachment: Option<&str>) -> Result<()> {
        let target = if channel.is_empty() { "(default channel)" } else { channel };
        println!("--- notification -> {target}");
        println!("{}", full_text(body, attachment));
        Ok(())
    }
}

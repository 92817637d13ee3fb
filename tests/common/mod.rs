use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_dsn") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "dsn.exe" } else { "dsn" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve dsn binary path for integration test"),
    }
}

pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    run_cli_case_with_env(case_name, args, &[])
}

/// Run `dsn` with extra environment. `DSN_*` variables from the outer
/// environment are removed so cases only see what they set.
pub fn run_cli_case_with_env(case_name: &str, args: &[&str], env: &[(&str, &str)]) -> CmdResult {
    let root = std::env::temp_dir().join("dsn-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let mut command = Command::new(&bin_path);
    command.args(args);
    for (key, _) in std::env::vars() {
        if key.starts_with("DSN_") {
            command.env_remove(key);
        }
    }
    command
        .env("DSN_TEST_VERBOSE", "1")
        .env("RUST_BACKTRACE", "1")
        .envs(env.iter().copied());
    let output = command.output().expect("execute dsn command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("env={env:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

/// Config that watches `mount` with every state path inside `root` and
/// notifications going to a JSONL file.
pub fn write_sandbox_config(root: &Path, mount: &Path, high_percent: Option<u32>) -> PathBuf {
    let high = high_percent.map_or_else(String::new, |p| format!("high_percent = {p}\n"));
    let raw = format!(
        r##"mount_points = ["{mount}"]

[thresholds]
{high}recovery_offset_percent = 5
nag_interval_minutes = 480

[notifications]
sink = "file"
channel = "#ops"
file_path = "{root}/notifications.jsonl"
hostname = "testhost"

[ghost]
enabled = false

[paths]
flag_dir = "{root}/flags"
fallback_flag_dir = "{root}/volatile-flags"
activity_log = "{root}/activity.jsonl"
activity_log_fallback = "{root}/activity-fallback.jsonl"
lock_file = "{root}/run.lock"
"##,
        mount = mount.display(),
        root = root.display(),
    );
    let path = root.join("config.toml");
    fs::write(&path, raw).expect("write sandbox config");
    path
}

/// Parse the last JSON line printed on stdout.
pub fn last_json_line(stdout: &str) -> serde_json::Value {
    let line = stdout
        .lines()
        .rev()
        .find(|line| line.trim_start().starts_with('{'))
        .expect("json line on stdout");
    serde_json::from_str(line).expect("valid json")
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::target::{ServiceTarget, SpawnSpec, Timings};

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".warden";

fn default_port() -> u16 {
    8080
}

fn default_process_names() -> Vec<String> {
    vec!["node".to_string()]
}

fn default_startup_timeout_secs() -> u64 {
    15
}

fn default_stop_timeout_secs() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_kill_rounds() -> u32 {
    3
}

fn default_round_delay_secs() -> u64 {
    2
}

fn default_grace_period_ms() -> u64 {
    2000
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

fn default_log_file() -> Option<PathBuf> {
    Some(PathBuf::from("server.log"))
}

fn default_monitor_interval_ms() -> u64 {
    3000
}

/// Identity and timing of the supervised service.
///
/// ```toml
/// [service]
/// port = 8080
/// process_names = ["node"]
/// command_line_match = "rssfeed"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceSettings {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_process_names")]
    pub process_names: Vec<String>,
    #[serde(default)]
    pub command_line_match: String,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_kill_rounds")]
    pub kill_rounds: u32,
    #[serde(default = "default_round_delay_secs")]
    pub round_delay_secs: u64,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            process_names: default_process_names(),
            command_line_match: String::new(),
            startup_timeout_secs: default_startup_timeout_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            kill_rounds: default_kill_rounds(),
            round_delay_secs: default_round_delay_secs(),
            grace_period_ms: default_grace_period_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

/// How to launch the service. Relative paths resolve against the project
/// root (the directory holding `.warden/`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpawnSettings {
    #[serde(default)]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_log_file")]
    pub log_file: Option<PathBuf>,
}

impl Default for SpawnSettings {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: Vec::new(),
            work_dir: None,
            env: BTreeMap::new(),
            log_file: default_log_file(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorSettings {
    #[serde(default = "default_monitor_interval_ms")]
    pub interval_ms: u64,
    /// JSON-lines file receiving every supervisor event.
    #[serde(default)]
    pub event_log: Option<PathBuf>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_monitor_interval_ms(),
            event_log: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct WardenConfig {
    #[serde(default)]
    pub service: ServiceSettings,
    #[serde(default)]
    pub spawn: SpawnSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
}

impl WardenConfig {
    /// Search upward from `start` for a `.warden/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let config = Self::load_file(&path)?;
            Ok((config, Some(path)))
        } else {
            Ok((WardenConfig::default(), None))
        }
    }

    /// Load an explicit config file.
    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    pub fn to_target(&self) -> Result<ServiceTarget> {
        let s = &self.service;
        let timings = Timings {
            startup_timeout: Duration::from_secs(s.startup_timeout_secs),
            stop_timeout: Duration::from_secs(s.stop_timeout_secs),
            poll_interval: Duration::from_millis(s.poll_interval_ms),
            kill_rounds: s.kill_rounds,
            round_delay: Duration::from_secs(s.round_delay_secs),
            grace_period: Duration::from_millis(s.grace_period_ms),
            probe_timeout: Duration::from_millis(s.probe_timeout_ms),
        };
        ServiceTarget::new(s.port, &s.process_names, &s.command_line_match, timings)
            .context("invalid [service] configuration")
    }

    pub fn to_spawn_spec(&self, root: &Path) -> SpawnSpec {
        let sp = &self.spawn;
        SpawnSpec {
            program: sp.program.clone(),
            args: sp.args.clone(),
            work_dir: Some(resolve(root, sp.work_dir.as_deref().unwrap_or(Path::new(".")))),
            env: sp
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            log_file: sp.log_file.as_deref().map(|p| resolve(root, p)),
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.interval_ms.max(1))
    }

    pub fn event_log_path(&self, root: &Path) -> Option<PathBuf> {
        self.monitor.event_log.as_deref().map(|p| resolve(root, p))
    }
}

/// Directory relative paths resolve against for a loaded config file.
pub fn project_root(config_path: Option<&Path>, cwd: &Path) -> PathBuf {
    match config_path.and_then(Path::parent) {
        Some(dir) if dir.file_name().is_some_and(|n| n == CONFIG_DIR) => dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cwd.to_path_buf()),
        Some(dir) => dir.to_path_buf(),
        None => cwd.to_path_buf(),
    }
}

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .warden/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<20} {value}\n"));
}

fn or_none(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "(none)".to_string())
}

pub fn render_human(config: &WardenConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    let s = &config.service;
    output.push_str("Service\n");
    push_kv(&mut output, "port", s.port);
    push_kv(&mut output, "process_names", s.process_names.join(", "));
    push_kv(
        &mut output,
        "command_line_match",
        if s.command_line_match.is_empty() {
            "(any)"
        } else {
            s.command_line_match.as_str()
        },
    );
    push_kv(&mut output, "startup_timeout", format!("{}s", s.startup_timeout_secs));
    push_kv(&mut output, "stop_timeout", format!("{}s", s.stop_timeout_secs));
    push_kv(&mut output, "poll_interval", format!("{}ms", s.poll_interval_ms));
    push_kv(&mut output, "kill_rounds", s.kill_rounds);
    push_kv(&mut output, "round_delay", format!("{}s", s.round_delay_secs));
    push_kv(&mut output, "grace_period", format!("{}ms", s.grace_period_ms));
    push_kv(&mut output, "probe_timeout", format!("{}ms", s.probe_timeout_ms));
    output.push('\n');

    let sp = &config.spawn;
    output.push_str("Spawn\n");
    push_kv(
        &mut output,
        "program",
        if sp.program.is_empty() {
            "(not set)"
        } else {
            sp.program.as_str()
        },
    );
    if sp.args.is_empty() {
        push_kv(&mut output, "args", "(none)");
    } else {
        push_kv(&mut output, "args", sp.args.join(", "));
    }
    push_kv(&mut output, "work_dir", or_none(sp.work_dir.as_deref()));
    push_kv(&mut output, "log_file", or_none(sp.log_file.as_deref()));
    if sp.env.is_empty() {
        push_kv(&mut output, "env", "(none)");
    } else {
        for (key, value) in &sp.env {
            output.push_str(&format!("  - {key}={value}\n"));
        }
    }
    output.push('\n');

    output.push_str("Monitor\n");
    push_kv(&mut output, "interval", format!("{}ms", config.monitor.interval_ms));
    push_kv(&mut output, "event_log", or_none(config.monitor.event_log.as_deref()));
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

pub fn render_json(config: &WardenConfig, config_path: Option<&Path>) -> Result<String> {
    let mut payload = serde_json::to_value(config).context("failed to serialize config")?;
    payload["source_path"] = serde_json::Value::String(config_source_label(config_path));
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else if path == Path::new(".") {
        root.to_path_buf()
    } else {
        root.join(path)
    }
}

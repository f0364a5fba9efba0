use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_ROLE_MARKER: &str = "DAEMON";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Environment variable that tells a re-executed binary it is the detached child.
    pub role_marker: String,
    /// Overrides `Worker::pid_directory` when set.
    pub pid_directory: Option<PathBuf>,
    /// Upper bound for worker `stop()`/`restart()`; `None` waits forever.
    pub stop_timeout: Option<Duration>,
    pub pipeline: PipelineConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            role_marker: DEFAULT_ROLE_MARKER.to_string(),
            pid_directory: None,
            stop_timeout: None,
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Redirections for the detached child's stdin/stdout/stderr. Unset streams are inherited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default)]
    pub stdin: Option<PathBuf>,
    #[serde(default)]
    pub stdout: Option<PathBuf>,
    #[serde(default)]
    pub stderr: Option<PathBuf>,
}

impl PipelineConfig {
    /// Open the configured files: stdin read-only, stdout/stderr append+create.
    pub fn open(&self) -> anyhow::Result<[Option<File>; 3]> {
        let stdin = match &self.stdin {
            Some(p) => Some(
                File::open(p).map_err(|e| anyhow::anyhow!("failed to open stdin {}: {e}", p.display()))?,
            ),
            None => None,
        };
        Ok([stdin, open_append(self.stdout.as_deref())?, open_append(self.stderr.as_deref())?])
    }
}

fn open_append(path: Option<&Path>) -> anyhow::Result<Option<File>> {
    let Some(p) = path else {
        return Ok(None);
    };
    if let Some(parent) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| anyhow::anyhow!("failed to create log directory {}: {e}", parent.display()))?;
    }
    let f = OpenOptions::new()
        .append(true)
        .create(true)
        .open(p)
        .map_err(|e| anyhow::anyhow!("failed to open log file {}: {e}", p.display()))?;
    Ok(Some(f))
}

// -------- YAML file schema (strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DaemonConfigFile {
    #[serde(default)]
    role_marker: Option<String>,
    #[serde(default)]
    pid_directory: Option<PathBuf>,
    #[serde(default)]
    stop_timeout: Option<String>,
    #[serde(default)]
    pipeline: Option<PipelineConfig>,
}

pub fn load_config(config_path: &Path) -> anyhow::Result<DaemonConfig> {
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", config_path.display()))?;
    parse_config(&raw).map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", config_path.display()))
}

pub fn parse_config(raw: &str) -> anyhow::Result<DaemonConfig> {
    // An empty document is a valid "all defaults" config.
    if raw.trim().is_empty() {
        return Ok(DaemonConfig::default());
    }
    let file_cfg: DaemonConfigFile = serde_yaml::from_str(raw)?;

    let mut cfg = DaemonConfig::default();
    if let Some(marker) = file_cfg.role_marker {
        let marker = marker.trim().to_string();
        validate_env_name(&marker)?;
        cfg.role_marker = marker;
    }
    cfg.pid_directory = file_cfg.pid_directory;
    if let Some(t) = file_cfg.stop_timeout {
        cfg.stop_timeout = Some(Duration::from_millis(parse_duration_ms(&t)?));
    }
    if let Some(p) = file_cfg.pipeline {
        cfg.pipeline = p;
    }
    Ok(cfg)
}

pub(crate) fn validate_env_name(name: &str) -> anyhow::Result<()> {
    anyhow::ensure!(!name.is_empty(), "role_marker must not be empty");
    anyhow::ensure!(
        !name.contains('=') && !name.contains('\0'),
        "role_marker {name:?} is not a valid environment variable name"
    );
    Ok(())
}

/// Parse `5d4h3s`, `10m`, `1500ms`. Units go from larger to smaller; no repeats.
pub fn parse_duration_ms(spec: &str) -> anyhow::Result<u64> {
    let t = spec.trim();
    anyhow::ensure!(!t.is_empty(), "empty duration");
    anyhow::ensure!(!t.chars().any(|c| c.is_whitespace()), "duration must not contain whitespace");
    let s = t.to_ascii_lowercase();

    // Rank: d(5) > h(4) > m(3) > s(2) > ms(1)
    fn rank(unit: &str) -> u8 {
        match unit {
            "d" => 5,
            "h" => 4,
            "m" => 3,
            "s" => 2,
            _ => 1,
        }
    }
    fn mult(unit: &str) -> u64 {
        match unit {
            "d" => 86_400_000,
            "h" => 3_600_000,
            "m" => 60_000,
            "s" => 1_000,
            _ => 1,
        }
    }

    let b = s.as_bytes();
    let mut i = 0usize;
    let mut prev_rank: u8 = u8::MAX;
    let mut total: u64 = 0;

    while i < b.len() {
        let start = i;
        while i < b.len() && b[i].is_ascii_digit() {
            i += 1;
        }
        anyhow::ensure!(i > start, "duration: expected number at offset {start}");
        let num: u64 = s[start..i].parse()?;

        anyhow::ensure!(i < b.len(), "duration: missing unit after {num}");
        let unit = if s[i..].starts_with("ms") {
            i += 2;
            "ms"
        } else {
            let unit = match b[i] {
                b'd' => "d",
                b'h' => "h",
                b'm' => "m",
                b's' => "s",
                _ => anyhow::bail!("duration: invalid unit at offset {i}"),
            };
            i += 1;
            unit
        };

        let r = rank(unit);
        anyhow::ensure!(
            r < prev_rank,
            "duration: units must go from larger to smaller without repeats (e.g. 1m30s); got ...{unit}"
        );
        prev_rank = r;

        let add = num.checked_mul(mult(unit)).ok_or_else(|| anyhow::anyhow!("duration overflow"))?;
        total = total.checked_add(add).ok_or_else(|| anyhow::anyhow!("duration overflow"))?;
    }
    Ok(total)
}

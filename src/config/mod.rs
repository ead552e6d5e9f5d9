use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::shim::{DEFAULT_PREFIXES, PREFIXES_ENV, USAGE_LOG_ENV};
use crate::store::model::PROBE_SUFFIX_DEFAULT;

pub const STATE_DIR: &str = ".pruneguard";
pub const CONFIG_FILE: &str = "config.yml";
pub const TICK_INTERVAL_SECS_DEFAULT: u64 = 30;
pub const MAX_LINES_PER_TICK_DEFAULT: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub root: PathBuf,
    pub usage_log: PathBuf,
    pub checkpoint: PathBuf,
    pub database: PathBuf,
    pub pid_file: PathBuf,
    pub daemon_log: PathBuf,
    pub shim_dir: PathBuf,
    pub prefixes: Vec<PathBuf>,
    pub probe_suffix: String,
    pub tick_interval: Duration,
    pub max_lines_per_tick: usize,
}

impl Settings {
    pub fn defaults(home: &Path) -> Self {
        let root = home.join(STATE_DIR);
        Self {
            usage_log: root.join("usage.log"),
            checkpoint: root.join("usage.offset"),
            database: root.join("pruneguard.db"),
            pid_file: root.join("watch.pid"),
            daemon_log: root.join("watch.log"),
            shim_dir: root.join("bin"),
            prefixes: DEFAULT_PREFIXES.iter().map(PathBuf::from).collect(),
            probe_suffix: PROBE_SUFFIX_DEFAULT.to_string(),
            tick_interval: Duration::from_secs(TICK_INTERVAL_SECS_DEFAULT),
            max_lines_per_tick: MAX_LINES_PER_TICK_DEFAULT,
            root,
        }
    }

    /// The shim reads the same two variables, so the CLI honours them too.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(USAGE_LOG_ENV).filter(|value| !value.is_empty()) {
            self.usage_log = PathBuf::from(path);
        }
        if let Some(raw) = lookup(PREFIXES_ENV).filter(|value| !value.is_empty()) {
            self.prefixes = raw
                .split(':')
                .filter(|part| !part.is_empty())
                .map(PathBuf::from)
                .collect();
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    usage_log: Option<String>,
    #[serde(default)]
    checkpoint: Option<String>,
    #[serde(default)]
    database: Option<String>,
    #[serde(default)]
    pid_file: Option<String>,
    #[serde(default)]
    daemon_log: Option<String>,
    #[serde(default)]
    shim_dir: Option<String>,
    #[serde(default)]
    prefixes: Option<Vec<String>>,
    #[serde(default)]
    probe_suffix: Option<String>,
    #[serde(default)]
    tick_interval_secs: Option<u64>,
    #[serde(default)]
    max_lines_per_tick: Option<usize>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

pub fn default_config_path(home: &Path) -> PathBuf {
    home.join(STATE_DIR).join(CONFIG_FILE)
}

/// Defaults under `~/.pruneguard`, overlaid with the config file when it
/// exists.
pub fn load_settings(home: &Path, config: Option<&Path>) -> Result<Settings, ConfigError> {
    let mut settings = Settings::defaults(home);
    let path = config
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_config_path(home));
    if path.is_file() {
        let content = fs::read_to_string(&path)?;
        let raw = parse_config(&content)?;
        merge_raw(&mut settings, raw, home)?;
    }
    Ok(settings)
}

fn parse_config(content: &str) -> Result<RawConfig, ConfigError> {
    if content.trim().is_empty() {
        return Ok(RawConfig::default());
    }
    Ok(serde_yaml::from_str(content)?)
}

fn merge_raw(settings: &mut Settings, raw: RawConfig, home: &Path) -> Result<(), ConfigError> {
    let paths = [
        (raw.usage_log, &mut settings.usage_log),
        (raw.checkpoint, &mut settings.checkpoint),
        (raw.database, &mut settings.database),
        (raw.pid_file, &mut settings.pid_file),
        (raw.daemon_log, &mut settings.daemon_log),
        (raw.shim_dir, &mut settings.shim_dir),
    ];
    for (value, slot) in paths {
        if let Some(value) = value {
            *slot = expand_tilde(&value, home);
        }
    }

    if let Some(prefixes) = raw.prefixes {
        if prefixes.is_empty() {
            return Err(ConfigError::Invalid {
                key: "prefixes",
                reason: "at least one installation prefix is required".to_string(),
            });
        }
        settings.prefixes = prefixes
            .iter()
            .map(|prefix| expand_tilde(prefix, home))
            .collect();
    }

    if let Some(suffix) = raw.probe_suffix {
        if suffix.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "probe_suffix",
                reason: "must not be empty".to_string(),
            });
        }
        settings.probe_suffix = suffix;
    }

    if let Some(secs) = raw.tick_interval_secs {
        if secs == 0 {
            return Err(ConfigError::Invalid {
                key: "tick_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        settings.tick_interval = Duration::from_secs(secs);
    }

    if let Some(max_lines) = raw.max_lines_per_tick {
        if max_lines == 0 {
            return Err(ConfigError::Invalid {
                key: "max_lines_per_tick",
                reason: "must be at least 1".to_string(),
            });
        }
        settings.max_lines_per_tick = max_lines;
    }
    Ok(())
}

pub fn default_config_yaml() -> String {
    format!(
        r#"# usage_log: ~/.pruneguard/usage.log
# checkpoint: ~/.pruneguard/usage.offset
# database: ~/.pruneguard/pruneguard.db
# shim_dir: ~/.pruneguard/bin
prefixes:
  - /opt/homebrew
  - /usr/local
  - /home/linuxbrew/.linuxbrew
probe_suffix: "{PROBE_SUFFIX_DEFAULT}"
tick_interval_secs: {TICK_INTERVAL_SECS_DEFAULT}
max_lines_per_tick: {MAX_LINES_PER_TICK_DEFAULT}
"#
    )
}

pub fn expand_tilde(path: &str, home: &Path) -> PathBuf {
    if path == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(path)
}

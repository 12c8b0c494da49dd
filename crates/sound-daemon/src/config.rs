//! Configuration loading and parsing.
//!
//! Defines the daemon config schema, resolves the file location and renders
//! the effective configuration for `dump-conf`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sound_core_types::ResourceKind;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sound-daemon/daemon.toml";
pub const CONFIG_ENV: &str = "SOUND_DAEMON_CONFIG";

/// Where log lines go and in which format.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    /// Human-readable, colored when stderr is a terminal.
    #[default]
    Auto,
    /// Human-readable, never colored.
    Stderr,
    /// One JSON object per line.
    Json,
}

/// Top-level daemon configuration loaded from TOML.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Raise the default log level to debug.
    pub verbose: bool,
    /// Abort startup when a configured autoload entry is rejected.
    pub fail: bool,
    /// Refuse every module load after startup.
    pub disallow_module_loading: bool,
    /// Seconds an auto-unload module may stay idle; 0 disables idle unload.
    pub module_idle_time_sec: u64,
    pub log_target: LogTarget,
    /// Sink resolved at startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_sink: Option<String>,
    /// Source resolved at startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_source: Option<String>,
    pub hotplug: HotplugSettings,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub autoload: Vec<AutoloadConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            fail: true,
            disallow_module_loading: false,
            module_idle_time_sec: 20,
            log_target: LogTarget::Auto,
            default_sink: None,
            default_source: None,
            hotplug: HotplugSettings::default(),
            autoload: Vec::new(),
        }
    }
}

/// `[hotplug]` table.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HotplugSettings {
    pub enabled: bool,
    /// Ask card modules for timer-based scheduling.
    pub tsched: bool,
    pub sysfs_dir: PathBuf,
    /// udev device database (`+sound:card<N>` files).
    pub udev_db_dir: PathBuf,
    /// Directory holding the `controlC<N>` nodes.
    pub dev_dir: PathBuf,
}

impl Default for HotplugSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tsched: true,
            sysfs_dir: PathBuf::from("/sys"),
            udev_db_dir: PathBuf::from("/run/udev/data"),
            dev_dir: PathBuf::from("/dev/snd"),
        }
    }
}

/// One `[[autoload]]` table.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AutoloadConfig {
    pub name: String,
    pub kind: ResourceKind,
    pub module: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub args: String,
}

impl DaemonConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::parse(&raw).with_context(|| format!("parse config {:?}", path))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str::<DaemonConfig>(raw)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self).context("serialize config")
    }
}

/// Configuration together with the file it came from.
#[derive(Clone, Debug)]
pub struct LoadedConfig {
    pub config: DaemonConfig,
    pub source: Option<PathBuf>,
}

/// Pick the config file: explicit flag, then environment, then the default
/// location when it exists.
pub fn resolve_config_path(
    explicit: Option<&Path>,
    env: Option<OsString>,
    default: &Path,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = env.filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(path));
    }
    default.exists().then(|| default.to_path_buf())
}

pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    let path = resolve_config_path(
        explicit,
        std::env::var_os(CONFIG_ENV),
        Path::new(DEFAULT_CONFIG_PATH),
    );
    let config = match path.as_deref() {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };
    Ok(LoadedConfig {
        config,
        source: path,
    })
}

/// Render the effective configuration as TOML.
pub fn dump_conf(config: &DaemonConfig, source: Option<&Path>) -> Result<String> {
    let mut out = String::new();
    if let Some(path) = source {
        out.push_str(&format!(
            "### Read from configuration file: {} ###\n",
            path.display()
        ));
    }
    out.push_str(&config.to_toml()?);
    Ok(out)
}

use std::{fmt, fs, path, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ConfigError, StartupError};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/cluster-latency/config.toml";

const MAX_DOWNLOAD_PAYLOAD_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub probe: ProbeSettings,
    pub directory: DirectorySettings,
    pub metrics: MetricsSettings,
    pub server: ServerSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
    pub jitter_max_millis: u64,
    /// Probe our own pod as well
    pub include_self: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorySettings {
    pub refresh_interval_seconds: u64,
    pub refresh_timeout_seconds: u64,
    pub label_selector: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub label_granularity: LabelGranularity,
    pub retention: RetentionPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub port: u16,
    pub download_payload_bytes: u64,
}

/// Which identity the probe series are labelled with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelGranularity {
    #[default]
    Peer,
    Zone,
}

impl LabelGranularity {
    /// Prometheus label name for this granularity
    pub fn label_name(self) -> &'static str {
        match self {
            LabelGranularity::Peer => "peer",
            LabelGranularity::Zone => "zone",
        }
    }
}

/// What happens to the series of a peer that left the cohort
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    #[default]
    Retain,
    Evict,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self { interval_seconds: 15, timeout_seconds: 5, jitter_max_millis: 1000, include_self: false }
    }
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            refresh_interval_seconds: 30,
            refresh_timeout_seconds: 10,
            label_selector: "app=cluster-latency".into(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { bind: "0.0.0.0".into(), port: 8080, download_payload_bytes: 1024 * 1024 }
    }
}

impl fmt::Display for LabelGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label_name())
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionPolicy::Retain => write!(f, "retain"),
            RetentionPolicy::Evict => write!(f, "evict"),
        }
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Probe")?;
        write_1(f, "Interval (s)", &self.probe.interval_seconds)?;
        write_1(f, "Timeout (s)", &self.probe.timeout_seconds)?;
        write_1(f, "Start Jitter (ms)", &self.probe.jitter_max_millis)?;
        write_1(f, "Include Self", &self.probe.include_self)?;
        write_title_1(f, "Directory")?;
        write_1(f, "Refresh Interval (s)", &self.directory.refresh_interval_seconds)?;
        write_1(f, "Refresh Timeout (s)", &self.directory.refresh_timeout_seconds)?;
        write_1(f, "Label Selector", &self.directory.label_selector)?;
        write_title_1(f, "Metrics")?;
        write_1(f, "Label Granularity", &self.metrics.label_granularity)?;
        write_1(f, "Retention", &self.metrics.retention)?;
        write_title_1(f, "Server")?;
        write_1(f, "Bind Address", &self.server.bind)?;
        write_1(f, "Port", &self.server.port)?;
        write_1(f, "Download Payload (bytes)", &self.server.download_payload_bytes)?;

        Ok(())
    }
}

impl Config {
    /// Load the config from `path`, falling back to defaults when the file is absent.
    ///
    /// Pods usually run with a read-only filesystem, so a missing file is never
    /// created here; use [`Config::write_config`] explicitly for that.
    pub fn from_config(path: impl AsRef<path::Path>) -> Result<Self, ConfigError> {
        let config_path = normalize_toml_path(path.as_ref());

        if !config_path.exists() {
            info!("No config at {}, using defaults", config_path.display());
            return Ok(Self::default());
        }

        let raw_string = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(raw_string.as_str())?)
    }

    /// Serialize and write a config to the same file [`Config::from_config`] would read
    /// for `path`. Returns the path actually written.
    pub fn write_config(&self, path: &path::Path) -> Result<path::PathBuf, ConfigError> {
        let config_path = normalize_toml_path(path);
        let config_str: String = toml::to_string_pretty(self)?;
        let write_err = |source| ConfigError::Write { path: config_path.display().to_string(), source };

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        fs::write(&config_path, config_str).map_err(write_err)?;
        Ok(config_path)
    }

    /// Reject settings the engine cannot honour
    pub fn validate(&self) -> Result<(), StartupError> {
        let invalid = |msg: String| Err(StartupError::InvalidConfig(msg));

        if self.probe.interval_seconds == 0 {
            return invalid("probe.interval_seconds must be greater than 0".into());
        }
        if self.probe.timeout_seconds == 0 {
            return invalid("probe.timeout_seconds must be greater than 0".into());
        }
        if self.probe.timeout_seconds >= self.probe.interval_seconds {
            return invalid(format!(
                "probe.timeout_seconds ({}) must be shorter than probe.interval_seconds ({})",
                self.probe.timeout_seconds, self.probe.interval_seconds
            ));
        }
        if self.directory.refresh_interval_seconds == 0 {
            return invalid("directory.refresh_interval_seconds must be greater than 0".into());
        }
        if self.directory.refresh_timeout_seconds == 0 {
            return invalid("directory.refresh_timeout_seconds must be greater than 0".into());
        }
        if self.directory.label_selector.trim().is_empty() {
            return invalid("directory.label_selector must not be empty".into());
        }
        if self.server.download_payload_bytes > MAX_DOWNLOAD_PAYLOAD_BYTES {
            return invalid(format!(
                "server.download_payload_bytes ({}) exceeds the {} byte limit",
                self.server.download_payload_bytes, MAX_DOWNLOAD_PAYLOAD_BYTES
            ));
        }

        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe.interval_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe.timeout_seconds)
    }

    /// Start jitter bound, never longer than one interval
    pub fn jitter_max(&self) -> Duration {
        Duration::from_millis(self.probe.jitter_max_millis).min(self.probe_interval())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.directory.refresh_interval_seconds)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.directory.refresh_timeout_seconds)
    }

    /// How long shutdown waits for in-flight ticks (ping + download) to finish
    pub fn shutdown_grace(&self) -> Duration {
        self.probe_timeout() * 2 + Duration::from_secs(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.probe_interval(), Duration::from_secs(15));
        assert_eq!(config.metrics.label_granularity, LabelGranularity::Peer);
        assert_eq!(config.metrics.retention, RetentionPolicy::Retain);
    }

    #[test]
    fn test_timeout_must_be_shorter_than_interval() {
        let mut config = Config::default();
        config.probe.timeout_seconds = config.probe.interval_seconds;
        assert!(matches!(config.validate(), Err(StartupError::InvalidConfig(_))));

        config.probe.timeout_seconds = config.probe.interval_seconds - 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let mut config = Config::default();
        config.directory.refresh_interval_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.probe.interval_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_jitter_capped_at_interval() {
        let mut config = Config::default();
        config.probe.jitter_max_millis = 60_000;
        assert_eq!(config.jitter_max(), config.probe_interval());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::from_config(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert!(!dir.path().join("absent.toml").exists());
    }

    #[test]
    fn test_partial_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[probe]\ninterval_seconds = 20\n\n[metrics]\nlabel_granularity = \"zone\"\nretention = \"evict\"\n",
        )
        .unwrap();

        let config = Config::from_config(&path).unwrap();
        assert_eq!(config.probe.interval_seconds, 20);
        assert_eq!(config.probe.timeout_seconds, 5);
        assert_eq!(config.metrics.label_granularity, LabelGranularity::Zone);
        assert_eq!(config.metrics.retention, RetentionPolicy::Evict);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = Config::default();
        config.server.port = 9100;
        config.write_config(&path).unwrap();

        assert_eq!(Config::from_config(&path).unwrap(), config);
    }

    #[test]
    fn test_written_config_is_read_back_from_non_toml_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cfg.conf");
        let mut config = Config::default();
        config.probe.include_self = true;

        let written = config.write_config(&path).unwrap();
        assert_eq!(written, dir.path().join("cfg.toml"));
        assert!(written.exists());
        assert_eq!(Config::from_config(&path).unwrap(), config);
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[probe\ninterval_seconds = ").unwrap();
        assert!(matches!(Config::from_config(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_display_lists_sections() {
        let rendered = Config::default().to_string();
        assert!(rendered.contains("Probe"));
        assert!(rendered.contains("Label Granularity: peer"));
        assert!(rendered.contains("Retention: retain"));
    }
}

//! YAML settings for the hub, the console sink and the datapool batch writers.
//!
//! ```yaml
//! channel_capacity: 32767
//! drain_timeout_ms: 5000
//! filter:
//!   excluded: ["/health"]
//! console:
//!   enabled: true
//!   request: false
//!   response: false
//! datapool:
//!   buffer_size: 1000
//!   buffer_dur_ms: 30000
//!   compress: gzip
//! app:
//!   name: orders
//!   version: 1.4.2
//! ```

use crate::channel::DEFAULT_CAPACITY;
use crate::error::ConfigError;
use crate::filter::FilterRule;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Deployment tiers whose datapool lives under `<env>/<app>/monitor`.
const REMOTE_TIERS: [&str; 2] = ["uat", "prd"];

/// Root of the local datapool when no tier applies.
pub const LOCAL_DATAPOOL: &str = "./data/monitor";

/// Path value that turns the datapool writers off.
pub const DATAPOOL_DISABLED: &str = "-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub channel_capacity: usize,
    pub drain_timeout_ms: u64,
    /// Default trace filter for sinks without their own.
    pub filter: FilterRule,
    pub console: ConsoleSettings,
    pub datapool: DatapoolSettings,
    pub app: AppSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CAPACITY,
            drain_timeout_ms: 5_000,
            filter: FilterRule::default(),
            console: ConsoleSettings::default(),
            datapool: DatapoolSettings::default(),
            app: AppSettings::default(),
        }
    }
}

impl Settings {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_yaml::from_str(yaml)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid { key: "channel_capacity", reason: "must be > 0".into() });
        }
        if self.datapool.buffer_size == 0 {
            return Err(ConfigError::Invalid { key: "datapool.buffer_size", reason: "must be > 0".into() });
        }
        if self.datapool.buffer_dur_ms == 0 {
            return Err(ConfigError::Invalid { key: "datapool.buffer_dur_ms", reason: "must be > 0".into() });
        }
        match self.datapool.compress.as_str() {
            "" | "gzip" => {}
            other => {
                return Err(ConfigError::Invalid {
                    key: "datapool.compress",
                    reason: format!("unknown codec `{other}`"),
                })
            }
        }
        // surface bad patterns at load time rather than at registration
        self.filter.compile().map(|_| ())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleSettings {
    pub enabled: bool,
    /// Log request bodies.
    pub request: bool,
    /// Log response bodies.
    pub response: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatapoolSettings {
    /// Root directory; empty means "derive from `ENV`", `-` disables the writers.
    pub path: String,
    pub buffer_size: usize,
    pub buffer_dur_ms: u64,
    /// `""` or `"gzip"`.
    pub compress: String,
    pub max_buffered: Option<usize>,
}

impl Default for DatapoolSettings {
    fn default() -> Self {
        Self {
            path: String::new(),
            buffer_size: 1000,
            buffer_dur_ms: 30_000,
            compress: String::new(),
            max_buffered: None,
        }
    }
}

impl DatapoolSettings {
    pub fn buffer_duration(&self) -> Duration {
        Duration::from_millis(self.buffer_dur_ms)
    }

    pub fn gzip(&self) -> bool {
        self.compress == "gzip"
    }

    /// Resolve the datapool root from the explicit path or the deployment tier.
    /// `None` when the datapool is disabled.
    pub fn root(&self, env: Option<&str>, app: &str) -> Option<PathBuf> {
        match self.path.as_str() {
            DATAPOOL_DISABLED => None,
            "" => Some(match env {
                Some(tier) if REMOTE_TIERS.contains(&tier) => PathBuf::from(format!("{tier}/{app}/monitor")),
                _ => PathBuf::from(LOCAL_DATAPOOL),
            }),
            explicit => Some(PathBuf::from(explicit)),
        }
    }

    /// [`DatapoolSettings::root`] using the process `ENV` variable.
    pub fn root_from_env(&self, app: &str) -> Option<PathBuf> {
        let env = std::env::var("ENV").ok();
        self.root(env.as_deref(), app)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub name: String,
    pub version: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self { name: env!("CARGO_PKG_NAME").to_string(), version: env!("CARGO_PKG_VERSION").to_string() }
    }
}

/// Who is emitting telemetry; attached as labels by remote sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub app: String,
    pub version: String,
    pub hostname: String,
    /// Deployment tier from `ENV`, `default` when unset.
    pub env: String,
}

impl ProcessIdentity {
    pub fn new(
        app: impl Into<String>,
        version: impl Into<String>,
        hostname: impl Into<String>,
        env: impl Into<String>,
    ) -> Self {
        Self { app: app.into(), version: version.into(), hostname: hostname.into(), env: env.into() }
    }

    /// Read hostname and tier from the environment.
    pub fn detect(app: &AppSettings) -> Self {
        let env = std::env::var("ENV").ok().filter(|v| !v.is_empty()).unwrap_or_else(|| "default".into());
        Self::new(app.name.clone(), app.version.clone(), detect_hostname(), env)
    }
}

fn detect_hostname() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .chain(std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let settings = Settings::from_yaml_str("{}").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.channel_capacity, 32_767);
        assert_eq!(settings.datapool.buffer_duration(), Duration::from_secs(30));
    }

    #[test]
    fn parses_nested_sections() {
        let yaml = r#"
drain_timeout_ms: 250
filter:
  included: ["/api/*"]
  excludedIPs: ["10.0.0.5"]
console:
  enabled: true
  response: true
datapool:
  path: /var/monitor
  buffer_size: 100
  compress: gzip
app:
  name: orders
  version: 2.0.0
"#;
        let settings = Settings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings.drain_timeout(), Duration::from_millis(250));
        assert_eq!(settings.filter.excluded_ips, vec!["10.0.0.5"]);
        assert!(settings.console.enabled && settings.console.response && !settings.console.request);
        assert!(settings.datapool.gzip());
        assert_eq!(settings.app.name, "orders");
    }

    #[test]
    fn invalid_values_are_config_errors() {
        assert!(matches!(
            Settings::from_yaml_str("datapool:\n  compress: zstd\n"),
            Err(ConfigError::Invalid { key: "datapool.compress", .. })
        ));
        assert!(matches!(
            Settings::from_yaml_str("filter:\n  included: ['/a/{b']\n"),
            Err(ConfigError::InvalidPattern { .. })
        ));
        assert!(matches!(Settings::from_yaml_str("channel_capacity: [1]"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn datapool_root_follows_tier() {
        let datapool = DatapoolSettings::default();
        assert_eq!(datapool.root(Some("prd"), "orders"), Some(PathBuf::from("prd/orders/monitor")));
        assert_eq!(datapool.root(Some("uat"), "orders"), Some(PathBuf::from("uat/orders/monitor")));
        assert_eq!(datapool.root(Some("dev"), "orders"), Some(PathBuf::from(LOCAL_DATAPOOL)));
        assert_eq!(datapool.root(None, "orders"), Some(PathBuf::from(LOCAL_DATAPOOL)));

        let disabled = DatapoolSettings { path: "-".into(), ..Default::default() };
        assert_eq!(disabled.root(Some("prd"), "orders"), None);

        let explicit = DatapoolSettings { path: "/srv/pool".into(), ..Default::default() };
        assert_eq!(explicit.root(Some("prd"), "orders"), Some(PathBuf::from("/srv/pool")));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.yaml");
        std::fs::write(&path, "channel_capacity: 64\n").unwrap();
        assert_eq!(Settings::load(&path).unwrap().channel_capacity, 64);
        assert!(matches!(Settings::load(dir.path().join("missing.yaml")), Err(ConfigError::Io(_))));
    }
}

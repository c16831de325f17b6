use serde::Deserialize;
use tracebus::error::ConfigError;

pub const DEFAULT_PREFIX: &str = "monitor";
pub const DEFAULT_QUEUE_GROUP: &str = "monitor-adaptor";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NatsSettings {
    pub url: String,
    /// Subjects are `<prefix>.tracing`, `<prefix>.error` and `<prefix>.schedule`.
    pub prefix: String,
    /// Adaptor instances sharing a group split the stream between them.
    pub queue_group: String,
}

impl Default for NatsSettings {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".into(),
            prefix: DEFAULT_PREFIX.into(),
            queue_group: DEFAULT_QUEUE_GROUP.into(),
        }
    }
}

impl NatsSettings {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_yaml::from_str(text)
            .map_err(|e| ConfigError::Invalid { key: "nats", reason: e.to_string() })?;
        if settings.prefix.is_empty() || settings.prefix.contains(['*', '>', ' ']) {
            return Err(ConfigError::Invalid { key: "prefix", reason: format!("`{}` is not a subject token", settings.prefix) });
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_keys() {
        let settings = NatsSettings::from_yaml_str("url: nats://bus:4222").unwrap();
        assert_eq!(settings.url, "nats://bus:4222");
        assert_eq!(settings.prefix, "monitor");
        assert_eq!(settings.queue_group, "monitor-adaptor");
    }

    #[test]
    fn wildcard_prefix_is_rejected() {
        assert!(NatsSettings::from_yaml_str("prefix: monitor.*").is_err());
    }
}

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracebus::error::ConfigError;
use tracebus::filter::FilterRule;

/// Largest log line pushed, in bytes.
pub const DEFAULT_MAX_LINE_BYTES: usize = 262_144;
/// Room for the truncation marker object a line falls back to.
pub const MIN_MAX_LINE_BYTES: usize = 64;

/// Push transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// JSON over `POST /loki/api/v1/push`.
    #[default]
    Http,
    /// Protobuf over `logproto.Pusher/Push`.
    Grpc,
}

impl Protocol {
    pub fn alternate(self) -> Self {
        match self {
            Protocol::Http => Protocol::Grpc,
            Protocol::Grpc => Protocol::Http,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Grpc => "grpc",
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" | "rest" | "" => Ok(Protocol::Http),
            "grpc" => Ok(Protocol::Grpc),
            other => Err(ConfigError::UnsupportedProtocol(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LokiSettings {
    pub url: String,
    pub protocol: Protocol,
    pub user: String,
    pub password: String,
    /// Budget for a single push attempt.
    pub timeout_ms: u64,
    pub max_attempts: usize,
    /// First retry delay; doubles per attempt up to `max_backoff_ms`.
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_line_bytes: usize,
    /// Trace filter for this sink only; empty means the hub's default applies.
    pub filter: FilterRule,
}

impl Default for LokiSettings {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:3100".into(),
            protocol: Protocol::Http,
            user: String::new(),
            password: String::new(),
            timeout_ms: 2_000,
            max_attempts: 3,
            backoff_ms: 100,
            max_backoff_ms: 400,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            filter: FilterRule::default(),
        }
    }
}

impl LokiSettings {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn has_credentials(&self) -> bool {
        !self.user.is_empty() || !self.password.is_empty()
    }

    /// `Basic <base64(user:password)>`, when credentials are set.
    pub fn basic_auth(&self) -> Option<String> {
        use base64::Engine as _;
        self.has_credentials().then(|| {
            let token = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", self.user, self.password));
            format!("Basic {token}")
        })
    }
}

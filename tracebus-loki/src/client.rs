//! Push transports and protocol selection.

use crate::labels::LabelSet;
use crate::proto::{EntryAdapter, PushRequest, PushResponse, StreamAdapter, PUSH_PATH};
use crate::settings::{LokiSettings, Protocol};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tonic::metadata::{Ascii, MetadataValue};
use tracebus::error::{ConfigError, SinkError};

/// Sends one log line with its labels.
#[async_trait]
pub trait PushClient: Send + Sync + 'static {
    fn protocol(&self) -> Protocol;

    async fn push(&self, labels: &LabelSet, line: &str) -> Result<(), SinkError>;
}

/// Build a client for the preferred protocol, falling back to the other one.
pub fn connect(settings: &LokiSettings) -> Result<Arc<dyn PushClient>, ConfigError> {
    let preferred = settings.protocol;
    let first = match build(preferred, settings) {
        Ok(client) => return Ok(client),
        Err(error) => error,
    };
    let alternate = preferred.alternate();
    tracing::warn!(
        preferred = preferred.as_str(),
        fallback = alternate.as_str(),
        error = %first,
        "loki client unavailable; trying fallback protocol"
    );
    match build(alternate, settings) {
        Ok(client) => Ok(client),
        Err(second) => Err(ConfigError::Client(format!(
            "{}: {first}; {}: {second}",
            preferred.as_str(),
            alternate.as_str()
        ))),
    }
}

fn build(protocol: Protocol, settings: &LokiSettings) -> Result<Arc<dyn PushClient>, ConfigError> {
    Ok(match protocol {
        Protocol::Http => Arc::new(HttpPushClient::new(settings)?),
        Protocol::Grpc => Arc::new(GrpcPushClient::new(settings)?),
    })
}

fn unix_nanos() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or_default()
}

/// JSON push to `<url>/loki/api/v1/push`.
#[derive(Debug, Clone)]
pub struct HttpPushClient {
    client: reqwest::Client,
    endpoint: reqwest::Url,
    auth: Option<String>,
}

impl HttpPushClient {
    pub fn new(settings: &LokiSettings) -> Result<Self, ConfigError> {
        let raw = format!("{}/loki/api/v1/push", settings.url.trim_end_matches('/'));
        let endpoint = reqwest::Url::parse(&raw).map_err(|_| ConfigError::InvalidUrl(settings.url.clone()))?;
        if !matches!(endpoint.scheme(), "http" | "https") || endpoint.host_str().is_none() {
            return Err(ConfigError::InvalidUrl(settings.url.clone()));
        }
        let client = reqwest::Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| ConfigError::Client(e.to_string()))?;
        Ok(Self { client, endpoint, auth: settings.basic_auth() })
    }

    pub fn endpoint(&self) -> &reqwest::Url {
        &self.endpoint
    }
}

#[async_trait]
impl PushClient for HttpPushClient {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    async fn push(&self, labels: &LabelSet, line: &str) -> Result<(), SinkError> {
        let body = serde_json::json!({
            "streams": [{
                "stream": labels.as_map(),
                "values": [[unix_nanos().to_string(), line]],
            }]
        });
        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(auth) = &self.auth {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }
        let response = request.send().await.map_err(SinkError::transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SinkError::Status { status: status.as_u16(), body })
    }
}

/// Protobuf push over a lazily connected gRPC channel.
#[derive(Debug, Clone)]
pub struct GrpcPushClient {
    channel: tonic::transport::Channel,
    auth: Option<MetadataValue<Ascii>>,
}

impl GrpcPushClient {
    /// The channel connects on first use, so this fails only on bad settings.
    /// Must run inside a tokio runtime.
    pub fn new(settings: &LokiSettings) -> Result<Self, ConfigError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ConfigError::Client("grpc client requires a tokio runtime".into()));
        }
        let address = if settings.url.contains("://") {
            settings.url.clone()
        } else {
            format!("http://{}", settings.url)
        };
        let endpoint = tonic::transport::Endpoint::from_shared(address)
            .map_err(|_| ConfigError::InvalidUrl(settings.url.clone()))?
            .timeout(settings.timeout())
            .connect_timeout(settings.timeout());
        let auth = settings
            .basic_auth()
            .map(|value| value.parse::<MetadataValue<Ascii>>())
            .transpose()
            .map_err(|e| ConfigError::Client(format!("invalid credentials: {e}")))?;
        Ok(Self { channel: endpoint.connect_lazy(), auth })
    }
}

#[async_trait]
impl PushClient for GrpcPushClient {
    fn protocol(&self) -> Protocol {
        Protocol::Grpc
    }

    async fn push(&self, labels: &LabelSet, line: &str) -> Result<(), SinkError> {
        let message = PushRequest {
            streams: vec![StreamAdapter {
                labels: labels.to_string(),
                entries: vec![EntryAdapter {
                    timestamp: Some(prost_types::Timestamp::from(SystemTime::now())),
                    line: line.to_string(),
                }],
                hash: 0,
            }],
        };
        let mut request = tonic::Request::new(message);
        if let Some(auth) = &self.auth {
            request.metadata_mut().insert("authorization", auth.clone());
        }

        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await.map_err(|e| SinkError::transport(format!("grpc channel not ready: {e}")))?;
        let codec = tonic::codec::ProstCodec::<PushRequest, PushResponse>::default();
        grpc.unary(request, http::uri::PathAndQuery::from_static(PUSH_PATH), codec)
            .await
            .map(|_| ())
            .map_err(|status| SinkError::transport(format!("grpc push failed: {status}")))
    }
}

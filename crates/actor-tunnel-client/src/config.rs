//! Client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::reconnect::ReconnectConfig;

/// Tunnel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Full `ws://` or `wss://` URL of the gateway's tunnel endpoint
    pub url: String,
    pub reconnect: ReconnectConfig,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Unacknowledged messages older than this fail their request or
    /// WebSocket. `None` disables acknowledgement tracking.
    #[serde(with = "option_duration_ms")]
    pub ack_timeout: Option<Duration>,
    /// How often unacknowledged messages are swept
    #[serde(with = "duration_ms")]
    pub gc_interval: Duration,
}

/// Helper module for serializing Duration as milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

pub(crate) mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            reconnect: ReconnectConfig::default(),
            connect_timeout: Duration::from_secs(30),
            ack_timeout: None,
            gc_interval: Duration::from_secs(60),
        }
    }
}

impl TunnelConfig {
    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::default()
    }
}

/// Builder for TunnelConfig
#[derive(Default)]
pub struct TunnelConfigBuilder {
    config: TunnelConfig,
    endpoint: Option<String>,
    namespace: Option<String>,
    runner_id: Option<String>,
}

impl TunnelConfigBuilder {
    /// Use a complete tunnel URL as-is
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Gateway base endpoint; the tunnel URL is derived from it
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn runner_id(mut self, runner_id: impl Into<String>) -> Self {
        self.runner_id = Some(runner_id.into());
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn ack_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.ack_timeout = timeout;
        self
    }

    pub fn gc_interval(mut self, interval: Duration) -> Self {
        self.config.gc_interval = interval;
        self
    }

    pub fn build(mut self) -> Result<TunnelConfig, String> {
        if let Some(endpoint) = self.endpoint.take() {
            self.config.url = tunnel_url(
                &endpoint,
                self.namespace.as_deref(),
                self.runner_id.as_deref(),
            )?;
        }

        if self.config.url.is_empty() {
            return Err("either url or endpoint is required".to_string());
        }

        let url = Url::parse(&self.config.url)
            .map_err(|e| format!("invalid tunnel url {}: {}", self.config.url, e))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(format!(
                "tunnel url must use ws:// or wss://, got {}://",
                url.scheme()
            ));
        }

        if self.config.reconnect.multiplier < 1.0 {
            return Err("reconnect multiplier must be at least 1.0".to_string());
        }
        if self.config.gc_interval.is_zero() {
            return Err("gc_interval must be non-zero".to_string());
        }

        Ok(self.config)
    }
}

/// `{endpoint}/tunnel?namespace=..&runner_id=..`
fn tunnel_url(
    endpoint: &str,
    namespace: Option<&str>,
    runner_id: Option<&str>,
) -> Result<String, String> {
    let mut url =
        Url::parse(endpoint).map_err(|e| format!("invalid endpoint {}: {}", endpoint, e))?;

    match url.scheme() {
        "http" => url.set_scheme("ws"),
        "https" => url.set_scheme("wss"),
        _ => Ok(()),
    }
    .map_err(|_| format!("cannot derive websocket url from {}", endpoint))?;

    let path = format!("{}/tunnel", url.path().trim_end_matches('/'));
    url.set_path(&path);

    {
        let mut query = url.query_pairs_mut();
        if let Some(namespace) = namespace {
            query.append_pair("namespace", namespace);
        }
        if let Some(runner_id) = runner_id {
            query.append_pair("runner_id", runner_id);
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }

    Ok(url.into())
}

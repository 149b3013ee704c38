//! ICE server configuration and its optional dynamic source.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_millis(3000);
const DEFAULT_TEMPLATE: &str = "local";
const OPEN_RELAY_PREFIX: &str = "openrelay";
const OPEN_RELAY_STUN: &str = "stun:openrelay.metered.ca:80";
const OPEN_RELAY_CREDENTIAL: &str = "openrelayproject";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    All,
    Relay,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(url: impl Into<String>, username: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceConfiguration {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_transport_policy: Option<IceTransportPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_candidate_pool_size: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifetime_duration: Option<String>,
}

impl Default for IceConfiguration {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun("stun:turn2.l.google.com")],
            ice_transport_policy: None,
            ice_candidate_pool_size: Some(10),
            block_status: None,
            lifetime_duration: None,
        }
    }
}

impl IceConfiguration {
    /// No traversal servers at all: host candidates only.
    pub fn direct() -> Self {
        Self {
            ice_servers: Vec::new(),
            ice_candidate_pool_size: None,
            ..Self::default()
        }
    }

    /// Relay-only configuration on the public openrelay servers. Unknown
    /// subtemplates keep just the STUN entry.
    pub fn open_relay(subtemplate: &str) -> Self {
        let mut ice_servers = vec![IceServer::stun(OPEN_RELAY_STUN)];
        let relay = match subtemplate {
            "turn-udp" => Some("turn:openrelay.metered.ca:80"),
            "turn-ssl" => Some("turn:openrelay.metered.ca:443"),
            "turn-tcp" => Some("turn:openrelay.metered.ca:80?transport=tcp"),
            "turn-ssl-tcp" => Some("turn:openrelay.metered.ca:443?transport=tcp"),
            _ => None,
        };
        if let Some(url) = relay {
            ice_servers.push(IceServer::turn(url, OPEN_RELAY_CREDENTIAL, OPEN_RELAY_CREDENTIAL));
        }
        Self {
            ice_servers,
            ice_transport_policy: Some(IceTransportPolicy::Relay),
            ice_candidate_pool_size: None,
            block_status: Some("NOT_BLOCKED".into()),
            lifetime_duration: None,
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Urls {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Urls::deserialize(deserializer)? {
        Urls::One(url) => vec![url],
        Urls::Many(urls) => urls,
    })
}

#[derive(Debug, Error)]
pub enum ConfigFetchError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid configuration body: {0}")]
    Decode(String),
}

/// Body of the config fetch. The config service reads the template from
/// `ice_config_preference`, not a bare `preference` key.
#[derive(Debug, Serialize)]
struct ConfigRequest<'a> {
    ice_config_preference: &'a str,
}

/// Resolves an [`IceConfiguration`] for a template name. Never fails: every
/// problem ends in the built-in default.
#[derive(Debug, Clone)]
pub struct IceConfigLoader {
    client: Client,
    url: Option<Url>,
    timeout: Duration,
}

impl Default for IceConfigLoader {
    fn default() -> Self {
        Self::new(None, DEFAULT_FETCH_TIMEOUT)
    }
}

impl IceConfigLoader {
    pub fn new(url: Option<Url>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            url,
            timeout,
        }
    }

    pub async fn load(&self, template: Option<&str>) -> IceConfiguration {
        let template = template.map(str::trim).filter(|value| !value.is_empty());
        if let Some(template) = template.filter(|name| name.starts_with(OPEN_RELAY_PREFIX)) {
            let subtemplate = template
                .strip_prefix(OPEN_RELAY_PREFIX)
                .map(|rest| rest.trim_start_matches('-'))
                .unwrap_or_default();
            info!(template, "returning openrelay config");
            return IceConfiguration::open_relay(subtemplate);
        }

        let template = template.unwrap_or(DEFAULT_TEMPLATE);
        let Some(url) = &self.url else {
            debug!(template, "no ICE configuration endpoint; using default");
            return IceConfiguration::default();
        };

        info!(template, url = %url, "fetching ICE config");
        match self.fetch(url, template).await {
            Ok(config) => {
                info!(servers = config.ice_servers.len(), "fetched ICE config");
                config
            }
            Err(err) => {
                warn!(template, error = %err, "ICE config fetch failed; using default");
                IceConfiguration::default()
            }
        }
    }

    async fn fetch(&self, url: &Url, template: &str) -> Result<IceConfiguration, ConfigFetchError> {
        let request = async {
            let response = self
                .client
                .post(url.clone())
                .json(&ConfigRequest {
                    ice_config_preference: template,
                })
                .send()
                .await
                .map_err(|err| ConfigFetchError::Request(err.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(ConfigFetchError::Status(status.as_u16()));
            }
            response
                .json::<IceConfiguration>()
                .await
                .map_err(|err| ConfigFetchError::Decode(err.to_string()))
        };
        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| ConfigFetchError::Timeout(self.timeout))?
    }
}

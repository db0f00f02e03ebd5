//! ICE server discovery.
//!
//! Servers come from an HTTP endpoint returning `{"iceServers": [...]}` in
//! the browser `RTCIceServer` shape. A public STUN server is always appended
//! so peers on open networks connect even when discovery fails.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};
use voxmesh_common::VoiceError;

pub const FALLBACK_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Accepts a single URL string or an array, as browsers do.
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
}

impl fmt::Debug for IceServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IceServer")
            .field("urls", &self.urls)
            .field("username", &self.username)
            .field("credential", &self.credential.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IceServersResponse {
    #[serde(default)]
    ice_servers: Vec<IceServer>,
}

#[async_trait]
pub trait IceServerProvider: Send + Sync {
    async fn fetch(&self) -> Result<Vec<IceServer>, VoiceError>;
}

/// Fetches servers from an HTTP endpoint.
pub struct HttpIceServerProvider {
    http: reqwest::Client,
    url: String,
    bearer: Option<String>,
}

impl HttpIceServerProvider {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, VoiceError> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| VoiceError::IceServers(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            url: url.into(),
            bearer: None,
        })
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }
}

#[async_trait]
impl IceServerProvider for HttpIceServerProvider {
    async fn fetch(&self) -> Result<Vec<IceServer>, VoiceError> {
        let mut request = self.http.get(&self.url);
        if let Some(token) = &self.bearer {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| VoiceError::IceServers(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let text = text.chars().take(200).collect::<String>();
            return Err(VoiceError::IceServers(format!("HTTP {status}: {text}")));
        }

        let body: IceServersResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::IceServers(format!("unexpected response: {e}")))?;
        debug!(count = body.ice_servers.len(), "fetched ice servers");
        Ok(body.ice_servers)
    }
}

/// A fixed server list.
#[derive(Debug, Clone, Default)]
pub struct StaticIceServers(pub Vec<IceServer>);

#[async_trait]
impl IceServerProvider for StaticIceServers {
    async fn fetch(&self) -> Result<Vec<IceServer>, VoiceError> {
        Ok(self.0.clone())
    }
}

/// Fetch servers and append the fallback STUN server. Discovery failures
/// are logged and leave only the fallback.
pub async fn resolve_ice_servers(
    provider: Option<&dyn IceServerProvider>,
    fallback_stun: &str,
) -> Vec<IceServer> {
    let mut servers = match provider {
        Some(provider) => match provider.fetch().await {
            Ok(servers) => servers,
            Err(e) => {
                warn!(error = %e, "ice server discovery failed; using fallback STUN");
                Vec::new()
            }
        },
        None => Vec::new(),
    };
    servers.retain(|s| !s.urls.is_empty());

    let has_fallback = servers
        .iter()
        .any(|s| s.urls.iter().any(|u| u == fallback_stun));
    if !has_fallback {
        servers.push(IceServer::stun(fallback_stun));
    }
    servers
}

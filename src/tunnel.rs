//! Finding the public URL that forwards to the local webhook listener.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_NGROK_API_URL: &str = "http://127.0.0.1:4040";

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("no tunnel forwards to local port {0}")]
    NotFound(u16),

    #[error("invalid public url: {0}")]
    InvalidUrl(String),
}

#[async_trait]
pub trait Tunnel: Send + Sync {
    async fn public_url(&self, local_port: u16) -> Result<String, TunnelError>;

    fn name(&self) -> &'static str;
}

/// A URL provisioned out of band, e.g. a reserved domain or a reverse proxy.
#[derive(Debug, Clone)]
pub struct StaticTunnel {
    url: String,
}

impl StaticTunnel {
    pub fn new(url: impl Into<String>) -> Result<Self, TunnelError> {
        let url = url.into().trim().trim_end_matches('/').to_string();
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(TunnelError::InvalidUrl(url));
        }
        Ok(Self { url })
    }
}

#[async_trait]
impl Tunnel for StaticTunnel {
    async fn public_url(&self, _local_port: u16) -> Result<String, TunnelError> {
        Ok(self.url.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Asks a running ngrok agent which public URL forwards to the listener.
#[derive(Debug, Clone)]
pub struct NgrokAgentTunnel {
    client: Client,
    api_url: String,
}

#[derive(Debug, Deserialize)]
struct TunnelList {
    #[serde(default)]
    tunnels: Vec<AgentTunnel>,
}

#[derive(Debug, Deserialize)]
struct AgentTunnel {
    public_url: String,
    #[serde(default)]
    proto: String,
    config: Option<AgentTunnelConfig>,
}

#[derive(Debug, Deserialize)]
struct AgentTunnelConfig {
    #[serde(default)]
    addr: String,
}

impl NgrokAgentTunnel {
    pub fn new(api_url: impl Into<String>) -> Result<Self, TunnelError> {
        let client = Client::builder().timeout(Duration::from_secs(5)).build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn select(list: TunnelList, local_port: u16) -> Result<String, TunnelError> {
        let port_suffix = format!(":{local_port}");
        let mut candidates: Vec<AgentTunnel> = list
            .tunnels
            .into_iter()
            .filter(|tunnel| {
                tunnel.config.as_ref().map_or(false, |config| {
                    config.addr == local_port.to_string() || config.addr.ends_with(&port_suffix)
                })
            })
            .collect();

        candidates.sort_by_key(|tunnel| tunnel.proto != "https");
        candidates
            .into_iter()
            .next()
            .map(|tunnel| tunnel.public_url.trim_end_matches('/').to_string())
            .ok_or(TunnelError::NotFound(local_port))
    }
}

#[async_trait]
impl Tunnel for NgrokAgentTunnel {
    async fn public_url(&self, local_port: u16) -> Result<String, TunnelError> {
        let list: TunnelList = self
            .client
            .get(format!("{}/api/tunnels", self.api_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let url = Self::select(list, local_port)?;
        tracing::debug!(%url, local_port, "resolved ngrok tunnel");
        Ok(url)
    }

    fn name(&self) -> &'static str {
        "ngrok"
    }
}

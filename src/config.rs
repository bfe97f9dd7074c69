//! Process-wide settings, read once from the environment at startup.

use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use thiserror::Error;

use crate::{
    evaluator::DEFAULT_EVALUATOR_MODEL,
    tunnel::{NgrokAgentTunnel, StaticTunnel, Tunnel, TunnelError, DEFAULT_NGROK_API_URL},
};

pub const DEFAULT_PORT: u16 = 5001;
pub const DEFAULT_WEBHOOK_PORT: u16 = 8765;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Address of the batch API.
    pub host: IpAddr,
    pub port: u16,
    /// Local port of the short-lived webhook listener the tunnel forwards to.
    pub webhook_port: u16,
    /// Fixed public URL for the webhook listener; when unset the ngrok agent is asked.
    pub public_url: Option<String>,
    pub ngrok_api_url: String,
    pub evaluator_model: String,
    pub call_timeout: Duration,
    pub default_voice_id: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            webhook_port: DEFAULT_WEBHOOK_PORT,
            public_url: None,
            ngrok_api_url: DEFAULT_NGROK_API_URL.to_string(),
            evaluator_model: DEFAULT_EVALUATOR_MODEL.to_string(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            default_voice_id: String::new(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|value| value.trim().to_string()).filter(|v| !v.is_empty());
        let mut settings = Settings::default();

        if let Some(host) = get("CALLCHECK_HOST") {
            settings.host = parse("CALLCHECK_HOST", &host)?;
        }
        if let Some(port) = get("CALLCHECK_PORT") {
            settings.port = parse("CALLCHECK_PORT", &port)?;
        }
        if let Some(port) = get("WEBHOOK_PORT") {
            settings.webhook_port = parse("WEBHOOK_PORT", &port)?;
        }
        settings.public_url = get("PUBLIC_URL");
        if let Some(url) = get("NGROK_API_URL") {
            settings.ngrok_api_url = url;
        }
        if let Some(model) = get("EVALUATOR_MODEL") {
            settings.evaluator_model = model;
        }
        if let Some(secs) = get("CALL_TIMEOUT_SECS") {
            let secs: u64 = parse("CALL_TIMEOUT_SECS", &secs)?;
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    key: "CALL_TIMEOUT_SECS",
                    value: "0".into(),
                });
            }
            settings.call_timeout = Duration::from_secs(secs);
        }
        if let Some(voice) = get("DEFAULT_VOICE_ID") {
            settings.default_voice_id = voice;
        }

        Ok(settings)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// The webhook listener binds on all interfaces so the tunnel agent can reach it.
    pub fn webhook_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.webhook_port)
    }

    pub fn tunnel(&self) -> Result<Arc<dyn Tunnel>, TunnelError> {
        match &self.public_url {
            Some(url) => Ok(Arc::new(StaticTunnel::new(url.clone())?)),
            None => Ok(Arc::new(NgrokAgentTunnel::new(self.ngrok_api_url.clone())?)),
        }
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

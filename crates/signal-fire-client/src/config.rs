use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
const DEFAULT_WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    pub fn with_credentials(
        urls: Vec<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls,
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    All,
    Relay,
}

/// Peer connection engine configuration. Every field is optional so that a
/// partial configuration can be layered over another with [`EngineConfig::merge`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_servers: Option<Vec<IceServer>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_transport_policy: Option<IceTransportPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_candidate_pool_size: Option<u8>,
}

impl EngineConfig {
    pub fn with_ice_servers(ice_servers: Vec<IceServer>) -> Self {
        Self {
            ice_servers: Some(ice_servers),
            ..Default::default()
        }
    }

    /// Returns `self` overlaid with every field `overrides` sets.
    pub fn merge(&self, overrides: &EngineConfig) -> EngineConfig {
        EngineConfig {
            ice_servers: overrides
                .ice_servers
                .clone()
                .or_else(|| self.ice_servers.clone()),
            ice_transport_policy: overrides.ice_transport_policy.or(self.ice_transport_policy),
            ice_candidate_pool_size: overrides
                .ice_candidate_pool_size
                .or(self.ice_candidate_pool_size),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Engine defaults applied to every peer connection
    pub engine: EngineConfig,
    /// Upper bound for a request's response; `None` waits indefinitely
    pub request_timeout: Option<Duration>,
    /// How long `connect` waits for the server's welcome
    pub welcome_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::with_ice_servers(vec![IceServer::new(DEFAULT_STUN_SERVER)]),
            request_timeout: None,
            welcome_timeout: DEFAULT_WELCOME_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if env::var("SIGNAL_FIRE_LOCALHOST_ONLY").is_ok() {
            config.engine.ice_servers = Some(Vec::new());
        }
        if let Some(ms) = env_millis("SIGNAL_FIRE_REQUEST_TIMEOUT_MS") {
            config.request_timeout = Some(ms);
        }
        if let Some(ms) = env_millis("SIGNAL_FIRE_WELCOME_TIMEOUT_MS") {
            config.welcome_timeout = ms;
        }
        config
    }

    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

fn env_millis(var: &str) -> Option<Duration> {
    let value = env::var(var).ok()?;
    match value.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
        _ => {
            warn!(var, value = %value, "ignoring invalid millisecond value");
            None
        }
    }
}

#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    ice_servers: Vec<IceServer>,
    ice_transport_policy: Option<IceTransportPolicy>,
    request_timeout: Option<Duration>,
    welcome_timeout: Option<Duration>,
    localhost_only: bool,
}

impl ClientConfigBuilder {
    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(IceServer {
            urls,
            ..Default::default()
        });
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers
            .push(IceServer::with_credentials(urls, username, credential));
        self
    }

    pub fn ice_transport_policy(mut self, policy: IceTransportPolicy) -> Self {
        self.ice_transport_policy = Some(policy);
        self
    }

    /// No STUN/TURN servers at all
    pub fn localhost_only(mut self) -> Self {
        self.localhost_only = true;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn welcome_timeout(mut self, timeout: Duration) -> Self {
        self.welcome_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> ClientConfig {
        let mut config = ClientConfig::default();
        if self.localhost_only {
            config.engine.ice_servers = Some(Vec::new());
        } else if !self.ice_servers.is_empty() {
            config.engine.ice_servers = Some(self.ice_servers);
        }
        config.engine.ice_transport_policy = self.ice_transport_policy;
        config.request_timeout = self.request_timeout;
        if let Some(timeout) = self.welcome_timeout {
            config.welcome_timeout = timeout;
        }
        config
    }
}

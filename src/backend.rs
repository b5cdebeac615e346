use crate::config::{AgentConfig, BackendConfig};
use crate::lock::LockStatusSource;
use crate::media::ice::IceServer;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{error, info};

const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// HTTP client for the agent backend: agent settings, ICE servers and the
/// agent's lock status.
#[derive(Clone)]
pub struct BackendClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl BackendClient {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let timeout = config.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            client,
        })
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.endpoint(path);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("{} returned {}", url, response.status()));
        }
        Ok(response.json::<T>().await?)
    }

    pub async fn fetch_agent_config(&self) -> Result<AgentConfig> {
        let agent = self.get_json::<AgentConfig>("api/agent/config").await?;
        info!(extension = ?agent.extension, "agent config fetched from backend");
        Ok(agent)
    }

    /// `None` when the backend could not supply a list; the caller keeps its
    /// static servers.
    pub async fn fetch_ice_servers(&self) -> Option<Vec<IceServer>> {
        let start_time = Instant::now();
        match self.get_json::<Vec<IceServer>>("api/iceservers").await {
            Ok(servers) => {
                info!(
                    count = servers.len(),
                    duration = ?start_time.elapsed(),
                    "ice servers fetched from backend"
                );
                Some(servers)
            }
            Err(e) => {
                error!("failed to fetch ice servers, using static config: {}", e);
                None
            }
        }
    }

    /// Accepts either a bare boolean or `{"locked": bool}`.
    pub async fn fetch_lock_status(&self) -> Result<bool> {
        match self.get_json::<Value>("api/agent/lock").await? {
            Value::Bool(locked) => Ok(locked),
            Value::Object(map) => map
                .get("locked")
                .and_then(Value::as_bool)
                .ok_or_else(|| anyhow!("lock status without a locked flag")),
            other => Err(anyhow!("unexpected lock status: {}", other)),
        }
    }
}

#[async_trait]
impl LockStatusSource for BackendClient {
    async fn is_locked(&self) -> Result<bool> {
        self.fetch_lock_status().await
    }
}

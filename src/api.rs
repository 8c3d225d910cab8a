//! Pull client for the slow-changing resources: agents, channels, status and
//! channel history.
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::events::TimelineItem;

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub context_window: Option<u64>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub max_concurrent_branches: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Same value as `LiveEvent::channel_id`
    pub id: String,
    pub agent_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

impl ChannelInfo {
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentsResponse {
    pub agents: Vec<Agent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsResponse {
    pub channels: Vec<ChannelInfo>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusResponse {
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryResponse {
    pub items: Vec<TimelineItem>,
    #[serde(default)]
    pub has_more: bool,
}

// ── Client ────────────────────────────────────────────────────────────────────

pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let mut req = self.client.get(&url);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        parse_response(resp).await
    }

    pub async fn agents(&self) -> Result<Vec<Agent>> {
        let resp: AgentsResponse = self.get("/agents").await?;
        Ok(resp.agents)
    }

    pub async fn channels(&self) -> Result<Vec<ChannelInfo>> {
        let resp: ChannelsResponse = self.get("/channels").await?;
        Ok(resp.channels)
    }

    pub async fn status(&self) -> Result<StatusResponse> {
        self.get("/status").await
    }

    /// Most recent timeline entries of one channel, oldest first.
    pub async fn channel_history(&self, channel_id: &str, limit: usize) -> Result<HistoryResponse> {
        self.get(&history_path(channel_id, limit)).await
    }
}

fn history_path(channel_id: &str, limit: usize) -> String {
    format!(
        "/channels/messages?channel_id={}&limit={limit}",
        urlencoding::encode(channel_id)
    )
}

async fn parse_response<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("{status}: {body}");
    }
    Ok(resp.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = ApiClient::new("http://localhost:19898/", None, Duration::from_secs(5)).unwrap();
        assert_eq!(client.url("/status"), "http://localhost:19898/api/status");
    }

    #[test]
    fn test_history_path_encodes_channel_id() {
        assert_eq!(
            history_path("discord:123/general", 50),
            "/channels/messages?channel_id=discord%3A123%2Fgeneral&limit=50"
        );
    }

    #[test]
    fn test_channels_response_tolerates_missing_optionals() {
        let resp: ChannelsResponse = serde_json::from_str(
            r##"{"channels":[{"id":"c1","agent_id":"main"},{"id":"c2","agent_id":"main","display_name":"#ops","platform":"slack"}]}"##,
        )
        .unwrap();
        assert_eq!(resp.channels[0].label(), "c1");
        assert_eq!(resp.channels[1].label(), "#ops");
        assert_eq!(resp.channels[1].platform.as_deref(), Some("slack"));
    }

    #[test]
    fn test_history_response_parses_mixed_items() {
        let resp: HistoryResponse = serde_json::from_str(
            r#"{"items":[
                {"type":"message","id":"m1","role":"user","content":"hi","created_at":"2025-01-01T00:00:00Z","sender_name":"ada"},
                {"type":"branch_run","id":"b1","description":"think","started_at":"2025-01-01T00:00:01Z","conclusion":null}
            ]}"#,
        )
        .unwrap();
        assert_eq!(resp.items.len(), 2);
        assert!(!resp.has_more);
        assert_eq!(resp.items[1].id(), "b1");
    }

    #[test]
    fn test_agents_response() {
        let resp: AgentsResponse =
            serde_json::from_str(r#"{"agents":[{"id":"main","workspace":"/srv/main","max_turns":5}]}"#).unwrap();
        assert_eq!(resp.agents[0].id, "main");
        assert_eq!(resp.agents[0].max_turns, Some(5));
        assert_eq!(resp.agents[0].context_window, None);
    }
}

//! HTTP access to the station for listeners.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::{ClientError, Result};
use crate::station::SyncResponse;
use crate::track::{Track, TrackPatch};

/// What the reconciliation loop needs from the station.
#[async_trait]
pub trait RadioApi: Send + Sync + 'static {
    /// Authoritative "what is playing now".
    async fn fetch_sync(&self) -> Result<SyncResponse>;

    /// Full ordered playlist.
    async fn fetch_playlist(&self) -> Result<Vec<Track>>;

    /// Report the real decoded length of a track. Only the duration field is
    /// sent, every other field stays as the station has it.
    async fn update_duration(&self, track_id: &str, seconds: f64) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct HttpRadioApi {
    client: Client,
    base_url: String,
}

impl HttpRadioApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("stationsync-listener/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Shares an existing connection pool.
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ClientError::Status { status: status.as_u16(), body })
}

#[async_trait]
impl RadioApi for HttpRadioApi {
    async fn fetch_sync(&self) -> Result<SyncResponse> {
        let resp = self.client.get(self.url("/api/radio/sync")).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn fetch_playlist(&self) -> Result<Vec<Track>> {
        let resp = self.client.get(self.url("/api/songs")).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn update_duration(&self, track_id: &str, seconds: f64) -> Result<()> {
        let resp = self
            .client
            .put(self.url(&format!("/api/songs/{track_id}")))
            .json(&TrackPatch::duration_only(seconds))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }
}

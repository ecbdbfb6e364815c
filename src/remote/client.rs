//! HTTP client for one stage service.

use super::wire::{
    ErrorBody, HashNext, Hashes, Health, Images, LoadNext, ModifiedImages, ModifyNext, RunStatus,
};
use crate::config::RemoteConfig;
use crate::core::model::{ImageHash, ModifiedImage, SourceImage, StageStatus};
use crate::error::RemoteError;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// Timeouts and connection retry policy shared by every client
#[derive(Debug, Clone, Copy)]
pub struct ClientSettings {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Attempts per request when the connection fails
    pub connect_retries: u32,
    pub retry_delay: Duration,
}

impl ClientSettings {
    pub fn from_config(config: &RemoteConfig) -> Self {
        Self {
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            connect_retries: config.connect_retries.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::from_config(&RemoteConfig::default())
    }
}

/// Client for one stage (`load`, `modify`, `hash`, `match` or `admin`)
#[derive(Debug, Clone)]
pub struct StageClient {
    http: Client,
    base_url: String,
    stage: &'static str,
    settings: ClientSettings,
}

impl StageClient {
    pub fn new(
        stage: &'static str,
        base_url: impl Into<String>,
        settings: ClientSettings,
    ) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .timeout(settings.request_timeout)
            .connect_timeout(settings.connect_timeout)
            .build()
            .map_err(|e| RemoteError::Transport {
                stage: stage.to_string(),
                reason: format!("Failed to create HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            stage,
            settings,
        })
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.stage, endpoint)
    }

    fn transport(&self, error: &reqwest::Error) -> RemoteError {
        RemoteError::Transport {
            stage: self.stage.to_string(),
            reason: error.to_string(),
        }
    }

    /// Send one request, retrying connection failures with a fixed delay
    async fn send(
        &self,
        request: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, RemoteError> {
        let mut attempt = 1;
        loop {
            match request().send().await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connect() && attempt < self.settings.connect_retries => {
                    tracing::warn!(
                        stage = self.stage,
                        attempt,
                        retry_after_ms = self.settings.retry_delay.as_millis() as u64,
                        error = %e,
                        "Connection failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.settings.retry_delay).await;
                }
                Err(e) => return Err(self.transport(&e)),
            }
        }
    }

    async fn decode<R: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<R, RemoteError> {
        let status = response.status();
        if !status.is_success() {
            if let Ok(body) = response.json::<ErrorBody>().await {
                tracing::warn!(
                    stage = self.stage,
                    code = %body.error.code,
                    message = %body.error.message,
                    "Stage returned an error"
                );
            }
            return Err(RemoteError::Status {
                stage: self.stage.to_string(),
                status: status.as_u16(),
            });
        }

        response.json::<R>().await.map_err(|e| RemoteError::Decode {
            stage: self.stage.to_string(),
            reason: e.to_string(),
        })
    }

    async fn post<B, R>(&self, endpoint: &str, body: &B) -> Result<R, RemoteError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.url(endpoint);
        let response = self.send(|| self.http.post(&url).json(body)).await?;
        self.decode(response).await
    }

    /// One `GET /<stage>/health` attempt. A malformed body is an error.
    pub async fn health(&self) -> Result<Health, RemoteError> {
        let response = self
            .http
            .get(self.url("health"))
            .send()
            .await
            .map_err(|e| self.transport(&e))?;
        self.decode(response).await
    }

    pub async fn load_next(&self, limit: usize) -> Result<Vec<SourceImage>, RemoteError> {
        let page: Images = self.post("next", &LoadNext { limit }).await?;
        Ok(page.images)
    }

    pub async fn modify_next(
        &self,
        image: &SourceImage,
        limit: usize,
    ) -> Result<Vec<ModifiedImage>, RemoteError> {
        let request = ModifyNext {
            image: image.clone(),
            limit,
        };
        let page: ModifiedImages = self.post("next", &request).await?;
        Ok(page.modified_images)
    }

    pub async fn hash_next(
        &self,
        modified_image: &ModifiedImage,
        limit: usize,
    ) -> Result<Vec<ImageHash>, RemoteError> {
        let request = HashNext {
            modified_image: modified_image.clone(),
            limit,
        };
        let page: Hashes = self.post("next", &request).await?;
        Ok(page.hashes)
    }

    /// `POST /<stage>/start`
    pub async fn start(&self) -> Result<StageStatus, RemoteError> {
        self.post("start", &serde_json::json!({})).await
    }

    /// `POST /<stage>/status`
    pub async fn status(&self) -> Result<StageStatus, RemoteError> {
        self.post("status", &serde_json::json!({})).await
    }

    /// `POST /admin/status` on an orchestrator service
    pub async fn run_status(&self) -> Result<RunStatus, RemoteError> {
        self.post("status", &serde_json::json!({})).await
    }

    /// `POST /admin/start/<target>` on an orchestrator service
    pub async fn start_run(&self, target: &str) -> Result<RunStatus, RemoteError> {
        self.post(&format!("start/{target}"), &serde_json::json!({}))
            .await
    }
}

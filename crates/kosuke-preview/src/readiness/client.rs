//! Client for the preview status/start/health endpoints.

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use std::time::Duration;

use super::error::{ReadinessError, ReadinessResult};
use crate::preview::{HealthBody, PreviewStatusBody, SessionKey};

/// Answer of the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviewProbe {
    Found(PreviewStatusBody),
    /// 404 or 503: nothing started for this session yet.
    NotStarted(u16),
}

/// Minimal preview API abstraction for testability.
#[async_trait]
pub trait PreviewApi: Send + Sync {
    async fn status(&self, key: &SessionKey) -> ReadinessResult<PreviewProbe>;
    async fn start(&self, key: &SessionKey) -> ReadinessResult<PreviewStatusBody>;
    /// Any non-2xx answer or malformed body is an error; 404 is
    /// [`ReadinessError::SessionGone`].
    async fn health(&self, key: &SessionKey) -> ReadinessResult<HealthBody>;
}

/// HTTP client for a preview server.
#[derive(Debug, Clone)]
pub struct HttpPreviewApi {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpPreviewApi {
    pub fn new(base_url: &str, timeout: Duration) -> ReadinessResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ReadinessError::Unavailable(format!("invalid url {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ReadinessError::Unavailable(format!(
                "{} cannot be used as a base url",
                base_url
            )));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `<base>/api/projects/{project}/chat-sessions/{session}/preview[/health]`
    fn preview_url(&self, key: &SessionKey, health: bool) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend([
                "api",
                "projects",
                key.project_id.as_str(),
                "chat-sessions",
                key.session_id.as_str(),
                "preview",
            ]);
            if health {
                segments.push("health");
            }
        }
        url
    }
}

#[async_trait]
impl PreviewApi for HttpPreviewApi {
    async fn status(&self, key: &SessionKey) -> ReadinessResult<PreviewProbe> {
        let res = self.client.get(self.preview_url(key, false)).send().await?;
        let status = res.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::SERVICE_UNAVAILABLE {
            return Ok(PreviewProbe::NotStarted(status.as_u16()));
        }
        if !status.is_success() {
            return Err(ReadinessError::Unavailable(format!(
                "status request returned {}",
                status
            )));
        }
        Ok(PreviewProbe::Found(res.json().await?))
    }

    async fn start(&self, key: &SessionKey) -> ReadinessResult<PreviewStatusBody> {
        let res = self
            .client
            .post(self.preview_url(key, false))
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(ReadinessError::StartFailed(format!("{}: {}", status, body)));
        }
        Ok(res.json().await?)
    }

    async fn health(&self, key: &SessionKey) -> ReadinessResult<HealthBody> {
        let res = self.client.get(self.preview_url(key, true)).send().await?;
        let status = res.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ReadinessError::SessionGone(key.to_string()));
        }
        if !status.is_success() {
            return Err(ReadinessError::Unavailable(format!(
                "health request returned {}",
                status
            )));
        }
        Ok(res.json().await?)
    }
}

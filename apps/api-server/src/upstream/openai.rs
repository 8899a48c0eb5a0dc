//! Forwarding client for a real OpenAI-compatible upstream.

use std::time::Duration;

use async_trait::async_trait;

use tollgate_shared::chat::{ChatCompletionRequest, ChatCompletionResponse};

use super::{Upstream, UpstreamError};

const CONNECT_TIMEOUT_SECS: u64 = 10;

pub struct OpenAiUpstream {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiUpstream {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| UpstreamError::ClientBuild(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl Upstream for OpenAiUpstream {
    async fn chat(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, UpstreamError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut builder = self.http.post(&url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| UpstreamError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|e| UpstreamError::Parse(e.to_string()))
    }
}

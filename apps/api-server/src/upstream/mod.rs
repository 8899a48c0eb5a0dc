//! The model upstream: whoever actually answers an admitted request.

mod mock;
mod openai;

pub use mock::MockUpstream;
pub use openai::OpenAiUpstream;

use async_trait::async_trait;

use tollgate_shared::chat::{ChatCompletionRequest, ChatCompletionResponse};

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("upstream returned status {status}")]
    Status { status: u16, body: String },

    #[error("response parse failed: {0}")]
    Parse(String),

    #[error("client build failed: {0}")]
    ClientBuild(String),
}

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn chat(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, UpstreamError>;
}

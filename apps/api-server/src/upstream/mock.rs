//! Mock responder.
//!
//! Answers admitted requests with an OpenAI-shaped completion after a short
//! randomized delay, so a cluster can be load-tested without spending real
//! model capacity. Usage is computed with the same estimator the admission
//! path uses.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use tollgate_core::estimator::TokenEstimator;
use tollgate_shared::chat::{ChatCompletionRequest, ChatCompletionResponse, Usage};

use crate::config::MockConfig;

use super::{Upstream, UpstreamError};

const TEMPLATES: [&str; 5] = [
    "This is a mock response. Your request has been successfully processed.",
    "I understand your request. This is a system-generated test response.",
    "Processing complete. This is a mock response from the rate limiter system.",
    "Message received and acknowledged by the mock backend.",
    "This is an auto-generated response for testing rate limiting functionality.",
];

pub struct MockUpstream {
    estimator: TokenEstimator,
    config: MockConfig,
}

impl MockUpstream {
    pub fn new(estimator: TokenEstimator, config: MockConfig) -> Self {
        Self { estimator, config }
    }

    fn compose_content(&self, request: &ChatCompletionRequest, template: usize) -> String {
        let mut content = TEMPLATES[template % TEMPLATES.len()].to_string();
        // Longer max_tokens requests get padded content, approximating a
        // completion that actually used the budget.
        if let Some(max_tokens) = request.max_tokens {
            if max_tokens > 50 {
                let filler = " This is additional content to fill the response.";
                content.push_str(&filler.repeat((max_tokens / 20) as usize));
            }
        }
        content
    }
}

#[async_trait]
impl Upstream for MockUpstream {
    async fn chat(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, UpstreamError> {
        // Draw before the await: the rng is not Send.
        let (delay_ms, template) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(self.config.delay_min_ms..=self.config.delay_max_ms),
                rng.gen_range(0..TEMPLATES.len()),
            )
        };
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;

        let content = self.compose_content(request, template);
        let prompt_tokens = self.estimator.estimate_prompt(request);
        let completion_tokens = self.estimator.count(&content);

        let mut response = ChatCompletionResponse::assistant(
            request.model.clone(),
            content,
            Usage::new(prompt_tokens, completion_tokens),
        );
        response.system_fingerprint = Some("fp_mock".to_string());
        Ok(response)
    }
}

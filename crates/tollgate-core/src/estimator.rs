//! Token estimation and usage measurement.
//!
//! Estimation runs before admission and must be deterministic: the same
//! request always prices to the same prompt-token count. Counting uses the
//! `cl100k_base` byte-pair vocabulary plus the per-message framing overhead
//! the upstream accounts for.

use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

use tollgate_shared::chat::{ChatCompletionRequest, ChatCompletionResponse};

/// Framing overhead the upstream charges per message.
const MESSAGE_OVERHEAD_TOKENS: u64 = 4;
/// Priming tokens for the assistant reply.
const REPLY_PRIMING_TOKENS: u64 = 2;

static CL100K: OnceLock<CoreBPE> = OnceLock::new();

fn bpe() -> &'static CoreBPE {
    // The vocabulary is compiled into the binary; construction only parses it.
    CL100K.get_or_init(|| tiktoken_rs::cl100k_base().expect("bundled cl100k_base vocabulary"))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenEstimator;

impl TokenEstimator {
    pub fn new() -> Self {
        Self
    }

    /// BPE token count of a piece of text.
    pub fn count(&self, text: &str) -> u64 {
        bpe().encode_ordinary(text).len() as u64
    }

    /// Estimated prompt tokens for a chat request: role + content of every
    /// message, framing overhead per message, reply priming.
    pub fn estimate_prompt(&self, request: &ChatCompletionRequest) -> u64 {
        let messages: u64 = request
            .messages
            .iter()
            .map(|m| self.count(&m.role) + self.count(&m.content) + MESSAGE_OVERHEAD_TOKENS)
            .sum();
        messages + REPLY_PRIMING_TOKENS
    }

    /// Actual (prompt, completion) counts from a completed response. Trusts
    /// the reported usage; counts the generated content only when the
    /// upstream reported nothing.
    pub fn measure_usage(&self, response: &ChatCompletionResponse) -> (u64, u64) {
        let usage = response.usage;
        if usage.prompt_tokens > 0 || usage.completion_tokens > 0 {
            return (usage.prompt_tokens, usage.completion_tokens);
        }
        let completion = response
            .choices
            .iter()
            .map(|c| self.count(&c.message.content))
            .sum();
        (0, completion)
    }
}

//! # Tollgate Shared
//!
//! Wire types shared by the gateway, the core token estimator and the
//! load-test client: the OpenAI-compatible chat-completions DTOs and the
//! OpenAI-shaped error body.

pub mod chat;
pub mod error;

pub use chat::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice, Usage};
pub use error::ErrorBody;

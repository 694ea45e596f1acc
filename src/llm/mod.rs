//! Completion backend integration
//!
//! The agent treats the model as a black box: a transcript plus a system
//! prompt go in, raw reply text comes out. The backend keeps no state
//! between calls; the full transcript is replayed every time.

pub mod ollama;
pub mod scripted;

use async_trait::async_trait;

use crate::lmc::Lmc;

pub use ollama::OllamaBackend;
pub use scripted::{RecordedCall, ScriptedBackend};

/// Transport-level failures. Retries belong to the backend implementation;
/// the agent only propagates these.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode backend reply: {0}")]
    Decode(String),

    #[error("empty response from backend")]
    EmptyResponse,

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Maps a formatted transcript to a raw text reply
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, transcript: &[Lmc], system_prompt: &str) -> Result<String, BackendError>;
}

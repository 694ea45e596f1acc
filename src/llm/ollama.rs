//! Ollama backend for the completion seam
//!
//! The transcript is rendered to timestamped chat lines and sent as a single
//! prompt to `/api/generate`; the system prompt travels in the `system`
//! field. Replies are streamed as newline-delimited JSON and accumulated.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{BackendError, CompletionBackend};
use crate::lmc::{render_chat, Lmc};

/// One streamed line from `/api/generate`
#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    eval_count: u32,
    #[serde(default)]
    prompt_eval_count: u32,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

/// Client for Ollama's HTTP API
#[derive(Clone)]
pub struct OllamaBackend {
    base_url: String,
    model: String,
    temperature: f32,
    client: reqwest::Client,
}

impl OllamaBackend {
    /// Create a new Ollama backend
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the Ollama server (e.g., "http://localhost:11434")
    /// * `model` - The model name (e.g., "llama3.2")
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            temperature: 0.0,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Generate a complete response, accumulating the token stream
    async fn generate(&self, prompt: &str, system: &str) -> Result<String, BackendError> {
        let endpoint = format!("{}/api/generate", self.base_url);

        let response = self
            .client
            .post(&endpoint)
            .json(&GenerateRequest {
                model: &self.model,
                prompt,
                system,
                stream: true,
                options: GenerateOptions {
                    temperature: self.temperature,
                },
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut bytes_stream = response.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();
        let mut full_response = String::new();

        // Chunks do not align with JSON lines, so buffer until a newline
        while let Some(chunk) = bytes_stream.next().await {
            pending.extend_from_slice(&chunk?);
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                if self.absorb_line(&line, &mut full_response)? {
                    return finish(full_response);
                }
            }
        }
        if !pending.is_empty() {
            self.absorb_line(&pending, &mut full_response)?;
        }

        finish(full_response)
    }

    /// Append one NDJSON line's token; returns true on the final chunk
    fn absorb_line(&self, line: &[u8], full_response: &mut String) -> Result<bool, BackendError> {
        let line = trim_ascii(line);
        if line.is_empty() {
            return Ok(false);
        }
        let chunk: GenerateChunk =
            serde_json::from_slice(line).map_err(|e| BackendError::Decode(e.to_string()))?;
        full_response.push_str(&chunk.response);
        if chunk.done {
            debug!(
                model = %self.model,
                eval_count = chunk.eval_count,
                prompt_eval_count = chunk.prompt_eval_count,
                "generation finished"
            );
        }
        Ok(chunk.done)
    }
}

fn finish(full_response: String) -> Result<String, BackendError> {
    if full_response.trim().is_empty() {
        Err(BackendError::EmptyResponse)
    } else {
        Ok(full_response)
    }
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

#[async_trait]
impl CompletionBackend for OllamaBackend {
    async fn complete(&self, transcript: &[Lmc], system_prompt: &str) -> Result<String, BackendError> {
        let prompt = render_chat(transcript, &chrono::Local::now());
        self.generate(&prompt, system_prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let backend = OllamaBackend::new("http://localhost:11434/", "llama3.2");
        assert_eq!(backend.base_url, "http://localhost:11434");
        assert_eq!(backend.model(), "llama3.2");
    }

    #[test]
    fn test_absorb_line_accumulates_tokens() {
        let backend = OllamaBackend::new("http://localhost:11434", "m");
        let mut text = String::new();
        assert!(!backend
            .absorb_line(br#"{"response":"The answer","done":false}"#, &mut text)
            .unwrap());
        assert!(backend
            .absorb_line(b"{\"response\":\" is 4.\",\"done\":true,\"eval_count\":7}\n", &mut text)
            .unwrap());
        assert_eq!(text, "The answer is 4.");
        assert!(!backend.absorb_line(b"  \n", &mut text).unwrap());
    }

    #[test]
    fn test_absorb_line_rejects_garbage() {
        let backend = OllamaBackend::new("http://localhost:11434", "m");
        let mut text = String::new();
        assert!(matches!(
            backend.absorb_line(b"<html>", &mut text),
            Err(BackendError::Decode(_))
        ));
    }

    #[test]
    fn test_blank_reply_is_empty_response() {
        assert!(matches!(finish("  \n".into()), Err(BackendError::EmptyResponse)));
    }

    #[tokio::test]
    #[ignore = "Requires Ollama running on localhost:11434"]
    async fn test_ollama_complete() {
        let backend = OllamaBackend::new("http://localhost:11434", "llama3.2");
        let reply = backend
            .complete(&[Lmc::message(crate::lmc::Role::User, "Say hi")], "Be brief.")
            .await
            .unwrap();
        assert!(!reply.is_empty());
    }
}

//! MindFlow - a local assistant that talks with an LLM and runs the code it
//! writes on the user's own machine
//!
//! # Modules
//!
//! - `lmc` - the uniform conversation unit, its chat-line form and the
//!   response parser
//! - `computer` - executes code units (persistent python, one-shot shells)
//! - `llm` - completion backends (Ollama, scripted for tests)
//! - `search` - prompt classification and web search context
//! - `agent` - the bounded agent loop
//! - `metrics` - Prometheus metrics for observability
//! - `tracing` - console logging with optional OTLP export
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use mindflow::{AgentConfig, AgentController, Computer, OllamaBackend};
//!
//! let backend = Arc::new(OllamaBackend::new("http://localhost:11434", "llama3.2"));
//! let computer = Computer::new("python3", Duration::from_secs(30));
//! let mut agent = AgentController::new(backend, computer, AgentConfig::default());
//! let answer = agent.chat("What is 2+2?").await?;
//! ```

pub mod agent;
pub mod computer;
pub mod llm;
pub mod lmc;
pub mod metrics;
pub mod search;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use agent::{AgentConfig, AgentController, AgentError, AgentResult};
pub use computer::{Computer, ExecutionRecord, ExecutionStatus};
pub use llm::{CompletionBackend, OllamaBackend, ScriptedBackend};
pub use lmc::{Lmc, Role, Transcript, UnitType};

//! Agent module: the talk/act loop over one conversation
//!
//! ```text
//! User message → AgentController ─(search gate)→ browser units
//!                      ↓
//!         CompletionBackend.complete(transcript)
//!                      ↓
//!         parse_response → primary unit
//!                      ↓
//!     code?  → Computer.execute → computer message → loop
//!     message? → final answer
//! ```

pub mod controller;
pub mod prompt;

pub use controller::{AgentConfig, AgentController, AgentError, AgentResult};
pub use prompt::default_system_prompt;

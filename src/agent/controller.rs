//! Agent Controller - the bounded talk/act loop
//!
//! One call to [`AgentController::chat`] handles one user turn:
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            ▼                                              │
//!   AWAITING_RESPONSE ── reply is code ──► execute ──► append output
//!            │                                   (one round)
//!            ├── reply is a message ──► DONE (answer)
//!            └── rounds exhausted ────► FAILED (BudgetExceeded)
//! ```
//!
//! The transcript only ever grows, and the controller is borrowed mutably for
//! the whole turn, so a session never has two executions in flight.

use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::prompt::{current_user, default_system_prompt};
use crate::computer::{Computer, DeclineAll, ExecutionRecord};
use crate::llm::{BackendError, CompletionBackend};
use crate::lmc::{parse_response, primary_unit, Lmc, Role, Transcript, UnitType};
use crate::metrics::{AGENT_ROUNDS, AGENT_TURNS, CLASSIFICATION_FAILURES, LLM_CALL_DURATION};
use crate::search::{
    classify, gather_context, ClassificationError, SearchError, SearcherRegistry, SearxSearcher,
};

/// Configuration for the agent controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Model name passed to the backend (e.g., "llama3.2")
    pub model: String,
    /// Maximum code execution rounds per user turn
    pub max_rounds: usize,
    /// Wall-clock limit for a single execution in seconds
    pub execution_timeout_secs: u64,
    /// Custom system prompt (uses the generated default if None)
    pub system_prompt: Option<String>,
    /// Run code without asking; when false the computer's approver decides
    pub auto_run: bool,
    /// Classify each message and gather search context when needed
    pub search_enabled: bool,
    /// Registry key of the searcher to use
    pub searcher: String,
    /// Fail the turn on a malformed classification instead of answering
    /// without search context
    pub strict_classification: bool,
    /// Interpreter for the persistent python session
    pub python_command: String,
    /// Echo every unit sent to the backend
    pub verbose: bool,
    /// Phrases in a final answer that end the conversation
    pub breakers: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "llama3.2".to_string(),
            max_rounds: 16,
            execution_timeout_secs: 30,
            system_prompt: None,
            auto_run: true,
            search_enabled: true,
            searcher: SearxSearcher::NAME.to_string(),
            strict_classification: false,
            python_command: "python3".to_string(),
            verbose: false,
            breakers: vec![
                "the task is done.".to_string(),
                "the conversation is done.".to_string(),
            ],
        }
    }
}

/// Result of one answered user turn
#[derive(Debug, Clone)]
pub struct AgentResult {
    /// Final answer shown to the user
    pub final_response: String,
    /// Code execution rounds consumed
    pub rounds: usize,
    /// Records of all code executions in this turn
    pub execution_records: Vec<ExecutionRecord>,
    /// Browser units injected by the search gate
    pub search_context_units: usize,
    /// Set when classification failed and the turn went ahead without search
    pub classification_error: Option<String>,
    /// The answer contained a conversation breaker
    pub conversation_over: bool,
    /// Unique trace ID for this turn
    pub trace_id: String,
}

/// Error type for agent operations
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The model kept asking to run code past the round limit
    #[error("agent exceeded its thinking budget of {max_rounds} rounds")]
    BudgetExceeded { max_rounds: usize },

    #[error("agent turn cancelled after {rounds} rounds")]
    Cancelled { rounds: usize },

    #[error("completion backend returned an empty reply")]
    EmptyReply,

    #[error("completion backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("search error: {0}")]
    Search(#[from] SearchError),

    #[error("{0}")]
    Classification(ClassificationError),
}

impl From<ClassificationError> for AgentError {
    fn from(e: ClassificationError) -> Self {
        match e {
            ClassificationError::Backend(e) => AgentError::Backend(e),
            malformed => AgentError::Classification(malformed),
        }
    }
}

impl AgentError {
    fn outcome(&self) -> &'static str {
        match self {
            AgentError::BudgetExceeded { .. } => "budget_exceeded",
            AgentError::Cancelled { .. } => "cancelled",
            _ => "error",
        }
    }
}

/// Owns one conversation: its transcript, its computer and its backend
pub struct AgentController {
    session_id: String,
    backend: Arc<dyn CompletionBackend>,
    computer: Computer,
    searchers: SearcherRegistry,
    transcript: Transcript,
    system_prompt: String,
    config: AgentConfig,
    cancel: CancellationToken,
}

impl AgentController {
    /// Create a new agent controller
    ///
    /// # Arguments
    /// * `backend` - completion backend answering every round
    /// * `computer` - execution dispatcher owned by this session
    /// * `config` - Agent configuration
    pub fn new(backend: Arc<dyn CompletionBackend>, computer: Computer, config: AgentConfig) -> Self {
        let computer = if !config.auto_run && !computer.has_approver() {
            warn!("auto_run is off and no approver is set; code will not run");
            computer.with_approver(Arc::new(DeclineAll))
        } else {
            computer
        };

        let system_prompt = config.system_prompt.clone().unwrap_or_else(|| {
            default_system_prompt(
                computer.platform(),
                &computer.supported_formats(),
                &current_user(),
            )
        });

        Self {
            session_id: Uuid::now_v7().to_string(),
            backend,
            computer,
            searchers: SearcherRegistry::new(),
            transcript: Transcript::new(),
            system_prompt,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_searchers(mut self, searchers: SearcherRegistry) -> Self {
        self.searchers = searchers;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Token that aborts the current turn at the next round boundary
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Replace a cancelled token so the session can take another turn
    pub fn renew_cancellation(&mut self) {
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
    }

    /// Handle one user message to completion or failure
    pub async fn chat(&mut self, message: &str) -> Result<AgentResult, AgentError> {
        let trace_id = Uuid::now_v7().to_string();

        let root_span = info_span!(
            "agent_turn",
            trace_id = %trace_id,
            session_id = %self.session_id,
            model = %self.config.model,
            otel.name = "agent_turn"
        );

        async {
            info!(trace_id = %trace_id, "starting agent turn");

            let result = self.run_turn(message, &trace_id).await;
            match &result {
                Ok(answer) => {
                    AGENT_TURNS.with_label_values(&["answered"]).inc();
                    AGENT_ROUNDS.observe(answer.rounds as f64);
                    info!(trace_id = %trace_id, rounds = answer.rounds, "agent turn answered");
                }
                Err(e) => {
                    AGENT_TURNS.with_label_values(&[e.outcome()]).inc();
                    warn!(trace_id = %trace_id, error = %e, "agent turn failed");
                }
            }
            result
        }
        .instrument(root_span)
        .await
    }

    async fn run_turn(&mut self, message: &str, trace_id: &str) -> Result<AgentResult, AgentError> {
        let mut classification_error = None;
        let mut search_context_units = 0;

        if self.config.search_enabled {
            match self.gather_search_context(message).await {
                Ok(units) => {
                    search_context_units = units.len();
                    for unit in units {
                        self.transcript.push(unit);
                    }
                }
                Err(AgentError::Classification(e)) if !self.config.strict_classification => {
                    warn!(error = %e, "classification failed, answering without search");
                    CLASSIFICATION_FAILURES.inc();
                    classification_error = Some(e.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        self.transcript.push(Lmc::message(Role::User, message));

        let mut rounds = 0;
        let mut execution_records = Vec::new();

        loop {
            if self.cancel.is_cancelled() {
                info!(rounds, "turn cancelled");
                return Err(AgentError::Cancelled { rounds });
            }

            let reply = self.request_reply(rounds).await?;
            let units = parse_response(&reply);
            let (primary, ignored) = primary_unit(units).ok_or(AgentError::EmptyReply)?;
            if ignored > 0 {
                warn!(ignored, "reply carried extra units after the primary one; ignoring them");
            }

            self.transcript.push(primary.clone());

            if primary.unit_type() != UnitType::Code {
                let final_response = primary.content().to_string();
                let conversation_over = self.is_breaker(&final_response);
                return Ok(AgentResult {
                    final_response,
                    rounds,
                    execution_records,
                    search_context_units,
                    classification_error,
                    conversation_over,
                    trace_id: trace_id.to_string(),
                });
            }

            if rounds >= self.config.max_rounds {
                warn!(max_rounds = self.config.max_rounds, "round budget exhausted");
                return Err(AgentError::BudgetExceeded {
                    max_rounds: self.config.max_rounds,
                });
            }
            rounds += 1;

            let format = primary.format().unwrap_or_default();
            let exec_span = info_span!(
                "code_execution",
                round = rounds,
                format = %format,
                code_len = primary.content().len(),
                otel.name = "code_execution"
            );
            let record = self
                .computer
                .execute(primary.content(), format)
                .instrument(exec_span)
                .await;

            self.transcript
                .push(Lmc::message(Role::Computer, record.output.clone()));
            execution_records.push(record);
        }
    }

    /// Classify the message and fetch whatever context it calls for
    async fn gather_search_context(&self, message: &str) -> Result<Vec<Lmc>, AgentError> {
        let Some(searcher) = self.searchers.get(&self.config.searcher) else {
            debug!(searcher = %self.config.searcher, "no searcher registered, skipping search gate");
            return Ok(Vec::new());
        };

        let classification = classify(self.backend.as_ref(), message).await?;
        Ok(gather_context(searcher.as_ref(), &classification).await?)
    }

    /// Replay the transcript to the backend and return its raw reply
    async fn request_reply(&self, round: usize) -> Result<String, AgentError> {
        if self.config.verbose {
            let now = Local::now();
            println!("{}", Lmc::message(Role::System, &self.system_prompt).to_log_line(&now));
            for unit in &self.transcript {
                println!("{}", unit.to_log_line(&now));
            }
        }

        let llm_span = info_span!(
            "llm_call",
            round,
            model = %self.config.model,
            otel.name = "llm_call"
        );
        let start = Instant::now();

        let reply = self
            .backend
            .complete(self.transcript.units(), &self.system_prompt)
            .instrument(llm_span)
            .await?;

        let elapsed = start.elapsed().as_secs_f64();
        LLM_CALL_DURATION.with_label_values(&["answer"]).observe(elapsed);
        debug!(round, duration_ms = elapsed * 1000.0, reply_len = reply.len(), "backend replied");

        Ok(reply)
    }

    fn is_breaker(&self, answer: &str) -> bool {
        let answer = answer.to_lowercase();
        self.config
            .breakers
            .iter()
            .any(|b| !b.is_empty() && answer.contains(&b.to_lowercase()))
    }

    /// Release the session's interpreter
    pub async fn shutdown(&mut self) {
        self.computer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedBackend;
    use std::time::Duration;

    fn controller(backend: Arc<ScriptedBackend>, config: AgentConfig) -> AgentController {
        let computer = Computer::new("python3", Duration::from_secs(10)).quiet();
        AgentController::new(backend, computer, config)
    }

    fn offline_config() -> AgentConfig {
        AgentConfig {
            search_enabled: false,
            ..AgentConfig::default()
        }
    }

    #[test]
    fn test_agent_config_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.max_rounds, 16);
        assert_eq!(config.execution_timeout_secs, 30);
        assert!(config.auto_run);
        assert_eq!(config.searcher, "searx");
    }

    #[test]
    fn test_agent_config_partial_json() {
        let config: AgentConfig = serde_json::from_str(r#"{"max_rounds": 4}"#).unwrap();
        assert_eq!(config.max_rounds, 4);
        assert_eq!(config.model, "llama3.2");
    }

    #[tokio::test]
    async fn test_plain_answer_takes_no_rounds() {
        let backend = Arc::new(ScriptedBackend::new(["Hello!\nHow can I help?"]));
        let mut agent = controller(backend.clone(), offline_config());

        let result = agent.chat("hi").await.unwrap();
        assert_eq!(result.final_response, "Hello!\nHow can I help?");
        assert_eq!(result.rounds, 0);
        assert_eq!(backend.call_count(), 1);
        assert_eq!(agent.transcript().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_reply_is_an_error() {
        let backend = Arc::new(ScriptedBackend::new(["   \n\n"]));
        let mut agent = controller(backend, offline_config());
        assert!(matches!(agent.chat("hi").await, Err(AgentError::EmptyReply)));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_round() {
        let backend = Arc::new(ScriptedBackend::new(["never sent"]));
        let mut agent = controller(backend.clone(), offline_config());
        agent.cancellation_token().cancel();

        let err = agent.chat("hi").await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled { rounds: 0 }));
        assert_eq!(backend.call_count(), 0);
        // the user message stays in history
        assert_eq!(agent.transcript().len(), 1);

        agent.renew_cancellation();
        assert_eq!(agent.chat("again").await.unwrap().final_response, "never sent");
    }

    /// Asks for code every time and cancels the turn on its first call
    struct CancellingBackend {
        token: std::sync::Mutex<Option<CancellationToken>>,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CompletionBackend for CancellingBackend {
        async fn complete(&self, _: &[Lmc], _: &str) -> Result<String, BackendError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if let Some(token) = self.token.lock().unwrap().take() {
                token.cancel();
            }
            Ok("```ruby\nputs 1\n```".to_string())
        }
    }

    #[tokio::test]
    async fn test_cancelled_between_rounds() {
        let backend = Arc::new(CancellingBackend {
            token: std::sync::Mutex::new(None),
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let computer = Computer::new("python3", Duration::from_secs(10)).quiet();
        let mut agent = AgentController::new(backend.clone(), computer, offline_config());
        *backend.token.lock().unwrap() = Some(agent.cancellation_token());

        let err = agent.chat("keep going").await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled { rounds: 1 }));
        assert_eq!(backend.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        // the round that ran stays in history
        let roles: Vec<Role> = agent.transcript().iter().map(|u| u.role()).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Computer]);
        assert!(agent.transcript().units()[1].is_code());
    }

    #[tokio::test]
    async fn test_breaker_marks_conversation_over() {
        let backend = Arc::new(ScriptedBackend::new(["All set. The task is done."]));
        let mut agent = controller(backend, offline_config());
        assert!(agent.chat("finish up").await.unwrap().conversation_over);
    }

    #[tokio::test]
    async fn test_auto_run_off_declines_code() {
        let backend = Arc::new(ScriptedBackend::new(["```bash\ntouch /tmp/x\n```", "Okay."]));
        let config = AgentConfig {
            auto_run: false,
            ..offline_config()
        };
        let mut agent = controller(backend, config);

        let result = agent.chat("make a file").await.unwrap();
        assert_eq!(result.execution_records.len(), 1);
        assert_eq!(
            result.execution_records[0].status,
            crate::computer::ExecutionStatus::Declined
        );
    }

    #[test]
    fn test_custom_system_prompt_wins() {
        let backend = Arc::new(ScriptedBackend::new(Vec::<String>::new()));
        let config = AgentConfig {
            system_prompt: Some("Be terse.".into()),
            ..offline_config()
        };
        assert_eq!(controller(backend, config).system_prompt(), "Be terse.");
    }
}

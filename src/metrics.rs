//! Prometheus metrics for the agent loop
//!
//! All metrics live in the default registry; [`gather_text`] renders them in
//! the Prometheus text exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec, Counter,
    CounterVec, Encoder, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Agent Loop Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Finished user turns by outcome.
    ///
    /// Labels:
    /// - outcome: "answered", "budget_exceeded", "cancelled", "error"
    pub static ref AGENT_TURNS: CounterVec = register_counter_vec!(
        "mindflow_agent_turns_total",
        "User turns handled by the agent, by outcome",
        &["outcome"]
    ).expect("failed to register AGENT_TURNS metric");

    /// Execution rounds consumed per answered turn.
    pub static ref AGENT_ROUNDS: Histogram = register_histogram!(
        "mindflow_agent_rounds",
        "Code execution rounds per answered turn",
        vec![0.0, 1.0, 2.0, 3.0, 5.0, 8.0, 12.0, 16.0, 32.0]
    ).expect("failed to register AGENT_ROUNDS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Execution Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Code executions by language and status.
    ///
    /// Labels:
    /// - format: language tag, or "unknown" for unsupported tags
    /// - status: "completed", "failed", "timeout", "unsupported", "planned", "declined"
    pub static ref CODE_EXECUTIONS: CounterVec = register_counter_vec!(
        "mindflow_code_executions_total",
        "Code blocks handled by the computer",
        &["format", "status"]
    ).expect("failed to register CODE_EXECUTIONS metric");

    /// Wall-clock time spent per execution.
    pub static ref CODE_EXECUTION_DURATION: HistogramVec = register_histogram_vec!(
        "mindflow_code_execution_duration_seconds",
        "Time spent executing a code block",
        &["format"]
    ).expect("failed to register CODE_EXECUTION_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Backend & Search Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Completion backend latency.
    ///
    /// Labels:
    /// - purpose: "answer" or "classify"
    pub static ref LLM_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "mindflow_llm_call_duration_seconds",
        "Completion backend call latency",
        &["purpose"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).expect("failed to register LLM_CALL_DURATION metric");

    /// Search gate decisions.
    ///
    /// Labels:
    /// - mode: "none", "widget", "full"
    pub static ref SEARCHES: CounterVec = register_counter_vec!(
        "mindflow_searches_total",
        "Search gate decisions",
        &["mode"]
    ).expect("failed to register SEARCHES metric");

    /// Classification replies that were not valid JSON judgements.
    pub static ref CLASSIFICATION_FAILURES: Counter = register_counter!(
        "mindflow_classification_failures_total",
        "Malformed classification replies"
    ).expect("failed to register CLASSIFICATION_FAILURES metric");
}

/// Render every registered metric in Prometheus text format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_touched_metrics() {
        SEARCHES.with_label_values(&["none"]).inc();
        let text = gather_text();
        assert!(text.contains("mindflow_searches_total"));
    }
}

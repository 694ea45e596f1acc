//! Asking the model whether a message needs a web search

use std::time::Instant;

use tracing::{debug, info_span, Instrument};

use super::{Classification, MAX_QUERIES};
use crate::llm::{BackendError, CompletionBackend};
use crate::lmc::{Lmc, Role};
use crate::metrics::LLM_CALL_DURATION;

/// System prompt for the classification call
pub const CLASSIFY_PROMPT: &str = r#"Decide whether the user's message needs a web search before it can be answered well.

If it concerns recent events or anything you do not reliably know, reply with
{"search": [...], "complexity": n, "widget": w}
where:
- "search" lists the web queries you would run, at most 3, as few as possible.
- Leave out words like "today" and clock times (for example "7 pm") from the queries.
- "complexity" is how many result pages should be read. Use 0 when a search-engine rich snippet already answers it.
- "widget" names the expected rich snippet, one of "weather", "events", "showtimes", "reviews", or null if none applies.

Otherwise reply with {"search": [], "complexity": 0, "widget": null}.

Reply with the JSON object only and nothing else, whatever the message asks."#;

#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    #[error("classification request failed: {0}")]
    Backend(#[from] BackendError),

    #[error("classification reply is not a valid judgement: {reason}")]
    Malformed { reason: String, reply: String },
}

/// Classify `message` with a history-free backend call.
///
/// Nothing from this call is added to any transcript.
pub async fn classify(
    backend: &dyn CompletionBackend,
    message: &str,
) -> Result<Classification, ClassificationError> {
    let span = info_span!("classify", otel.name = "classify");
    let start = Instant::now();

    let reply = backend
        .complete(&[Lmc::message(Role::User, message)], CLASSIFY_PROMPT)
        .instrument(span)
        .await?;

    LLM_CALL_DURATION
        .with_label_values(&["classify"])
        .observe(start.elapsed().as_secs_f64());

    let classification = parse_classification(&reply)?;
    debug!(?classification, "message classified");
    Ok(classification)
}

/// Parse a classification reply.
///
/// Tolerates prose or a code fence around the JSON object but nothing
/// else: a reply without a well-formed object is an error.
pub fn parse_classification(reply: &str) -> Result<Classification, ClassificationError> {
    let malformed = |reason: String| ClassificationError::Malformed {
        reason,
        reply: reply.to_string(),
    };

    let json = first_json_object(reply).ok_or_else(|| malformed("no JSON object found".into()))?;
    let mut classification: Classification =
        serde_json::from_str(json).map_err(|e| malformed(e.to_string()))?;

    classification.search.retain(|q| !q.trim().is_empty());
    if classification.search.len() > MAX_QUERIES {
        debug!(requested = classification.search.len(), "truncating search queries");
        classification.search.truncate(MAX_QUERIES);
    }
    Ok(classification)
}

/// Slice of the first balanced `{...}` in `text`, skipping braces inside
/// JSON strings
fn first_json_object(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    return start.map(|s| &text[s..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedBackend;
    use crate::search::Widget;

    #[test]
    fn test_parse_widget_judgement() {
        let c = parse_classification(
            r#"{"search": ["weather Tokyo"], "complexity": 0, "widget": "weather"}"#,
        )
        .unwrap();
        assert_eq!(c.search, vec!["weather Tokyo"]);
        assert_eq!(c.complexity, 0);
        assert_eq!(c.widget, Some(Widget::Weather));
    }

    #[test]
    fn test_parse_no_search() {
        let c = parse_classification(r#"{"search": [], "widget": null}"#).unwrap();
        assert!(!c.needs_search());
        assert_eq!(c.widget, None);
    }

    #[test]
    fn test_parse_tolerates_fence_and_prose() {
        let c = parse_classification(
            "Sure:\n```json\n{\"search\": [\"f1 results {latest}\"], \"complexity\": 2, \"widget\": null}\n```",
        )
        .unwrap();
        assert_eq!(c.search, vec!["f1 results {latest}"]);
        assert_eq!(c.complexity, 2);
    }

    #[test]
    fn test_parse_caps_queries() {
        let c = parse_classification(r#"{"search": ["a", "b", "c", "d", ""], "complexity": 1}"#)
            .unwrap();
        assert_eq!(c.search, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for reply in [
            "I think you should search.",
            r#"{"search": "weather"}"#,
            r#"{"search": [], "widget": "stocks"}"#,
            r#"{"search": [], "complexity": -1}"#,
            "{\"search\": [",
        ] {
            assert!(
                matches!(parse_classification(reply), Err(ClassificationError::Malformed { .. })),
                "accepted {reply:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_classify_is_history_free() {
        let backend = ScriptedBackend::new([r#"{"search": [], "complexity": 0, "widget": null}"#]);
        classify(&backend, "hello there").await.unwrap();

        let calls = backend.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].transcript, vec![Lmc::message(Role::User, "hello there")]);
        assert_eq!(calls[0].system_prompt, CLASSIFY_PROMPT);
    }

    #[tokio::test]
    async fn test_classify_propagates_transport_failure() {
        let backend = ScriptedBackend::new(Vec::<String>::new());
        let err = classify(&backend, "hi").await.unwrap_err();
        assert!(matches!(err, ClassificationError::Backend(_)));
    }
}

//! Scripted backend for tests and offline demos
//!
//! Replies are handed out in order; every call is recorded so callers can
//! inspect exactly what the agent sent.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{BackendError, CompletionBackend};
use crate::lmc::Lmc;

/// One request as seen by the backend
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub transcript: Vec<Lmc>,
    pub system_prompt: String,
}

pub struct ScriptedBackend {
    replies: Mutex<VecDeque<String>>,
    /// Returned once `replies` runs dry
    fallback: Option<String>,
    calls: Mutex<Vec<RecordedCall>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedBackend {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A backend that answers every call with `reply`
    pub fn repeating(reply: impl Into<String>) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: Some(reply.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete(&self, transcript: &[Lmc], system_prompt: &str) -> Result<String, BackendError> {
        lock(&self.calls).push(RecordedCall {
            transcript: transcript.to_vec(),
            system_prompt: system_prompt.to_string(),
        });

        match lock(&self.replies).pop_front() {
            Some(reply) => Ok(reply),
            None => self
                .fallback
                .clone()
                .ok_or_else(|| BackendError::Unavailable("script exhausted".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lmc::Role;

    #[tokio::test]
    async fn test_replies_in_order_then_exhausted() {
        let backend = ScriptedBackend::new(["one", "two"]);
        let unit = [Lmc::message(Role::User, "hi")];
        assert_eq!(backend.complete(&unit, "sys").await.unwrap(), "one");
        assert_eq!(backend.complete(&unit, "sys").await.unwrap(), "two");
        assert!(matches!(
            backend.complete(&unit, "sys").await,
            Err(BackendError::Unavailable(_))
        ));
        assert_eq!(backend.call_count(), 3);
        assert_eq!(backend.calls()[0].system_prompt, "sys");
    }

    #[tokio::test]
    async fn test_repeating_never_runs_dry() {
        let backend = ScriptedBackend::repeating("again");
        for _ in 0..5 {
            assert_eq!(backend.complete(&[], "").await.unwrap(), "again");
        }
    }
}

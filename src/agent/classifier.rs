//! Intent classification.
//!
//! The supervisor only sees the [`IntentClassifier`] trait: given the history
//! of a thread it either replies or asks for a specialist handler. The
//! keyword classifier here stands in for a model-backed one.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::conversation::{ChatMessage, Role};
use crate::agent::handlers::{ANALYSIS_HANDLER, CANCEL_HANDLER, STATUS_HANDLER};
use crate::error::ClassifierError;

/// Instruction to hand the current turn to a specialist handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationRequest {
    /// Registered handler name.
    pub handler: String,
    /// Text the handler works on.
    pub task: String,
    /// Correlates the handler result with this request.
    pub call_id: String,
}

impl DelegationRequest {
    pub fn new(handler: impl Into<String>, task: impl Into<String>) -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self {
            handler: handler.into(),
            task: task.into(),
            call_id: format!("call_{}", &hex[..8]),
        }
    }
}

/// Outcome of classifying a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Finalize the turn with this reply.
    Reply(String),
    /// Run a handler, then classify again.
    Delegate(DelegationRequest),
}

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, history: &[ChatMessage]) -> Result<Decision, ClassifierError>;
}

pub const HELP_REPLY: &str = "I can help with: Thematic Analysis, Job Status checks or cancelling a job. What would you like to do?";

static STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:status|progress|check|how\s+is)\b").expect("valid status regex")
});
static CANCEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:cancel|stop|abort)\b").expect("valid cancel regex"));
static ANALYSIS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:thematic|analysis|analyze|theme|ai|innovation)\b")
        .expect("valid analysis regex")
});

/// Keyword matcher. Status requests win over cancellation, which wins over
/// analysis requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }

    fn route(utterance: &str) -> Option<&'static str> {
        if STATUS_RE.is_match(utterance) {
            Some(STATUS_HANDLER)
        } else if CANCEL_RE.is_match(utterance) {
            Some(CANCEL_HANDLER)
        } else if ANALYSIS_RE.is_match(utterance) {
            Some(ANALYSIS_HANDLER)
        } else {
            None
        }
    }
}

#[async_trait]
impl IntentClassifier for KeywordClassifier {
    async fn classify(&self, history: &[ChatMessage]) -> Result<Decision, ClassifierError> {
        let Some(last) = history.last() else {
            return Ok(Decision::Reply(HELP_REPLY.to_string()));
        };

        let decision = match last.role {
            Role::Handler => Decision::Reply(last.content.clone()),
            Role::User => match Self::route(&last.content) {
                Some(handler) => Decision::Delegate(DelegationRequest::new(handler, &last.content)),
                None => Decision::Reply(HELP_REPLY.to_string()),
            },
            Role::Assistant => {
                return Err(ClassifierError::InvalidResponse {
                    reason: "history ends with an assistant message".to_string(),
                });
            }
        };
        tracing::debug!(?decision, "Classified turn");
        Ok(decision)
    }
}

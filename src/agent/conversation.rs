//! Per-thread conversation history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::classifier::DelegationRequest;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    /// Output of a specialist handler, fed back to the classifier.
    Handler,
}

/// One entry in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Set on assistant messages that hand the turn to a handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation: Option<DelegationRequest>,
    /// Handler that produced this message, for `Role::Handler`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            delegation: None,
            handler: None,
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Assistant message carrying a delegation instruction.
    pub fn delegation(request: DelegationRequest) -> Self {
        let mut message = Self::new(
            Role::Assistant,
            format!("Routing to {}", request.handler),
        );
        message.delegation = Some(request);
        message
    }

    /// Handler result answering a delegation.
    pub fn handler_result(handler: impl Into<String>, content: impl Into<String>) -> Self {
        let mut message = Self::new(Role::Handler, content);
        message.handler = Some(handler.into());
        message
    }
}

/// History of one thread plus the state follow-up requests resolve against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub thread_id: String,
    pub messages: Vec<ChatMessage>,
    /// Most recent job created in this thread.
    pub last_job_id: Option<String>,
}

impl Conversation {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            messages: Vec::new(),
            last_job_id: None,
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }
}

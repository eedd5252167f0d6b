//! Supervisor: routes each turn through the classifier and the handlers.
//!
//! ```text
//! user message ─► classify ─┬─► Reply ─────────────► assistant message (turn done)
//!                           └─► Delegate ─► handler ─► handler message ─► classify again
//! ```
//!
//! Histories are kept per thread; a thread's lock is held for the whole turn,
//! so turns on one thread are processed in order.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::agent::classifier::{Decision, DelegationRequest, IntentClassifier};
use crate::agent::conversation::{ChatMessage, Conversation};
use crate::agent::handlers::{
    CANCEL_HANDLER, HandlerReply, STATUS_HANDLER, SpecialistHandler, extract_job_id,
};
use crate::config::SupervisorConfig;

pub struct Supervisor {
    classifier: Arc<dyn IntentClassifier>,
    handlers: HashMap<&'static str, Arc<dyn SpecialistHandler>>,
    threads: RwLock<HashMap<String, Arc<Mutex<Conversation>>>>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(classifier: Arc<dyn IntentClassifier>, config: SupervisorConfig) -> Self {
        Self {
            classifier,
            handlers: HashMap::new(),
            threads: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Register a handler under its own name.
    pub fn with_handler(mut self, handler: Arc<dyn SpecialistHandler>) -> Self {
        self.handlers.insert(handler.name(), handler);
        self
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Snapshot of a thread's history.
    pub async fn conversation(&self, thread_id: &str) -> Option<Conversation> {
        let thread = self.threads.read().await.get(thread_id).cloned()?;
        let conversation = thread.lock().await;
        Some(conversation.clone())
    }

    async fn thread(&self, thread_id: &str) -> Arc<Mutex<Conversation>> {
        if let Some(thread) = self.threads.read().await.get(thread_id) {
            return Arc::clone(thread);
        }
        let mut threads = self.threads.write().await;
        Arc::clone(
            threads
                .entry(thread_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Conversation::new(thread_id)))),
        )
    }

    /// Process one user utterance and return the final reply.
    ///
    /// Never fails: classifier and handler problems are turned into text.
    pub async fn submit_turn(&self, thread_id: &str, utterance: &str) -> String {
        let thread = self.thread(thread_id).await;
        let mut conversation = thread.lock().await;
        conversation.push(ChatMessage::user(utterance));

        let mut delegations = 0usize;
        loop {
            let decision = match self.classifier.classify(&conversation.messages).await {
                Ok(decision) => decision,
                Err(e) => {
                    tracing::warn!(thread_id, error = %e, "Classifier failed");
                    Decision::Reply(format!("Sorry, I could not process that request: {e}"))
                }
            };

            let request = match decision {
                Decision::Reply(reply) => {
                    conversation.push(ChatMessage::assistant(reply.as_str()));
                    return reply;
                }
                Decision::Delegate(request) => request,
            };

            if delegations >= self.config.max_delegations {
                tracing::warn!(
                    thread_id,
                    delegations,
                    handler = %request.handler,
                    "Delegation limit reached"
                );
                let reply = format!(
                    "Sorry, I could not complete this request after {delegations} handler calls."
                );
                conversation.push(ChatMessage::assistant(reply.as_str()));
                return reply;
            }
            delegations += 1;

            let task = resolve_task(&conversation, &request);
            tracing::info!(
                thread_id,
                handler = %request.handler,
                call_id = %request.call_id,
                "Delegating turn"
            );
            conversation.push(ChatMessage::delegation(request.clone()));

            let reply = match self.handlers.get(request.handler.as_str()) {
                Some(handler) => handler.handle(&task).await,
                None => HandlerReply::text(format!("No handler is registered as {}.", request.handler)),
            };
            if let Some(job_id) = &reply.job_id {
                conversation.last_job_id = Some(job_id.clone());
            }
            conversation.push(ChatMessage::handler_result(request.handler, reply.content));
        }
    }
}

/// Job-scoped requests without an explicit id refer to the thread's latest job.
fn resolve_task(conversation: &Conversation, request: &DelegationRequest) -> String {
    let job_scoped = request.handler == STATUS_HANDLER || request.handler == CANCEL_HANDLER;
    match &conversation.last_job_id {
        Some(job_id) if job_scoped && extract_job_id(&request.task).is_none() => {
            tracing::debug!(job_id = %job_id, "Using the thread's latest job");
            format!("{} {job_id}", request.task)
        }
        _ => request.task.clone(),
    }
}

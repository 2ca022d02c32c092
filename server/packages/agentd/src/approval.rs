//! Human approval of dangerous tool invocations.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub session_id: String,
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: Value,
}

/// Notified whenever a tool invocation needs a decision.
///
/// Decisions come back through [`crate::session::SessionManager::resolve_approval`].
#[async_trait]
pub trait ApprovalChannel: Send + Sync + std::fmt::Debug {
    async fn request_approval(&self, request: &ApprovalRequest);
}

/// Default channel: clients learn about pending approvals from the
/// `tool_use_start` event, so this only records the request in the log.
#[derive(Debug, Default)]
pub struct LoggingApprovalChannel;

#[async_trait]
impl ApprovalChannel for LoggingApprovalChannel {
    async fn request_approval(&self, request: &ApprovalRequest) {
        tracing::info!(
            session_id = %request.session_id,
            tool_use_id = %request.tool_use_id,
            tool = %request.tool_name,
            "approval requested"
        );
    }
}

/// Outstanding approval requests for one session.
#[derive(Debug, Default)]
pub struct PendingApprovals {
    waiting: Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>,
}

impl PendingApprovals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool_use_id: &str) -> oneshot::Receiver<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut waiting) = self.waiting.lock() {
            waiting.insert(tool_use_id.to_string(), tx);
        }
        rx
    }

    /// Delivers a decision. Returns false when nothing is waiting on `tool_use_id`.
    pub fn resolve(&self, tool_use_id: &str, decision: ApprovalDecision) -> bool {
        let sender = match self.waiting.lock() {
            Ok(mut waiting) => waiting.remove(tool_use_id),
            Err(_) => None,
        };
        match sender {
            Some(sender) => sender.send(decision).is_ok(),
            None => false,
        }
    }

    pub fn forget(&self, tool_use_id: &str) {
        if let Ok(mut waiting) = self.waiting.lock() {
            waiting.remove(tool_use_id);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut waiting) = self.waiting.lock() {
            waiting.clear();
        }
    }

    pub fn pending_ids(&self) -> Vec<String> {
        match self.waiting.lock() {
            Ok(waiting) => waiting.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn decision_reaches_waiter_once() {
        let pending = PendingApprovals::new();
        let rx = pending.register("toolu_1");
        assert!(pending.resolve("toolu_1", ApprovalDecision::Deny));
        assert_eq!(rx.await.unwrap(), ApprovalDecision::Deny);
        assert!(!pending.resolve("toolu_1", ApprovalDecision::Approve));
    }

    #[test]
    fn unknown_ids_are_rejected() {
        let pending = PendingApprovals::new();
        assert!(!pending.resolve("missing", ApprovalDecision::Approve));
    }
}

//! Human-in-the-loop gating for the approval topology.
//!
//! The engine asks an [`ApprovalProvider`] before executing a batch of tool calls. The
//! provider may answer immediately ([`AutoApprove`], closures) or forward the request to a
//! person and wait ([`ChannelApproval`]); the wait is a suspension point that can be
//! cancelled by dropping the pending request.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time;

use crate::functions::ToolCall;
use crate::WorkflowError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalRequest {
    pub agent: String,
    pub round: usize,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl ApprovalDecision {
    pub fn reject(reason: impl Into<String>) -> Self {
        ApprovalDecision::Reject {
            reason: Some(reason.into()),
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalDecision::Approve)
    }
}

#[async_trait]
pub trait ApprovalProvider: Send + Sync {
    async fn decide(&self, request: &ApprovalRequest) -> Result<ApprovalDecision, WorkflowError>;
}

/// Approves every request without asking anyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalProvider for AutoApprove {
    async fn decide(&self, _request: &ApprovalRequest) -> Result<ApprovalDecision, WorkflowError> {
        Ok(ApprovalDecision::Approve)
    }
}

#[async_trait]
impl<F> ApprovalProvider for F
where
    F: Fn(&ApprovalRequest) -> ApprovalDecision + Send + Sync,
{
    async fn decide(&self, request: &ApprovalRequest) -> Result<ApprovalDecision, WorkflowError> {
        Ok(self(request))
    }
}

/// A request waiting for a human answer.
#[derive(Debug)]
pub struct PendingApproval {
    pub request: ApprovalRequest,
    responder: oneshot::Sender<ApprovalDecision>,
}

impl PendingApproval {
    pub fn respond(self, decision: ApprovalDecision) {
        // The run may have been cancelled meanwhile; nobody is left to tell.
        let _ = self.responder.send(decision);
    }

    pub fn approve(self) {
        self.respond(ApprovalDecision::Approve);
    }

    pub fn reject(self, reason: impl Into<String>) {
        self.respond(ApprovalDecision::reject(reason));
    }
}

/// Forwards approval requests over a channel to whoever answers them.
#[derive(Debug, Clone)]
pub struct ChannelApproval {
    sender: mpsc::Sender<PendingApproval>,
    timeout: Option<Duration>,
}

impl ChannelApproval {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingApproval>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (
            Self {
                sender,
                timeout: None,
            },
            receiver,
        )
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl ApprovalProvider for ChannelApproval {
    async fn decide(&self, request: &ApprovalRequest) -> Result<ApprovalDecision, WorkflowError> {
        let (responder, answer) = oneshot::channel();
        self.sender
            .send(PendingApproval {
                request: request.clone(),
                responder,
            })
            .await
            .map_err(|_| WorkflowError::ApprovalCancelled)?;

        match self.timeout {
            Some(limit) => time::timeout(limit, answer)
                .await
                .map_err(|_| WorkflowError::ApprovalTimeout)?
                .map_err(|_| WorkflowError::ApprovalCancelled),
            None => answer.await.map_err(|_| WorkflowError::ApprovalCancelled),
        }
    }
}

//! Controller ↔ executor message vocabulary.
//!
//! Each message carries a header (id, timestamp, sender, direction) and a
//! typed payload; the response is one of accepted / rejected / failed.
//! Delivery is at-most-once per send — retry is the caller's concern, via
//! the retry-spec factory. The transport itself is behind the
//! [`Communicator`] trait; Drover ships an in-process loopback for tests
//! and single-node mode.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::epoch_secs;
use crate::spec::{ExecutorId, InstanceId, InstanceSpec};

/// Which side of the control loop sent a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    Controller,
    Executor,
}

/// Whether a message is a request or a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Request,
    Response,
}

/// Common message metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub id: String,
    pub timestamp_secs: u64,
    pub sender: SenderKind,
    pub direction: Direction,
}

impl MessageHeader {
    /// A fresh request header from the given sender.
    pub fn request(sender: SenderKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp_secs: epoch_secs(),
            sender,
            direction: Direction::Request,
        }
    }
}

/// Typed message payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    StartInstance { spec: InstanceSpec },
    StopInstance { instance_id: InstanceId },
    QueryInstance { instance_id: InstanceId },
    BlacklistExecutor { executor_id: ExecutorId },
}

/// A header plus payload, as put on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: MessageHeader,
    pub payload: MessagePayload,
}

impl Envelope {
    /// A controller-originated request envelope.
    pub fn controller_request(payload: MessagePayload) -> Self {
        Self {
            header: MessageHeader::request(SenderKind::Controller),
            payload,
        }
    }
}

/// Outcome of delivering a message to its target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MessageResponse {
    Accepted,
    Rejected { reason: String },
    Failed { reason: String },
}

impl MessageResponse {
    pub fn is_accepted(&self) -> bool {
        matches!(self, MessageResponse::Accepted)
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        MessageResponse::Rejected {
            reason: reason.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        MessageResponse::Failed {
            reason: reason.into(),
        }
    }
}

/// Errors raised by the transport itself, before the target could answer.
#[derive(Debug, Error)]
pub enum CommsError {
    #[error("executor unreachable: {0}")]
    Unreachable(String),

    #[error("send timed out: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Reliable request/response channel to executors.
///
/// Implementations deliver a single envelope at-most-once and surface the
/// target's verdict. All of Drover's controller-side sends go through this.
#[async_trait::async_trait]
pub trait Communicator: Send + Sync {
    async fn send(
        &self,
        executor_id: &ExecutorId,
        message: Envelope,
    ) -> Result<MessageResponse, CommsError>;
}

//! Wire types of the push feed and the channel timeline.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::sse::SseFrame;

// ── Shared enums ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Which kind of agent sub-process a tool event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    Worker,
    Branch,
}

// ── LiveEvent ─────────────────────────────────────────────────────────────────

/// One decoded frame of the push feed. `channel_id` is the routing key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveEvent {
    pub channel_id: String,
    /// Backend time of the event; some backends omit it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Local time the client decoded the frame
    #[serde(skip, default = "Utc::now")]
    pub received_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Message {
        id: String,
        role: Role,
        content: String,
        sender_name: Option<String>,
    },
    WorkerStarted {
        worker_id: String,
        task: String,
    },
    WorkerProgress {
        worker_id: String,
        status: Option<String>,
        current_tool: Option<String>,
        tool_calls: Option<u32>,
    },
    WorkerFinished {
        worker_id: String,
        #[serde(default)]
        result: String,
    },
    BranchStarted {
        branch_id: String,
        description: String,
    },
    BranchProgress {
        branch_id: String,
        current_tool: Option<String>,
        tool_calls: Option<u32>,
    },
    BranchFinished {
        branch_id: String,
        #[serde(default)]
        conclusion: String,
    },
    TypingStart {},
    TypingStop {},
    ToolStarted {
        process_type: ProcessKind,
        process_id: String,
        tool_name: String,
    },
    ToolCompleted {
        process_type: ProcessKind,
        process_id: String,
        tool_name: String,
    },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame payload is not a json object")]
    NotAnObject,
    #[error("frame has neither a `type` field nor an sse event name")]
    MissingType,
}

impl LiveEvent {
    pub fn new(channel_id: impl Into<String>, timestamp: DateTime<Utc>, kind: EventKind) -> Self {
        Self {
            channel_id: channel_id.into(),
            timestamp: Some(timestamp),
            received_at: timestamp,
            kind,
        }
    }

    /// Backend timestamp, or the arrival time when the backend sent none.
    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.timestamp.unwrap_or(self.received_at)
    }

    /// Decode an SSE frame. A payload without `type` takes the frame's `event:` name.
    pub fn decode(frame: &SseFrame) -> Result<Self, DecodeError> {
        Ok(serde_json::from_value(tagged_payload(frame)?)?)
    }

    /// Short name used in logs.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            EventKind::Message { .. } => "message",
            EventKind::WorkerStarted { .. } => "worker_started",
            EventKind::WorkerProgress { .. } => "worker_progress",
            EventKind::WorkerFinished { .. } => "worker_finished",
            EventKind::BranchStarted { .. } => "branch_started",
            EventKind::BranchProgress { .. } => "branch_progress",
            EventKind::BranchFinished { .. } => "branch_finished",
            EventKind::TypingStart {} => "typing_start",
            EventKind::TypingStop {} => "typing_stop",
            EventKind::ToolStarted { .. } => "tool_started",
            EventKind::ToolCompleted { .. } => "tool_completed",
        }
    }
}

/// JSON object of a frame with its `type` filled in from the SSE event name if absent.
pub(crate) fn tagged_payload(frame: &SseFrame) -> Result<Value, DecodeError> {
    let mut value: Value = serde_json::from_str(&frame.data)?;
    let object = value.as_object_mut().ok_or(DecodeError::NotAnObject)?;
    if !object.contains_key("type") {
        let name = frame.event.as_deref().ok_or(DecodeError::MissingType)?;
        object.insert("type".to_string(), Value::String(name.to_string()));
    }
    Ok(value)
}

// ── Timeline ──────────────────────────────────────────────────────────────────

/// One entry of a channel's merged history, as served by the history endpoint
/// and as maintained by the reducer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineItem {
    Message {
        id: String,
        role: Role,
        content: String,
        created_at: DateTime<Utc>,
        sender_name: Option<String>,
    },
    BranchRun {
        id: String,
        description: String,
        started_at: DateTime<Utc>,
        conclusion: Option<String>,
    },
    WorkerRun {
        id: String,
        task: String,
        started_at: DateTime<Utc>,
        result: Option<String>,
    },
}

impl TimelineItem {
    pub fn id(&self) -> &str {
        match self {
            TimelineItem::Message { id, .. }
            | TimelineItem::BranchRun { id, .. }
            | TimelineItem::WorkerRun { id, .. } => id,
        }
    }

    /// Ordering key: creation time for messages, start time for runs.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TimelineItem::Message { created_at, .. } => *created_at,
            TimelineItem::BranchRun { started_at, .. } | TimelineItem::WorkerRun { started_at, .. } => {
                *started_at
            }
        }
    }

    /// True for a run that carries its terminal result/conclusion.
    pub fn is_finished_run(&self) -> bool {
        match self {
            TimelineItem::Message { .. } => false,
            TimelineItem::BranchRun { conclusion, .. } => conclusion.is_some(),
            TimelineItem::WorkerRun { result, .. } => result.is_some(),
        }
    }
}

//! Ad-hoc streamed chat with one agent, independent of the live event feed.
//!
//! A background task reads the response stream and forwards decoded frames;
//! the session itself is only ever mutated by its owner through `next_frame`
//! or `apply_frame`, in arrival order.
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::ByteStream;
use crate::events::{DecodeError, Role, tagged_payload};
use crate::sse::{SseDecoder, SseFrame};

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatFrame {
    ToolStarted { tool: String },
    ToolCompleted { tool: String },
    Text { content: String },
    Error { message: String },
    Done,
}

impl ChatFrame {
    pub fn decode(frame: &SseFrame) -> Result<Self, DecodeError> {
        if frame.is_done_marker() {
            return Ok(ChatFrame::Done);
        }
        Ok(serde_json::from_value(tagged_payload(frame)?)?)
    }

    fn ends_turn(&self) -> bool {
        matches!(self, ChatFrame::Done | ChatFrame::Error { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Running,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolActivity {
    pub tool: String,
    pub status: ToolStatus,
}

// ── Transport ─────────────────────────────────────────────────────────────────

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send one user message and return the raw SSE response body.
    async fn open(&self, agent_id: &str, text: &str) -> Result<ByteStream>;
}

/// `POST {endpoint}/api/webchat/send`
pub struct HttpChatTransport {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpChatTransport {
    pub fn new(endpoint: &str, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: format!("{}/api/webchat/send", endpoint.trim_end_matches('/')),
            api_key,
        }
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn open(&self, agent_id: &str, text: &str) -> Result<ByteStream> {
        let body = serde_json::json!({
            "agent_id": agent_id,
            "text": text,
        });

        let mut req = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body);

        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.url))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("API error {}: {}", status, text));
        }

        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(anyhow::Error::from))
            .boxed())
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

pub struct ChatSession {
    agent_id: String,
    transport: Arc<dyn ChatTransport>,
    messages: Vec<ChatMessage>,
    is_streaming: bool,
    error: Option<String>,
    tool_activity: Vec<ToolActivity>,
    /// Index into `messages` of the assistant reply being streamed
    reply: Option<usize>,
    frames: Option<mpsc::UnboundedReceiver<ChatFrame>>,
}

impl ChatSession {
    pub fn new(agent_id: impl Into<String>, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            agent_id: agent_id.into(),
            transport,
            messages: Vec::new(),
            is_streaming: false,
            error: None,
            tool_activity: Vec::new(),
            reply: None,
            frames: None,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn tool_activity(&self) -> &[ToolActivity] {
        &self.tool_activity
    }

    /// Start a turn. Returns false (and changes nothing) when a reply is still
    /// streaming or the text is blank.
    pub fn send_message(&mut self, text: &str) -> bool {
        let text = text.trim();
        if self.is_streaming || text.is_empty() {
            return false;
        }

        self.messages.push(ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::User,
            content: text.to_string(),
        });
        self.error = None;
        self.tool_activity.clear();
        self.reply = None;
        self.is_streaming = true;

        let (tx, rx) = mpsc::unbounded_channel();
        self.frames = Some(rx);
        tokio::spawn(forward(
            Arc::clone(&self.transport),
            self.agent_id.clone(),
            text.to_string(),
            tx,
        ));
        true
    }

    /// Wait for the next frame of the current turn and apply it. `None` when no
    /// turn is in flight.
    pub async fn next_frame(&mut self) -> Option<ChatFrame> {
        let rx = self.frames.as_mut()?;
        let frame = rx.recv().await.unwrap_or(ChatFrame::Done);
        self.apply_frame(&frame);
        Some(frame)
    }

    pub fn apply_frame(&mut self, frame: &ChatFrame) {
        if !self.is_streaming {
            debug!(?frame, "ignoring frame outside of a turn");
            return;
        }
        match frame {
            ChatFrame::ToolStarted { tool } => self.tool_activity.push(ToolActivity {
                tool: tool.clone(),
                status: ToolStatus::Running,
            }),
            ChatFrame::ToolCompleted { tool } => {
                if let Some(entry) = self
                    .tool_activity
                    .iter_mut()
                    .rev()
                    .find(|a| a.tool == *tool && a.status == ToolStatus::Running)
                {
                    entry.status = ToolStatus::Done;
                }
            }
            ChatFrame::Text { content } => match self.reply {
                Some(idx) => self.messages[idx].content.push_str(content),
                None => {
                    self.messages.push(ChatMessage {
                        id: uuid::Uuid::new_v4().to_string(),
                        role: Role::Assistant,
                        content: content.clone(),
                    });
                    self.reply = Some(self.messages.len() - 1);
                }
            },
            ChatFrame::Error { message } => {
                self.error = Some(message.clone());
                self.end_turn();
            }
            ChatFrame::Done => self.end_turn(),
        }
    }

    fn end_turn(&mut self) {
        self.is_streaming = false;
        self.tool_activity.clear();
        self.reply = None;
        self.frames = None;
    }
}

/// Background half of a turn: decode the response and hand frames over.
/// Always ends with exactly one `Done` or `Error` unless the session went away.
async fn forward(
    transport: Arc<dyn ChatTransport>,
    agent_id: String,
    text: String,
    tx: mpsc::UnboundedSender<ChatFrame>,
) {
    let mut stream = match transport.open(&agent_id, &text).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, agent = %agent_id, "chat request failed");
            let _ = tx.send(ChatFrame::Error {
                message: e.to_string(),
            });
            return;
        }
    };

    let mut decoder = SseDecoder::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                for frame in decoder.push(&bytes) {
                    if !send_frame(&tx, &frame) {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "chat stream interrupted");
                let _ = tx.send(ChatFrame::Error {
                    message: e.to_string(),
                });
                return;
            }
        }
    }
    if let Some(frame) = decoder.finish() {
        if !send_frame(&tx, &frame) {
            return;
        }
    }

    warn!("chat stream closed without a done marker");
    let _ = tx.send(ChatFrame::Done);
}

/// Returns false once the turn is over or nobody is listening.
fn send_frame(tx: &mpsc::UnboundedSender<ChatFrame>, frame: &SseFrame) -> bool {
    match ChatFrame::decode(frame) {
        Ok(frame) => {
            let ends_turn = frame.ends_turn();
            tx.send(frame).is_ok() && !ends_turn
        }
        Err(e) => {
            warn!(error = %e, "dropping malformed chat frame");
            true
        }
    }
}

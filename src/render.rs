//! Plain-text rendering for stdout. Nothing here touches state; every function
//! formats a snapshot it is handed.
use chrono::{DateTime, Utc};

use crate::api::Agent;
use crate::chat::{ToolActivity, ToolStatus};
use crate::connection::ConnectionState;
use crate::dispatcher::Activity;
use crate::events::{Role, TimelineItem};
use crate::reducer::ChannelLiveState;

const PREVIEW_CHARS: usize = 72;

// ── Connection banner ─────────────────────────────────────────────────────────

/// Banner text for a connection state; nothing while connected.
pub fn banner(state: ConnectionState) -> Option<&'static str> {
    match state {
        ConnectionState::Connected => None,
        ConnectionState::Connecting => Some("Connecting..."),
        ConnectionState::Reconnecting => Some("Reconnecting... Dashboard may show stale data."),
        ConnectionState::Disconnected => Some("Disconnected from server."),
    }
}

pub fn banner_line(state: ConnectionState) -> String {
    match banner(state) {
        Some(label) => format!("  ◌ {label}"),
        None => "  ● Connected".to_string(),
    }
}

// ── Durations and times ───────────────────────────────────────────────────────

/// Elapsed time of a running worker/branch: `42s`, `3m 07s`, `1h 05m`.
pub fn format_duration(seconds: i64) -> String {
    let s = seconds.max(0);
    if s < 60 {
        format!("{s}s")
    } else if s < 3600 {
        format!("{}m {:02}s", s / 60, s % 60)
    } else {
        format!("{}h {:02}m", s / 3600, (s % 3600) / 60)
    }
}

/// Process uptime: `2d 4h`, `3h 12m`, `9m`.
pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3600;
    let minutes = (seconds % 3600) / 60;
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

/// Time of day for today's entries, date and time otherwise.
pub fn format_timestamp(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    if at.date_naive() == now.date_naive() {
        at.format("%H:%M:%S").to_string()
    } else {
        at.format("%b %d %H:%M").to_string()
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> String {
    format_duration((now - since).num_seconds())
}

// ── Channel activity ──────────────────────────────────────────────────────────

/// Multi-line summary of one channel: header, running work, latest timeline entry.
pub fn channel_summary(label: &str, state: &ChannelLiveState, now: DateTime<Utc>) -> Vec<String> {
    let mut lines = Vec::new();
    let typing = if state.is_typing { "  … typing" } else { "" };
    let messages = plural(state.messages().count(), "message");
    lines.push(format!("  # {label}  {messages}{typing}"));

    for worker in state.workers.values() {
        let task = if worker.task.is_empty() { &worker.id } else { &worker.task };
        let mut line = format!(
            "    ⚙ {}  {}  {}",
            preview(task, 40),
            worker.status,
            elapsed(worker.started_at, now)
        );
        if let Some(tool) = &worker.current_tool {
            line.push_str(&format!("  ❯ {tool}"));
        }
        if worker.tool_calls > 0 {
            line.push_str(&format!("  ({} tool calls)", worker.tool_calls));
        }
        lines.push(line);
    }

    for branch in state.branches.values() {
        let description = if branch.description.is_empty() {
            &branch.id
        } else {
            &branch.description
        };
        let mut line = format!(
            "    ◇ {}  {}",
            preview(description, 40),
            elapsed(branch.started_at, now)
        );
        if let Some(tool) = branch.display_tool() {
            line.push_str(&format!("  ❯ {tool}"));
        }
        lines.push(line);
    }

    if let Some(last) = state.timeline.last() {
        lines.push(format!("    ↳ {}", timeline_line(last, now)));
    }
    lines
}

/// One-line rendering of a timeline entry.
pub fn timeline_line(item: &TimelineItem, now: DateTime<Utc>) -> String {
    let at = format_timestamp(item.timestamp(), now);
    match item {
        TimelineItem::Message {
            role,
            content,
            sender_name,
            ..
        } => {
            let who = match (role, sender_name) {
                (_, Some(name)) => name.as_str(),
                (Role::User, None) => "user",
                (Role::Assistant, None) => "assistant",
                (Role::System, None) => "system",
            };
            format!("{at}  {who}: {}", preview(content, PREVIEW_CHARS))
        }
        TimelineItem::WorkerRun { task, result, .. } => match result {
            Some(result) => format!("{at}  ✓ worker {}  → {}", preview(task, 32), preview(result, 40)),
            None => format!("{at}  ⚙ worker {}", preview(task, 32)),
        },
        TimelineItem::BranchRun {
            description,
            conclusion,
            ..
        } => match conclusion {
            Some(conclusion) => format!(
                "{at}  ✓ branch {}  → {}",
                preview(description, 32),
                preview(conclusion, 40)
            ),
            None => format!("{at}  ◇ branch {}", preview(description, 32)),
        },
    }
}

/// `2 workers · 1 branch` style count, or `idle`.
pub fn activity_line(activity: Activity) -> String {
    if activity.is_idle() {
        return "idle".to_string();
    }
    let mut parts = Vec::new();
    if activity.workers > 0 {
        parts.push(plural(activity.workers, "worker"));
    }
    if activity.branches > 0 {
        parts.push(plural(activity.branches, "branch"));
    }
    parts.join(" · ")
}

fn plural(n: usize, noun: &str) -> String {
    match (n, noun) {
        (1, _) => format!("1 {noun}"),
        (_, "branch") => format!("{n} branches"),
        _ => format!("{n} {noun}s"),
    }
}

// ── Agents ────────────────────────────────────────────────────────────────────

/// `3 channels · 128k ctx · 50 turns · 4 branches max · ~/agents/main` for the status view.
pub fn agent_details(agent: &Agent, channels: usize) -> String {
    let mut parts = vec![plural(channels, "channel")];
    if let Some(tokens) = agent.context_window {
        parts.push(if tokens >= 1000 {
            format!("{}k ctx", tokens / 1000)
        } else {
            format!("{tokens} ctx")
        });
    }
    if let Some(turns) = agent.max_turns {
        parts.push(format!("{turns} turns"));
    }
    if let Some(branches) = agent.max_concurrent_branches {
        parts.push(format!("{} max", plural(branches as usize, "branch")));
    }
    if let Some(workspace) = &agent.workspace {
        parts.push(workspace.clone());
    }
    parts.join(" · ")
}

// ── Chat ──────────────────────────────────────────────────────────────────────

pub fn tool_activity_line(activity: &ToolActivity) -> String {
    match activity.status {
        ToolStatus::Running => format!("  ⚙ {} …", activity.tool),
        ToolStatus::Done => format!("  ⚙ {} ✓", activity.tool),
    }
}

/// First line of `text`, cut to `max` characters.
pub fn preview(text: &str, max: usize) -> String {
    let first = text.lines().next().unwrap_or("");
    if first.chars().count() <= max && !text.contains('\n') {
        return first.to_string();
    }
    let cut: String = first.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}

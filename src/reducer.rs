//! Per-channel live state and the pure reducer that folds events into it.
//!
//! Every application produces a fresh snapshot behind a new `Arc`, or hands back
//! the very same `Arc` when the action changed nothing. Readers compare with
//! `Arc::ptr_eq` to decide whether anything needs redrawing.
//!
//! Policy for lossy feeds (events skipped across a reconnect):
//! - progress/tool events for an unknown worker or branch synthesize a minimal entry
//! - a finish event for an unknown id only clears what exists; it never errors
//! - a typing indicator without its stop expires after the typing timeout
//! - a start/progress replayed after the run already finished is ignored
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::events::{EventKind, LiveEvent, ProcessKind, TimelineItem};

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveWorker {
    pub id: String,
    pub task: String,
    pub status: String,
    pub current_tool: Option<String>,
    pub tool_calls: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveBranch {
    pub id: String,
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub current_tool: Option<String>,
    /// Most recently completed tool, shown while no tool is running
    pub last_tool: Option<String>,
    pub tool_calls: u32,
}

impl ActiveBranch {
    pub fn display_tool(&self) -> Option<&str> {
        self.current_tool.as_deref().or(self.last_tool.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelLiveState {
    /// Ascending by timestamp; equal timestamps keep arrival order
    pub timeline: Vec<TimelineItem>,
    pub workers: BTreeMap<String, ActiveWorker>,
    pub branches: BTreeMap<String, ActiveBranch>,
    pub is_typing: bool,
    /// Local arrival time of the `typing_start` that is still open
    pub typing_since: Option<DateTime<Utc>>,
}

impl ChannelLiveState {
    /// Timeline entries that are chat messages.
    pub fn messages(&self) -> impl Iterator<Item = &TimelineItem> {
        self.timeline
            .iter()
            .filter(|item| matches!(item, TimelineItem::Message { .. }))
    }

    pub fn item(&self, id: &str) -> Option<&TimelineItem> {
        self.timeline.iter().find(|item| item.id() == id)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.timeline.iter().position(|item| item.id() == id)
    }

    fn insert_ordered(&mut self, item: TimelineItem) {
        let at = item.timestamp();
        let pos = self.timeline.partition_point(|existing| existing.timestamp() <= at);
        self.timeline.insert(pos, item);
    }

    fn finished_run(&self, id: &str) -> bool {
        self.item(id).is_some_and(TimelineItem::is_finished_run)
    }
}

// ── Actions ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ChannelAction {
    Live(LiveEvent),
    /// Previously fetched timeline entries to merge in
    History(Vec<TimelineItem>),
    /// Implicit `typing_stop` when the open indicator is older than `timeout`
    TypingExpired {
        now: DateTime<Utc>,
        timeout: chrono::Duration,
    },
}

// ── Reducer ───────────────────────────────────────────────────────────────────

/// Apply one action. Returns `state` itself (same allocation) when nothing changed.
pub fn apply(state: &Arc<ChannelLiveState>, action: &ChannelAction) -> Arc<ChannelLiveState> {
    let mut next = ChannelLiveState::clone(state);
    if reduce(&mut next, action) {
        Arc::new(next)
    } else {
        Arc::clone(state)
    }
}

/// In-place form of [`apply`]. Returns whether the state changed.
pub fn reduce(state: &mut ChannelLiveState, action: &ChannelAction) -> bool {
    match action {
        ChannelAction::Live(event) => apply_event(state, event),
        ChannelAction::History(items) => merge_history(state, items),
        ChannelAction::TypingExpired { now, timeout } => {
            let expired = state
                .typing_since
                .is_none_or(|since| *now - since >= *timeout);
            if state.is_typing && expired {
                state.is_typing = false;
                state.typing_since = None;
                true
            } else {
                false
            }
        }
    }
}

fn apply_event(state: &mut ChannelLiveState, event: &LiveEvent) -> bool {
    let at = event.occurred_at();
    match &event.kind {
        EventKind::Message {
            id,
            role,
            content,
            sender_name,
        } => {
            // A re-delivered message without a backend timestamp keeps its slot
            let created_at = match (event.timestamp, state.item(id)) {
                (None, Some(existing)) => existing.timestamp(),
                _ => at,
            };
            upsert_message(
                state,
                TimelineItem::Message {
                    id: id.clone(),
                    role: *role,
                    content: content.clone(),
                    created_at,
                    sender_name: sender_name.clone(),
                },
            )
        }

        EventKind::WorkerStarted { worker_id, task } => worker_started(state, worker_id, task, at),
        EventKind::WorkerProgress {
            worker_id,
            status,
            current_tool,
            tool_calls,
        } => {
            if state.finished_run(worker_id) {
                return false;
            }
            let worker = worker_entry(state, worker_id, at);
            let mut changed = false;
            if let Some(status) = status {
                changed |= set_if_changed(&mut worker.status, status.clone());
            }
            if let Some(tool) = current_tool {
                changed |= set_if_changed(&mut worker.current_tool, Some(tool.clone()));
            }
            if let Some(calls) = tool_calls {
                changed |= set_if_changed(&mut worker.tool_calls, *calls);
            }
            changed
        }
        EventKind::WorkerFinished { worker_id, result } => {
            let removed = state.workers.remove(worker_id).is_some();
            let updated = match state.position(worker_id) {
                Some(pos) => match &mut state.timeline[pos] {
                    TimelineItem::WorkerRun { result: slot, .. } => {
                        set_if_changed(slot, Some(result.clone()))
                    }
                    _ => false,
                },
                None => false,
            };
            removed || updated
        }

        EventKind::BranchStarted {
            branch_id,
            description,
        } => branch_started(state, branch_id, description, at),
        EventKind::BranchProgress {
            branch_id,
            current_tool,
            tool_calls,
        } => {
            if state.finished_run(branch_id) {
                return false;
            }
            let branch = branch_entry(state, branch_id, at);
            let mut changed = false;
            if let Some(tool) = current_tool {
                changed |= set_if_changed(&mut branch.current_tool, Some(tool.clone()));
            }
            if let Some(calls) = tool_calls {
                changed |= set_if_changed(&mut branch.tool_calls, *calls);
            }
            changed
        }
        EventKind::BranchFinished {
            branch_id,
            conclusion,
        } => {
            let removed = state.branches.remove(branch_id).is_some();
            let updated = match state.position(branch_id) {
                Some(pos) => match &mut state.timeline[pos] {
                    TimelineItem::BranchRun {
                        conclusion: slot, ..
                    } => set_if_changed(slot, Some(conclusion.clone())),
                    _ => false,
                },
                None => false,
            };
            removed || updated
        }

        EventKind::TypingStart {} => {
            // Expiry counts from arrival so backend clock skew cannot shorten it
            let since = event.received_at;
            let changed = !state.is_typing || state.typing_since != Some(since);
            state.is_typing = true;
            state.typing_since = Some(since);
            changed
        }
        EventKind::TypingStop {} => {
            let changed = state.is_typing || state.typing_since.is_some();
            state.is_typing = false;
            state.typing_since = None;
            changed
        }

        EventKind::ToolStarted {
            process_type,
            process_id,
            tool_name,
        } => {
            if state.finished_run(process_id) {
                return false;
            }
            match process_type {
                ProcessKind::Worker => {
                    let worker = worker_entry(state, process_id, at);
                    worker.current_tool = Some(tool_name.clone());
                    worker.tool_calls += 1;
                }
                ProcessKind::Branch => {
                    let branch = branch_entry(state, process_id, at);
                    branch.current_tool = Some(tool_name.clone());
                    branch.tool_calls += 1;
                }
            }
            true
        }
        EventKind::ToolCompleted {
            process_type,
            process_id,
            tool_name,
        } => match process_type {
            ProcessKind::Worker => match state.workers.get_mut(process_id) {
                Some(worker) => set_if_changed(&mut worker.current_tool, None),
                None => false,
            },
            ProcessKind::Branch => match state.branches.get_mut(process_id) {
                Some(branch) => {
                    let cleared = set_if_changed(&mut branch.current_tool, None);
                    let recorded = set_if_changed(&mut branch.last_tool, Some(tool_name.clone()));
                    cleared || recorded
                }
                None => false,
            },
        },
    }
}

fn upsert_message(state: &mut ChannelLiveState, item: TimelineItem) -> bool {
    let Some(pos) = state.position(item.id()) else {
        state.insert_ordered(item);
        return true;
    };
    if state.timeline[pos] == item {
        return false;
    }
    if state.timeline[pos].timestamp() == item.timestamp() {
        state.timeline[pos] = item;
    } else {
        state.timeline.remove(pos);
        state.insert_ordered(item);
    }
    true
}

fn worker_started(state: &mut ChannelLiveState, id: &str, task: &str, at: DateTime<Utc>) -> bool {
    if state.finished_run(id) {
        return false;
    }
    let mut changed = false;
    match state.workers.get_mut(id) {
        // Re-delivered start: keep accumulated progress, fill in what a synthesized entry lacked
        Some(worker) => {
            if worker.task.is_empty() {
                worker.task = task.to_string();
                changed = true;
            }
        }
        None => {
            state.workers.insert(
                id.to_string(),
                ActiveWorker {
                    id: id.to_string(),
                    task: task.to_string(),
                    status: "running".to_string(),
                    current_tool: None,
                    tool_calls: 0,
                    started_at: at,
                },
            );
            changed = true;
        }
    }
    if state.position(id).is_none() {
        state.insert_ordered(TimelineItem::WorkerRun {
            id: id.to_string(),
            task: task.to_string(),
            started_at: at,
            result: None,
        });
        changed = true;
    }
    changed
}

fn branch_started(
    state: &mut ChannelLiveState,
    id: &str,
    description: &str,
    at: DateTime<Utc>,
) -> bool {
    if state.finished_run(id) {
        return false;
    }
    let mut changed = false;
    match state.branches.get_mut(id) {
        Some(branch) => {
            if branch.description.is_empty() {
                branch.description = description.to_string();
                changed = true;
            }
        }
        None => {
            state.branches.insert(
                id.to_string(),
                ActiveBranch {
                    id: id.to_string(),
                    description: description.to_string(),
                    started_at: at,
                    current_tool: None,
                    last_tool: None,
                    tool_calls: 0,
                },
            );
            changed = true;
        }
    }
    if state.position(id).is_none() {
        state.insert_ordered(TimelineItem::BranchRun {
            id: id.to_string(),
            description: description.to_string(),
            started_at: at,
            conclusion: None,
        });
        changed = true;
    }
    changed
}

/// Active worker for `id`, synthesized when its start event was never seen.
fn worker_entry<'a>(state: &'a mut ChannelLiveState, id: &str, at: DateTime<Utc>) -> &'a mut ActiveWorker {
    state
        .workers
        .entry(id.to_string())
        .or_insert_with(|| ActiveWorker {
            id: id.to_string(),
            task: String::new(),
            status: "running".to_string(),
            current_tool: None,
            tool_calls: 0,
            started_at: at,
        })
}

fn branch_entry<'a>(state: &'a mut ChannelLiveState, id: &str, at: DateTime<Utc>) -> &'a mut ActiveBranch {
    state
        .branches
        .entry(id.to_string())
        .or_insert_with(|| ActiveBranch {
            id: id.to_string(),
            description: String::new(),
            started_at: at,
            current_tool: None,
            last_tool: None,
            tool_calls: 0,
        })
}

fn merge_history(state: &mut ChannelLiveState, items: &[TimelineItem]) -> bool {
    let mut changed = false;
    for item in items {
        match state.position(item.id()) {
            None => {
                state.insert_ordered(item.clone());
                changed = true;
            }
            Some(pos) => changed |= fill_terminal(&mut state.timeline[pos], item),
        }
        if item.is_finished_run() {
            changed |= state.workers.remove(item.id()).is_some();
            changed |= state.branches.remove(item.id()).is_some();
        }
    }
    changed
}

/// Copy terminal data the live entry is still missing. Messages already seen live win.
fn fill_terminal(existing: &mut TimelineItem, historical: &TimelineItem) -> bool {
    match (existing, historical) {
        (
            TimelineItem::WorkerRun { result: slot, .. },
            TimelineItem::WorkerRun {
                result: Some(result),
                ..
            },
        ) if slot.is_none() => {
            *slot = Some(result.clone());
            true
        }
        (
            TimelineItem::BranchRun {
                conclusion: slot, ..
            },
            TimelineItem::BranchRun {
                conclusion: Some(conclusion),
                ..
            },
        ) if slot.is_none() => {
            *slot = Some(conclusion.clone());
            true
        }
        _ => false,
    }
}

fn set_if_changed<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Role;
    use crate::sse::SseFrame;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn live(secs: i64, kind: EventKind) -> ChannelAction {
        ChannelAction::Live(LiveEvent::new("c1", at(secs), kind))
    }

    fn message(id: &str, secs: i64, content: &str) -> ChannelAction {
        live(
            secs,
            EventKind::Message {
                id: id.to_string(),
                role: Role::User,
                content: content.to_string(),
                sender_name: Some("ada".to_string()),
            },
        )
    }

    fn run(actions: &[ChannelAction]) -> ChannelLiveState {
        let mut state = ChannelLiveState::default();
        for action in actions {
            reduce(&mut state, action);
        }
        state
    }

    fn ids(state: &ChannelLiveState) -> Vec<&str> {
        state.timeline.iter().map(TimelineItem::id).collect()
    }

    #[test]
    fn test_lint_worker_scenario() {
        let state = run(&[
            live(
                0,
                EventKind::WorkerStarted {
                    worker_id: "w1".to_string(),
                    task: "lint".to_string(),
                },
            ),
            live(
                1,
                EventKind::WorkerProgress {
                    worker_id: "w1".to_string(),
                    status: None,
                    current_tool: Some("eslint".to_string()),
                    tool_calls: None,
                },
            ),
            live(
                2,
                EventKind::WorkerFinished {
                    worker_id: "w1".to_string(),
                    result: "0 errors".to_string(),
                },
            ),
        ]);

        assert!(state.workers.is_empty());
        assert_eq!(
            state.timeline,
            vec![TimelineItem::WorkerRun {
                id: "w1".to_string(),
                task: "lint".to_string(),
                started_at: at(0),
                result: Some("0 errors".to_string()),
            }]
        );
    }

    #[test]
    fn test_progress_updates_active_worker() {
        let state = run(&[
            live(
                0,
                EventKind::WorkerStarted {
                    worker_id: "w1".to_string(),
                    task: "lint".to_string(),
                },
            ),
            live(
                1,
                EventKind::WorkerProgress {
                    worker_id: "w1".to_string(),
                    status: Some("checking src/".to_string()),
                    current_tool: Some("eslint".to_string()),
                    tool_calls: Some(3),
                },
            ),
        ]);
        let worker = &state.workers["w1"];
        assert_eq!(worker.status, "checking src/");
        assert_eq!(worker.current_tool.as_deref(), Some("eslint"));
        assert_eq!(worker.tool_calls, 3);
        assert_eq!(worker.started_at, at(0));
    }

    #[test]
    fn test_finish_without_start_is_harmless() {
        let mut state = ChannelLiveState::default();
        let changed = reduce(
            &mut state,
            &live(
                0,
                EventKind::WorkerFinished {
                    worker_id: "ghost".to_string(),
                    result: "done".to_string(),
                },
            ),
        );
        assert!(!changed);
        assert!(state.workers.is_empty());
        assert!(state.timeline.is_empty());

        let changed = reduce(
            &mut state,
            &live(
                0,
                EventKind::BranchFinished {
                    branch_id: "ghost".to_string(),
                    conclusion: "done".to_string(),
                },
            ),
        );
        assert!(!changed);
        assert!(state.branches.is_empty());
    }

    #[test]
    fn test_progress_without_start_synthesizes_worker() {
        let state = run(&[live(
            4,
            EventKind::WorkerProgress {
                worker_id: "w7".to_string(),
                status: Some("indexing".to_string()),
                current_tool: None,
                tool_calls: None,
            },
        )]);
        let worker = &state.workers["w7"];
        assert_eq!(worker.task, "");
        assert_eq!(worker.status, "indexing");
        assert_eq!(worker.started_at, at(4));
        // No placeholder: the start time is unknown
        assert!(state.timeline.is_empty());
    }

    #[test]
    fn test_branch_progress_without_start_synthesizes_branch() {
        let state = run(&[live(
            3,
            EventKind::BranchProgress {
                branch_id: "b9".to_string(),
                current_tool: Some("web_search".to_string()),
                tool_calls: Some(4),
            },
        )]);
        let branch = &state.branches["b9"];
        assert_eq!(branch.description, "");
        assert_eq!(branch.started_at, at(3));
        assert_eq!(branch.display_tool(), Some("web_search"));
        assert_eq!(branch.tool_calls, 4);
        assert!(state.timeline.is_empty());
    }

    #[test]
    fn test_tool_completed_for_unknown_process_is_noop() {
        let before = Arc::new(ChannelLiveState::default());
        for process_type in [ProcessKind::Worker, ProcessKind::Branch] {
            let action = live(
                1,
                EventKind::ToolCompleted {
                    process_type,
                    process_id: "ghost".to_string(),
                    tool_name: "shell".to_string(),
                },
            );
            let after = apply(&before, &action);
            assert!(Arc::ptr_eq(&before, &after));
        }
    }

    #[test]
    fn test_late_start_fills_synthesized_task() {
        let state = run(&[
            live(
                1,
                EventKind::WorkerProgress {
                    worker_id: "w1".to_string(),
                    status: None,
                    current_tool: None,
                    tool_calls: Some(2),
                },
            ),
            live(
                0,
                EventKind::WorkerStarted {
                    worker_id: "w1".to_string(),
                    task: "lint".to_string(),
                },
            ),
        ]);
        let worker = &state.workers["w1"];
        assert_eq!(worker.task, "lint");
        assert_eq!(worker.tool_calls, 2);
        assert_eq!(state.timeline.len(), 1);
    }

    #[test]
    fn test_replayed_start_after_finish_is_ignored() {
        let started = live(
            0,
            EventKind::BranchStarted {
                branch_id: "b1".to_string(),
                description: "recall".to_string(),
            },
        );
        let state = run(&[
            started.clone(),
            live(
                3,
                EventKind::BranchFinished {
                    branch_id: "b1".to_string(),
                    conclusion: "found it".to_string(),
                },
            ),
            started,
        ]);
        assert!(state.branches.is_empty());
        assert_eq!(state.timeline.len(), 1);
    }

    #[test]
    fn test_message_replay_is_idempotent() {
        let before = Arc::new(run(&[message("m1", 0, "hello"), message("m2", 1, "there")]));
        let replayed = apply(&before, &message("m1", 0, "hello"));
        assert!(Arc::ptr_eq(&before, &replayed));
        assert_eq!(ids(&replayed), vec!["m1", "m2"]);
    }

    #[test]
    fn test_replay_without_backend_timestamp_keeps_order() {
        let decode = |data: &str| {
            let frame = SseFrame {
                event: None,
                data: data.to_string(),
            };
            ChannelAction::Live(LiveEvent::decode(&frame).unwrap())
        };
        let m1 = r#"{"type":"message","channel_id":"c1","id":"m1","role":"user","content":"hi"}"#;
        let m2 = r#"{"type":"message","channel_id":"c1","id":"m2","role":"assistant","content":"hello"}"#;

        let mut state = Arc::new(ChannelLiveState::default());
        state = apply(&state, &decode(m1));
        std::thread::sleep(std::time::Duration::from_millis(5));
        state = apply(&state, &decode(m2));
        std::thread::sleep(std::time::Duration::from_millis(5));

        let replayed = apply(&state, &decode(m1));
        assert!(Arc::ptr_eq(&state, &replayed));
        assert_eq!(ids(&replayed), vec!["m1", "m2"]);
    }

    #[test]
    fn test_message_with_same_id_is_replaced_not_duplicated() {
        let state = run(&[message("m1", 0, "draft"), message("m2", 1, "x"), message("m1", 0, "final")]);
        assert_eq!(ids(&state), vec!["m1", "m2"]);
        match &state.timeline[0] {
            TimelineItem::Message { content, .. } => assert_eq!(content, "final"),
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[test]
    fn test_out_of_order_arrival_is_sorted() {
        let state = run(&[message("late", 10, "b"), message("early", 5, "a")]);
        assert_eq!(ids(&state), vec!["early", "late"]);
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let state = run(&[
            message("first", 5, "a"),
            live(
                5,
                EventKind::WorkerStarted {
                    worker_id: "second".to_string(),
                    task: "t".to_string(),
                },
            ),
            message("third", 5, "c"),
        ]);
        assert_eq!(ids(&state), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_branch_tool_activity_tracks_last_tool() {
        let state = run(&[
            live(
                0,
                EventKind::BranchStarted {
                    branch_id: "b1".to_string(),
                    description: "research".to_string(),
                },
            ),
            live(
                1,
                EventKind::ToolStarted {
                    process_type: ProcessKind::Branch,
                    process_id: "b1".to_string(),
                    tool_name: "memory_recall".to_string(),
                },
            ),
            live(
                2,
                EventKind::ToolCompleted {
                    process_type: ProcessKind::Branch,
                    process_id: "b1".to_string(),
                    tool_name: "memory_recall".to_string(),
                },
            ),
        ]);
        let branch = &state.branches["b1"];
        assert_eq!(branch.current_tool, None);
        assert_eq!(branch.last_tool.as_deref(), Some("memory_recall"));
        assert_eq!(branch.display_tool(), Some("memory_recall"));
        assert_eq!(branch.tool_calls, 1);
    }

    #[test]
    fn test_worker_tool_started_counts_calls() {
        let tool = |name: &str| {
            live(
                1,
                EventKind::ToolStarted {
                    process_type: ProcessKind::Worker,
                    process_id: "w1".to_string(),
                    tool_name: name.to_string(),
                },
            )
        };
        let state = run(&[tool("shell"), tool("file")]);
        let worker = &state.workers["w1"];
        assert_eq!(worker.tool_calls, 2);
        assert_eq!(worker.current_tool.as_deref(), Some("file"));
    }

    #[test]
    fn test_typing_start_stop_and_expiry() {
        let mut state = run(&[live(0, EventKind::TypingStart {})]);
        assert!(state.is_typing);

        let not_yet = ChannelAction::TypingExpired {
            now: at(10),
            timeout: Duration::seconds(15),
        };
        assert!(!reduce(&mut state, &not_yet));
        assert!(state.is_typing);

        let expired = ChannelAction::TypingExpired {
            now: at(15),
            timeout: Duration::seconds(15),
        };
        assert!(reduce(&mut state, &expired));
        assert!(!state.is_typing);
        assert_eq!(state.typing_since, None);

        reduce(&mut state, &live(20, EventKind::TypingStart {}));
        reduce(&mut state, &live(21, EventKind::TypingStop {}));
        assert!(!state.is_typing);
    }

    #[test]
    fn test_typing_expiry_counts_from_arrival_not_backend_clock() {
        // Backend clock runs 20s behind the client
        let mut event = LiveEvent::new("c1", at(-20), EventKind::TypingStart {});
        event.received_at = at(0);
        let mut state = run(&[ChannelAction::Live(event)]);
        assert_eq!(state.typing_since, Some(at(0)));

        let sweep = |secs| ChannelAction::TypingExpired {
            now: at(secs),
            timeout: Duration::seconds(15),
        };
        assert!(!reduce(&mut state, &sweep(1)));
        assert!(state.is_typing);
        assert!(reduce(&mut state, &sweep(15)));
        assert!(!state.is_typing);
    }

    #[test]
    fn test_repeated_typing_start_refreshes_timeout() {
        let mut state = run(&[live(0, EventKind::TypingStart {}), live(10, EventKind::TypingStart {})]);
        let action = ChannelAction::TypingExpired {
            now: at(20),
            timeout: Duration::seconds(15),
        };
        assert!(!reduce(&mut state, &action));
        assert!(state.is_typing);
    }

    #[test]
    fn test_history_merge_does_not_duplicate_live_items() {
        let mut state = run(&[
            message("m2", 2, "live"),
            live(
                3,
                EventKind::WorkerStarted {
                    worker_id: "w1".to_string(),
                    task: "build".to_string(),
                },
            ),
        ]);
        let history = vec![
            TimelineItem::Message {
                id: "m1".to_string(),
                role: Role::Assistant,
                content: "older".to_string(),
                created_at: at(1),
                sender_name: None,
            },
            TimelineItem::Message {
                id: "m2".to_string(),
                role: Role::User,
                content: "stale copy".to_string(),
                created_at: at(2),
                sender_name: Some("ada".to_string()),
            },
            TimelineItem::WorkerRun {
                id: "w1".to_string(),
                task: "build".to_string(),
                started_at: at(3),
                result: None,
            },
        ];
        assert!(reduce(&mut state, &ChannelAction::History(history.clone())));
        assert_eq!(ids(&state), vec!["m1", "m2", "w1"]);
        // Live copy of m2 wins
        match state.item("m2") {
            Some(TimelineItem::Message { content, .. }) => assert_eq!(content, "live"),
            other => panic!("unexpected item: {other:?}"),
        }
        assert!(state.workers.contains_key("w1"));

        // Merging the same history again changes nothing
        assert!(!reduce(&mut state, &ChannelAction::History(history)));
    }

    #[test]
    fn test_history_with_finished_run_closes_active_entry() {
        let mut state = run(&[live(
            0,
            EventKind::WorkerStarted {
                worker_id: "w1".to_string(),
                task: "deploy".to_string(),
            },
        )]);
        let history = vec![TimelineItem::WorkerRun {
            id: "w1".to_string(),
            task: "deploy".to_string(),
            started_at: at(0),
            result: Some("shipped".to_string()),
        }];
        assert!(reduce(&mut state, &ChannelAction::History(history)));
        assert!(state.workers.is_empty());
        assert_eq!(
            state.item("w1"),
            Some(&TimelineItem::WorkerRun {
                id: "w1".to_string(),
                task: "deploy".to_string(),
                started_at: at(0),
                result: Some("shipped".to_string()),
            })
        );
    }

    #[test]
    fn test_apply_returns_new_snapshot_on_change() {
        let empty = Arc::new(ChannelLiveState::default());
        let next = apply(&empty, &message("m1", 0, "hi"));
        assert!(!Arc::ptr_eq(&empty, &next));
        // The previous snapshot is untouched
        assert!(empty.timeline.is_empty());
        assert_eq!(next.messages().count(), 1);
    }

    // ── Properties ────────────────────────────────────────────────────────────

    proptest! {
        #[test]
        fn prop_started_then_finished_leaves_only_result(
            ids in proptest::collection::btree_set("[a-z]{1,6}", 1..8),
        ) {
            let mut actions = Vec::new();
            for (i, id) in ids.iter().enumerate() {
                actions.push(live(i as i64, EventKind::WorkerStarted {
                    worker_id: id.clone(),
                    task: format!("task {id}"),
                }));
            }
            for id in &ids {
                actions.push(live(100, EventKind::WorkerFinished {
                    worker_id: id.clone(),
                    result: format!("done {id}"),
                }));
            }
            let state = run(&actions);
            prop_assert!(state.workers.is_empty());
            prop_assert_eq!(state.timeline.len(), ids.len());
            for id in &ids {
                match state.item(id) {
                    Some(TimelineItem::WorkerRun { result, .. }) => {
                        prop_assert_eq!(result.clone(), Some(format!("done {id}")));
                    }
                    other => prop_assert!(false, "missing worker_run for {}: {:?}", id, other),
                }
            }
        }

        #[test]
        fn prop_timeline_sorted_regardless_of_arrival(
            stamps in proptest::collection::vec(0i64..1_000, 1..40),
        ) {
            let actions: Vec<_> = stamps
                .iter()
                .enumerate()
                .map(|(i, secs)| message(&format!("m{i}"), *secs, "x"))
                .collect();
            let state = run(&actions);
            prop_assert_eq!(state.timeline.len(), stamps.len());
            for pair in state.timeline.windows(2) {
                prop_assert!(pair[0].timestamp() <= pair[1].timestamp());
            }
        }

        #[test]
        fn prop_replaying_messages_is_idempotent(
            stamps in proptest::collection::vec(0i64..50, 1..20),
        ) {
            let actions: Vec<_> = stamps
                .iter()
                .enumerate()
                .map(|(i, secs)| message(&format!("m{i}"), *secs, "x"))
                .collect();
            let once = run(&actions);
            let mut twice = once.clone();
            for action in &actions {
                reduce(&mut twice, action);
            }
            prop_assert_eq!(once, twice);
        }
    }
}

//! Routes live events to per-channel reducers and owns every channel snapshot.
//!
//! `Dispatcher` is the synchronous core; `LiveContext` wraps it together with the
//! connection so a single task can drive everything from one `select!`.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::debug;

use crate::api::ChannelInfo;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::events::{LiveEvent, TimelineItem};
use crate::reducer::{self, ChannelAction, ChannelLiveState};

/// How often open typing indicators are checked for expiry.
const TYPING_SWEEP: Duration = Duration::from_secs(1);

/// Active worker/branch counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Activity {
    pub workers: usize,
    pub branches: usize,
}

impl Activity {
    pub fn is_idle(&self) -> bool {
        self.workers == 0 && self.branches == 0
    }

    fn add(&mut self, state: &ChannelLiveState) {
        self.workers += state.workers.len();
        self.branches += state.branches.len();
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Dispatcher {
    channels: HashMap<String, Arc<ChannelLiveState>>,
    empty: Arc<ChannelLiveState>,
    typing_timeout: chrono::Duration,
}

impl Dispatcher {
    pub fn new(typing_timeout: Duration) -> Self {
        Self {
            channels: HashMap::new(),
            empty: Arc::new(ChannelLiveState::default()),
            typing_timeout: chrono::Duration::from_std(typing_timeout)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Current snapshot of a channel; an empty state if nothing arrived for it yet.
    pub fn state_of(&self, channel_id: &str) -> Arc<ChannelLiveState> {
        self.channels
            .get(channel_id)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.empty))
    }

    /// Apply one live event. Returns whether its channel's snapshot changed.
    pub fn dispatch(&mut self, event: LiveEvent) -> bool {
        debug!(kind = event.kind_name(), channel = %event.channel_id, "dispatching");
        let channel_id = event.channel_id.clone();
        self.apply(channel_id, ChannelAction::Live(event))
    }

    /// Merge previously fetched timeline entries into a channel.
    pub fn load_history(&mut self, channel_id: &str, items: Vec<TimelineItem>) -> bool {
        if items.is_empty() {
            return false;
        }
        self.apply(channel_id.to_string(), ChannelAction::History(items))
    }

    /// Close typing indicators older than the timeout. Returns the channels that changed.
    pub fn expire_typing(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let typing: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, state)| state.is_typing)
            .map(|(id, _)| id.clone())
            .collect();

        let mut changed = Vec::new();
        for channel_id in typing {
            let action = ChannelAction::TypingExpired {
                now,
                timeout: self.typing_timeout,
            };
            if self.apply(channel_id.clone(), action) {
                debug!(channel = %channel_id, "typing indicator expired");
                changed.push(channel_id);
            }
        }
        changed
    }

    pub fn live_states(&self) -> impl Iterator<Item = (&str, &Arc<ChannelLiveState>)> {
        self.channels.iter().map(|(id, state)| (id.as_str(), state))
    }

    /// Active workers and branches per agent, for channels with live state.
    pub fn activity_by_agent(&self, channels: &[ChannelInfo]) -> BTreeMap<String, Activity> {
        let mut by_agent: BTreeMap<String, Activity> = BTreeMap::new();
        for channel in channels {
            if let Some(state) = self.channels.get(&channel.id) {
                by_agent
                    .entry(channel.agent_id.clone())
                    .or_default()
                    .add(state);
            }
        }
        by_agent
    }

    pub fn totals(&self) -> Activity {
        let mut total = Activity::default();
        for (_, state) in self.live_states() {
            total.add(state);
        }
        total
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }

    fn apply(&mut self, channel_id: String, action: ChannelAction) -> bool {
        let slot = self
            .channels
            .entry(channel_id)
            .or_insert_with(|| Arc::clone(&self.empty));
        let next = reducer::apply(slot, &action);
        let changed = !Arc::ptr_eq(slot, &next);
        *slot = next;
        changed
    }
}

// ── Live context ──────────────────────────────────────────────────────────────

/// One per client session: the connection, its event feed and the dispatcher.
pub struct LiveContext {
    connection: ConnectionManager,
    feed: mpsc::UnboundedReceiver<LiveEvent>,
    dispatcher: Dispatcher,
    typing_sweep: Interval,
}

impl LiveContext {
    pub fn new(
        connection: ConnectionManager,
        feed: mpsc::UnboundedReceiver<LiveEvent>,
        typing_timeout: Duration,
    ) -> Self {
        let mut typing_sweep = tokio::time::interval(TYPING_SWEEP);
        typing_sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            connection,
            feed,
            dispatcher: Dispatcher::new(typing_timeout),
            typing_sweep,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn state_of(&self, channel_id: &str) -> Arc<ChannelLiveState> {
        self.dispatcher.state_of(channel_id)
    }

    pub fn load_history(&mut self, channel_id: &str, items: Vec<TimelineItem>) -> bool {
        self.dispatcher.load_history(channel_id, items)
    }

    /// Wait for the next event or typing sweep and return the channels whose
    /// snapshot changed (possibly none). `None` once the feed has closed.
    pub async fn pump(&mut self) -> Option<Vec<String>> {
        tokio::select! {
            biased;
            event = self.feed.recv() => {
                let event = event?;
                let channel_id = event.channel_id.clone();
                if self.dispatcher.dispatch(event) {
                    Some(vec![channel_id])
                } else {
                    Some(Vec::new())
                }
            }
            _ = self.typing_sweep.tick() => Some(self.dispatcher.expire_typing(Utc::now())),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub fn reconnect(&self) {
        self.connection.reconnect();
    }

    /// Tear down the connection and drop every snapshot.
    pub async fn shutdown(&mut self) {
        self.connection.shutdown().await;
        self.feed.close();
        self.dispatcher.clear();
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::task::AbortHandle;

/// Longest poll title or option label.
pub const MAX_POLL_TEXT: usize = 255;

static NEXT_POLL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Open,
    Closed,
}

/// A vote tally: one active choice per voter, counts kept in step.
#[derive(Debug)]
pub struct Poll {
    id: u64,
    pub initiator: String,
    pub title: String,
    pub options: Vec<String>,
    counts: Vec<u32>,
    votes: HashMap<String, usize>,
    obscured: bool,
    state: PollState,
    timestamp: i64,
    expiry: Option<AbortHandle>,
}

impl Poll {
    pub fn new(initiator: &str, title: &str, options: Vec<String>, obscured: bool) -> Self {
        let options: Vec<String> = options.into_iter().map(|o| clip(&o)).collect();
        Self {
            id: NEXT_POLL_ID.fetch_add(1, Ordering::Relaxed),
            initiator: initiator.to_string(),
            title: clip(title),
            counts: vec![0; options.len()],
            options,
            votes: HashMap::new(),
            obscured,
            state: PollState::Open,
            timestamp: Utc::now().timestamp_millis(),
            expiry: None,
        }
    }

    /// The single-option tally used for skip voting.
    pub fn voteskip() -> Self {
        Self::new("voteskip", "voteskip", vec!["yes".to_string()], false)
    }

    /// Identity of this poll instance, used to bind its expiry timer.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn is_obscured(&self) -> bool {
        self.obscured
    }

    pub fn counts(&self) -> &[u32] {
        &self.counts
    }

    pub fn voters(&self) -> usize {
        self.votes.len()
    }

    /// Record `voter`'s choice, replacing any earlier one. Out-of-range
    /// options and votes on a closed poll are refused.
    pub fn vote(&mut self, voter: &str, option: usize) -> bool {
        if self.state == PollState::Closed || option >= self.counts.len() {
            return false;
        }
        if let Some(previous) = self.votes.insert(voter.to_string(), option)
            && let Some(count) = self.counts.get_mut(previous)
        {
            *count = count.saturating_sub(1);
        }
        self.counts[option] += 1;
        true
    }

    /// Withdraw `voter`'s choice. No-op when they have none.
    pub fn unvote(&mut self, voter: &str) -> bool {
        match self.votes.remove(voter) {
            Some(previous) => {
                if let Some(count) = self.counts.get_mut(previous) {
                    *count = count.saturating_sub(1);
                }
                true
            }
            None => false,
        }
    }

    /// Close the poll. Closing always reveals obscured results.
    pub fn close(&mut self) {
        self.state = PollState::Closed;
        self.obscured = false;
        self.cancel_expiry();
    }

    /// Attach the expiry timer. Any previous timer is cancelled.
    pub fn set_expiry(&mut self, handle: AbortHandle) {
        self.cancel_expiry();
        self.expiry = Some(handle);
    }

    fn cancel_expiry(&mut self) {
        if let Some(handle) = self.expiry.take() {
            handle.abort();
        }
    }

    /// Wire form. While obscured, members without `show_hidden` see `"?"`
    /// for every count; those with it see the count marked with `?`.
    pub fn pack(&self, show_hidden: bool) -> PollPacket {
        let counts = self
            .counts
            .iter()
            .map(|c| match (self.obscured, show_hidden) {
                (false, _) => Value::from(*c),
                (true, true) => Value::from(format!("{c}?")),
                (true, false) => Value::from("?"),
            })
            .collect();
        PollPacket {
            title: self.title.clone(),
            options: self.options.clone(),
            counts,
            initiator: self.initiator.clone(),
            timestamp: self.timestamp,
        }
    }
}

impl Drop for Poll {
    fn drop(&mut self) {
        self.cancel_expiry();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollPacket {
    pub title: String,
    pub options: Vec<String>,
    pub counts: Vec<Value>,
    pub initiator: String,
    pub timestamp: i64,
}

/// Skip-vote tally sent as `voteskip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VoteskipPacket {
    pub count: u32,
    pub need: usize,
}

/// Votes needed for a skip with `eligible` voters.
pub fn voteskip_needed(eligible: usize, ratio: f64) -> usize {
    (eligible as f64 * ratio).ceil().max(0.0) as usize
}

pub fn voteskip_passes(votes: u32, eligible: usize, ratio: f64) -> bool {
    votes as usize >= voteskip_needed(eligible, ratio)
}

fn clip(s: &str) -> String {
    s.chars().take(MAX_POLL_TEXT).collect()
}

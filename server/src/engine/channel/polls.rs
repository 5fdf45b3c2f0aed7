use std::time::Duration;

use super::{Channel, ChannelState};
use crate::engine::events::ChannelEvent;
use crate::engine::member::MemberId;
use crate::engine::permissions::{LEADER_RANK, PermissionKey};
use crate::engine::poll::{Poll, VoteskipPacket, voteskip_needed, voteskip_passes};

impl ChannelState {
    /// Members whose skip vote counts: they hold `voteskip` and are not AFK.
    pub fn voteskip_eligible(&self) -> usize {
        self.members
            .iter()
            .filter(|m| !m.meta.afk && self.member_allows(m, PermissionKey::Voteskip))
            .count()
    }

    pub fn voteskip_packet(&self) -> VoteskipPacket {
        match &self.voteskip {
            Some(vs) => VoteskipPacket {
                count: vs.counts().first().copied().unwrap_or(0),
                need: voteskip_needed(self.voteskip_eligible(), self.opts.voteskip_ratio),
            },
            None => VoteskipPacket { count: 0, need: 0 },
        }
    }

    pub fn send_voteskip_update(&self) {
        let packet = ChannelEvent::Voteskip(self.voteskip_packet());
        self.send_where(|m| m.rank >= LEADER_RANK, packet);
    }

    /// Skip the current item if enough eligible members voted for it.
    /// Returns false when no skip vote is in progress.
    pub fn check_voteskip_pass(&mut self) -> bool {
        if !self.opts.allow_voteskip || self.playlist.is_empty() {
            return false;
        }
        let Some(vs) = &self.voteskip else {
            return false;
        };

        let votes = vs.counts().first().copied().unwrap_or(0);
        if voteskip_passes(votes, self.voteskip_eligible(), self.opts.voteskip_ratio) {
            let title = self
                .playlist
                .current()
                .map(|it| format!(" {}", it.media.title))
                .unwrap_or_default();
            self.log
                .log(format!("[playlist] Voteskip passed, skipping{title}"));
            self.advance();
        }
        self.send_voteskip_update();
        true
    }

    /// Send the current tally; obscured counts depend on `viewhiddenpoll`.
    pub fn send_poll_update(&self) {
        let Some(poll) = &self.poll else {
            return;
        };
        let shown = ChannelEvent::UpdatePoll(poll.pack(true));
        let hidden = ChannelEvent::UpdatePoll(poll.pack(false));
        for m in &self.members {
            if self.member_allows(m, PermissionKey::ViewHiddenPoll) {
                m.send(shown.clone());
            } else {
                m.send(hidden.clone());
            }
        }
    }

    fn send_new_poll(&self) {
        let Some(poll) = &self.poll else {
            return;
        };
        let shown = ChannelEvent::NewPoll(poll.pack(true));
        let hidden = ChannelEvent::NewPoll(poll.pack(false));
        for m in &self.members {
            if self.member_allows(m, PermissionKey::ViewHiddenPoll) {
                m.send(shown.clone());
            } else {
                m.send(hidden.clone());
            }
        }
    }

    /// Close the active poll, revealing obscured results first.
    pub fn close_poll(&mut self, closed_by: &str) {
        let Some(poll) = self.poll.as_mut() else {
            return;
        };
        let was_obscured = poll.is_obscured();
        poll.close();
        if was_obscured {
            self.send_poll_update();
        }
        self.poll = None;
        self.log
            .log(format!("[poll] {closed_by} closed the active poll"));
        self.send_all(ChannelEvent::ClosePoll);
    }
}

impl Channel {
    pub(super) fn handle_new_poll(
        &self,
        id: MemberId,
        title: String,
        opts: Vec<String>,
        obscured: bool,
        timeout: Option<u64>,
    ) {
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if !st.allows(actor.rank, PermissionKey::PollCtl) {
            return;
        }

        let mut poll = Poll::new(&actor.name, &title, opts, obscured);
        if let Some(secs) = timeout.filter(|s| *s > 0) {
            let me = self.me.clone();
            let poll_id = poll.id();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                let Some(channel) = me.upgrade() else {
                    return;
                };
                if channel.is_dead() {
                    return;
                }
                let mut st = channel.state.lock();
                if st.poll.as_ref().is_some_and(|p| p.id() == poll_id) {
                    st.close_poll("[poll timer]");
                }
            });
            poll.set_expiry(timer.abort_handle());
        }

        st.log.log(format!(
            "[poll] {} Opened Poll: '{}'",
            actor.name, poll.title
        ));
        // Replacing drops the previous poll, cancelling its timer
        st.poll = Some(poll);
        st.send_new_poll();
    }

    pub(super) fn handle_close_poll(&self, id: MemberId) {
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if !st.allows(actor.rank, PermissionKey::PollCtl) {
            return;
        }
        st.close_poll(&actor.name);
    }

    pub(super) fn handle_vote(&self, id: MemberId, option: usize) {
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if !st.allows(actor.rank, PermissionKey::PollVote) {
            return;
        }
        if let Some(poll) = st.poll.as_mut()
            && poll.vote(&actor.ip, option)
        {
            st.send_poll_update();
        }
    }

    pub(super) fn handle_voteskip(&self, id: MemberId) {
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if !st.opts.allow_voteskip || !st.allows(actor.rank, PermissionKey::Voteskip) {
            return;
        }

        st.set_afk(id, false);
        st.voteskip
            .get_or_insert_with(Poll::voteskip)
            .vote(&actor.ip, 0);

        let who = if actor.name.is_empty() {
            "anonymous"
        } else {
            actor.name.as_str()
        };
        let title = st
            .playlist
            .current()
            .map(|it| format!(" {}", it.media.title))
            .unwrap_or_default();
        st.log
            .log(format!("[playlist] {who} voteskipped{title}"));
        st.check_voteskip_pass();
    }
}

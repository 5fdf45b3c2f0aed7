use std::sync::Arc;

use tracing::{info, warn};

use super::{Channel, ChannelState, MuteKind};
use crate::engine::error::JoinError;
use crate::engine::events::ChannelEvent;
use crate::engine::member::{Member, MemberId, Recipient, normalize_ip};
use crate::engine::permissions::{LEADER_RANK, MODERATOR_RANK, PermissionKey};

/// A connection asking to enter a room.
pub struct JoinRequest {
    /// Empty for anonymous viewers.
    pub name: String,
    pub ip: String,
    pub password: Option<String>,
    pub recipient: Arc<dyn Recipient>,
}

impl Channel {
    /// Admit a member: resolve rank, apply the password gate and bans, then
    /// send the joiner the full room state and announce them.
    pub async fn join(&self, req: JoinRequest) -> Result<MemberId, JoinError> {
        if !self.wait_ready().await {
            return Err(JoinError::Dead);
        }

        let ip = normalize_ip(&req.ip);
        let named = !req.name.is_empty();
        let registered = self.is_registered();
        let db = self.services.db.clone();

        let global_rank = if named {
            db.global_rank(&req.name).await.unwrap_or_else(|e| {
                warn!(channel = %self.key, name = %req.name, error = %e, "global rank lookup failed");
                0.0
            })
        } else {
            0.0
        };
        let channel_rank = if named && registered {
            db.channel_rank(&self.key, &req.name)
                .await
                .unwrap_or_else(|e| {
                    warn!(channel = %self.key, name = %req.name, error = %e, "channel rank lookup failed");
                    0.0
                })
        } else {
            0.0
        };
        let rank = global_rank.max(channel_rank);
        if self.is_dead() {
            return Err(JoinError::Dead);
        }

        let password = self.state.lock().opts.password.clone();
        if let Some(expected) = password
            && rank < MODERATOR_RANK
        {
            match &req.password {
                Some(given) if *given == expected => {
                    req.recipient.send(ChannelEvent::CancelNeedPassword);
                }
                given => {
                    req.recipient
                        .send(ChannelEvent::NeedPassword(given.is_some()));
                    return Err(JoinError::PasswordRequired);
                }
            }
        }

        if registered {
            let ip_banned = db.is_ip_banned(&self.key, &ip).await.unwrap_or_else(|e| {
                warn!(channel = %self.key, error = %e, "ip ban lookup failed");
                false
            });
            let name_banned = named
                && db
                    .is_name_banned(&self.key, &req.name)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(channel = %self.key, error = %e, "name ban lookup failed");
                        false
                    });
            if ip_banned || name_banned {
                req.recipient.kick(&JoinError::Banned.to_string());
                return Err(JoinError::Banned);
            }
        }

        let mut aliases = Vec::new();
        if named {
            if let Err(e) = db.record_alias(&ip, &req.name).await {
                warn!(channel = %self.key, error = %e, "alias record failed");
            }
            aliases = db.aliases(&ip).await.unwrap_or_default();
            if aliases.is_empty() {
                aliases = vec![req.name.clone()];
            }
        }
        if self.is_dead() {
            return Err(JoinError::Dead);
        }

        let mut member = Member::new(&req.name, &ip, global_rank, req.recipient);
        member.rank = rank;
        member.meta.aliases = aliases.clone();

        let id = member.id;
        let mut st = self.state.lock();
        if self.is_dead() {
            return Err(JoinError::Dead);
        }
        if named {
            let duplicates: Vec<MemberId> = st
                .members
                .iter()
                .filter(|m| m.is_named() && m.name.eq_ignore_ascii_case(&req.name))
                .map(|m| m.id)
                .collect();
            for old in duplicates {
                if let Some(m) = st.remove_member(old) {
                    m.kick("Duplicate login");
                }
            }
            match st.mute_of(&req.name) {
                Some(MuteKind::Shadow) => {
                    member.meta.muted = true;
                    member.meta.smuted = true;
                }
                Some(MuteKind::Muted) => member.meta.muted = true,
                None => {}
            }
        }
        st.members.push(member);
        st.send_join_state(id);

        st.send_voteskip_update();
        st.send_usercount();

        if named {
            if let Some(joined) = st.member(id) {
                for m in st.members.iter().filter(|m| m.id != id) {
                    m.send(ChannelEvent::AddUser(joined.view(m.view_tier())));
                }
            }
            st.send_mod_message(
                &format!("{} joined (aliases: {})", req.name, aliases.join(",")),
                MODERATOR_RANK,
            );
        }

        st.log.log(format!("[login] {ip} joined"));
        info!(channel = %self.key, name = %req.name, "member joined");
        Ok(id)
    }

    /// Remove a member. Returns true when the room is now empty.
    pub fn part(&self, id: MemberId) -> bool {
        let mut st = self.state.lock();
        if let Some(m) = st.remove_member(id) {
            st.log.log(format!("[login] {} ({}) left", m.ip, m.name));
            info!(channel = %self.key, name = %m.name, "member left");
        }
        st.members.is_empty()
    }

    pub(super) fn handle_assign_leader(&self, id: MemberId, name: &str) {
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if !st.allows(actor.rank, PermissionKey::LeaderCtl) {
            st.kick_member(id, "Attempted assignLeader with insufficient permission");
            return;
        }
        st.change_leader(name);
        st.log
            .log(format!("[mod] {} assigned leader to {name}", actor.name));
    }
}

impl ChannelState {
    /// Everything a new member needs to render the room.
    fn send_join_state(&self, id: MemberId) {
        let Some(joiner) = self.member(id) else {
            return;
        };
        let tier = joiner.view_tier();

        joiner.send(ChannelEvent::Rank(joiner.rank));
        if !self.registered {
            joiner.send(ChannelEvent::ChannelNotRegistered);
        }
        if self.member_allows(joiner, PermissionKey::SeePlaylist) {
            self.send_playlist(Some(id));
        }
        if let Some(update) = self.playlist.snapshot_for_join(std::time::Instant::now())
            && let Some(uid) = self.playlist.current_uid()
        {
            joiner.send(ChannelEvent::ChangeMedia(update));
            joiner.send(ChannelEvent::SetCurrent(uid));
        }
        joiner.send(ChannelEvent::SetPlaylistLocked(self.playlist_locked));

        let userlist = self
            .members
            .iter()
            .filter(|m| m.is_named())
            .map(|m| m.view(tier))
            .collect();
        joiner.send(ChannelEvent::Userlist(userlist));
        if let Some(leader) = self.leader.and_then(|l| self.member(l)) {
            joiner.send(ChannelEvent::SetLeader(leader.name.clone()));
        }

        joiner.send(ChannelEvent::EmoteList(self.emotes.as_slice().to_vec()));
        for msg in self.history.iter() {
            joiner.send(ChannelEvent::ChatMsg(msg.clone()));
        }
        joiner.send(ChannelEvent::ChannelCssJs {
            css: self.css.clone(),
            js: self.js.clone(),
        });
        if let Some(poll) = &self.poll {
            let hidden = self.member_allows(joiner, PermissionKey::ViewHiddenPoll);
            joiner.send(ChannelEvent::NewPoll(poll.pack(hidden)));
        }
        joiner.send(ChannelEvent::ChannelOpts(self.opts.clone()));
        joiner.send(ChannelEvent::SetPermissions(self.permissions.clone()));
        joiner.send(ChannelEvent::SetMotd(self.motd.clone()));
        joiner.send(ChannelEvent::DrinkCount(self.drinks));
    }

    /// Detach a member and undo everything tied to them.
    pub fn remove_member(&mut self, id: MemberId) -> Option<Member> {
        let idx = self.members.iter().position(|m| m.id == id)?;
        let ip = self.members[idx].ip.clone();

        if let Some(poll) = self.poll.as_mut()
            && poll.unvote(&ip)
        {
            self.send_poll_update();
        }
        if let Some(voteskip) = self.voteskip.as_mut() {
            voteskip.unvote(&ip);
            self.send_voteskip_update();
        }
        if self.leader == Some(id) {
            self.change_leader("");
        }

        let member = self.members.remove(idx);
        self.check_voteskip_pass();
        self.send_usercount();
        if member.is_named() {
            self.send_all(ChannelEvent::UserLeave {
                name: member.name.clone(),
            });
        }
        Some(member)
    }

    /// Send the kick notice and close the member's connection. Cleanup
    /// happens when the connection reports its departure.
    pub fn kick_member(&self, id: MemberId, reason: &str) {
        if let Some(m) = self.member(id) {
            m.kick(reason);
        }
    }

    /// Hand playback control to `name`, or back to the server when empty.
    pub fn change_leader(&mut self, name: &str) {
        if let Some(old) = self.leader.take()
            && let Some(m) = self.member_mut(old)
            && m.rank == LEADER_RANK
        {
            m.rank = m.old_rank.take().unwrap_or(m.global_rank);
            m.send(ChannelEvent::Rank(m.rank));
            let (old_name, rank) = (m.name.clone(), m.rank);
            self.send_user_rank(&old_name, rank);
        }

        if name.is_empty() {
            self.send_all(ChannelEvent::SetLeader(String::new()));
            self.log.log("[playlist] Resuming autolead");
            let position = self.playlist.current().map(|it| it.media.current_time);
            if position.is_some() {
                self.playlist.start_playback(position);
            }
            return;
        }

        let Some(target) = self.member_by_name(name).map(|m| m.id) else {
            return;
        };
        self.leader = Some(target);
        self.send_all(ChannelEvent::SetLeader(name.to_string()));
        self.log.log(format!("[playlist] Assigned leader: {name}"));

        if let Some(m) = self.member_mut(target)
            && m.rank < LEADER_RANK
        {
            m.old_rank = Some(m.rank);
            m.rank = LEADER_RANK;
            m.send(ChannelEvent::Rank(LEADER_RANK));
            let leader_name = m.name.clone();
            self.send_user_rank(&leader_name, LEADER_RANK);
        }
    }

    /// Flip a member's AFK flag. Going AFK withdraws their skip vote.
    pub fn set_afk(&mut self, id: MemberId, afk: bool) {
        let Some(m) = self.member_mut(id) else {
            return;
        };
        if m.meta.afk == afk {
            return;
        }
        m.meta.afk = afk;
        let ip = m.ip.clone();

        if afk && let Some(voteskip) = self.voteskip.as_mut() {
            voteskip.unvote(&ip);
        }
        self.send_user_meta(id);
        self.check_voteskip_pass();
    }

    /// Push a new rank to a connected member and everyone's user list.
    pub fn apply_rank(&mut self, id: MemberId, rank: f64) {
        let Some(m) = self.member_mut(id) else {
            return;
        };
        m.rank = rank;
        if m.old_rank.is_some() {
            m.old_rank = Some(rank);
        }
        m.send(ChannelEvent::Rank(rank));
        if m.is_named() {
            let name = m.name.clone();
            self.send_user_rank(&name, rank);
        }
    }
}

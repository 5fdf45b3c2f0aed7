use std::time::Instant;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{Actor, Channel, ChannelState, MAX_CSS_JS_LENGTH, MuteKind};
use crate::engine::error::LookupError;
use crate::engine::events::ChannelEvent;
use crate::engine::member::{MemberId, mask_ip, range_prefix};
use crate::engine::options::OptionWarning;
use crate::engine::permissions::{
    ADMIN_RANK, FOUNDER_RANK, MODERATOR_RANK, PermissionKey, Rank, SITE_ADMIN_RANK,
};
use crate::engine::persistence::Motd;
use crate::engine::services::{BanEntry, NAME_BAN_IP};
use crate::engine::validation::MAX_NAME_LENGTH;

const MAX_BAN_REASON_LENGTH: usize = 255;

const RANK_BOUNDS_FAIL: &str = "Updating user rank failed: You can't promote someone to equal or \
                                higher rank than yourself, or demote them below rank 1.";

/// Founders may manage other founders; everyone else only manages lower ranks.
fn outranks(actor: Rank, target: Rank) -> bool {
    target < actor || (actor == FOUNDER_RANK && target == FOUNDER_RANK)
}

/// Whether `ip` falls under a ban entry: an exact address, or a range
/// prefix ending at an octet or group boundary.
fn ip_matches(ban: &str, ip: &str) -> bool {
    ip == ban
        || ip
            .strip_prefix(ban)
            .is_some_and(|rest| rest.starts_with('.') || rest.starts_with(':'))
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

impl ChannelState {
    fn ban_threshold(&self) -> Rank {
        self.permissions
            .get(PermissionKey::Ban)
            .unwrap_or(MODERATOR_RANK)
    }

    // ── Slash commands ──────────────────────────────────────────────

    pub fn mute_by_command(&mut self, actor: &Actor, target: &str, shadow: bool) {
        if !self.allows(actor.rank, PermissionKey::Mute) {
            return;
        }
        let cmd = if shadow { "smute" } else { "mute" };
        let Some((target_id, target_name, target_rank)) = self
            .member_by_name(target)
            .map(|m| (m.id, m.name.clone(), m.rank))
        else {
            self.send_to(
                actor.id,
                ChannelEvent::error(format!("/{cmd}: {target} is not on this channel")),
            );
            return;
        };
        if target_rank >= actor.rank {
            self.send_to(
                actor.id,
                ChannelEvent::error(format!(
                    "/{cmd}: You don't have permission to mute {target_name}"
                )),
            );
            return;
        }

        let kind = if shadow { MuteKind::Shadow } else { MuteKind::Muted };
        self.mutes.insert(target_name.to_lowercase(), kind);
        if let Some(m) = self.member_mut(target_id) {
            m.meta.muted = true;
            m.meta.smuted = shadow;
        }
        self.send_user_meta(target_id);

        let verb = if shadow { "shadowmuted" } else { "muted" };
        self.log
            .log(format!("[mod] {} {verb} {target_name}", actor.name));
        let threshold = self
            .permissions
            .get(PermissionKey::Mute)
            .unwrap_or(MODERATOR_RANK);
        self.send_mod_message(&format!("{} {verb} {target_name}", actor.name), threshold);
    }

    pub fn unmute_by_command(&mut self, actor: &Actor, target: &str) {
        if !self.allows(actor.rank, PermissionKey::Mute) {
            return;
        }
        let online = self
            .member_by_name(target)
            .map(|m| (m.id, m.name.clone(), m.rank));
        if let Some((_, name, rank)) = &online
            && *rank >= actor.rank
        {
            self.send_to(
                actor.id,
                ChannelEvent::error(format!(
                    "/unmute: You don't have permission to unmute {name}"
                )),
            );
            return;
        }
        if self.mutes.remove(&target.to_lowercase()).is_none() {
            self.send_to(
                actor.id,
                ChannelEvent::error(format!("/unmute: {target} is not muted")),
            );
            return;
        }

        let name = match online {
            Some((id, name, _)) => {
                if let Some(m) = self.member_mut(id) {
                    m.meta.muted = false;
                    m.meta.smuted = false;
                }
                self.send_user_meta(id);
                name
            }
            None => target.to_string(),
        };
        self.log.log(format!("[mod] {} unmuted {name}", actor.name));
        let threshold = self
            .permissions
            .get(PermissionKey::Mute)
            .unwrap_or(MODERATOR_RANK);
        self.send_mod_message(&format!("{} unmuted {name}", actor.name), threshold);
    }

    pub fn kick_by_command(&mut self, actor: &Actor, target: &str, reason: &str) {
        if !self.allows(actor.rank, PermissionKey::Kick) {
            return;
        }
        let Some((target_id, target_name, target_rank)) = self
            .member_by_name(target)
            .map(|m| (m.id, m.name.clone(), m.rank))
        else {
            self.send_to(
                actor.id,
                ChannelEvent::error(format!("/kick: {target} is not on this channel")),
            );
            return;
        };
        if target_rank >= actor.rank {
            self.send_to(
                actor.id,
                ChannelEvent::error(format!(
                    "/kick: You don't have permission to kick {target_name}"
                )),
            );
            return;
        }

        let reason = if reason.is_empty() {
            format!("Kicked by {}", actor.name)
        } else {
            reason.to_string()
        };
        self.log.log(format!(
            "[mod] {} kicked {target_name} ({reason})",
            actor.name
        ));
        self.kick_member(target_id, &reason);
    }

    fn send_banlist_masked(&self, bans: &[BanEntry], only: Option<MemberId>) {
        let masked: Vec<_> = bans
            .iter()
            .map(|b| {
                let mut b = b.clone();
                if b.ip != NAME_BAN_IP {
                    b.ip = mask_ip(&b.ip);
                }
                b
            })
            .collect();
        for m in &self.members {
            if only.is_some_and(|id| id != m.id) || !self.member_allows(m, PermissionKey::Ban) {
                continue;
            }
            if m.global_rank >= SITE_ADMIN_RANK {
                m.send(ChannelEvent::Banlist(bans.to_vec()));
            } else {
                m.send(ChannelEvent::Banlist(masked.clone()));
            }
        }
    }
}

impl Channel {
    // ── Room settings ───────────────────────────────────────────────

    pub(super) fn handle_set_permissions(&self, id: MemberId, data: Map<String, Value>) {
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if actor.rank < ADMIN_RANK {
            st.kick_member(id, "Attempted setPermissions as a non-admin");
            return;
        }

        let touches_playlist = data.contains_key(PermissionKey::SeePlaylist.as_str());
        let rejected = st.permissions.merge_from(&Value::Object(data));
        if rejected > 0 {
            debug!(channel = %self.key, rejected, "ignored unknown permission keys");
        }
        st.log
            .log(format!("[mod] {} updated permissions", actor.name));
        let table = st.permissions.clone();
        st.send_all(ChannelEvent::SetPermissions(table));
        if touches_playlist {
            st.send_playlist(None);
        }
    }

    pub(super) fn handle_set_options(&self, id: MemberId, data: Map<String, Value>) {
        let reserved = self.services.settings.reserved_pagetitles.as_ref();
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if actor.rank < MODERATOR_RANK {
            st.kick_member(id, "Attempted setOptions as a non-moderator");
            return;
        }

        let old_afk = st.opts.afk_timeout;
        let warnings = st
            .opts
            .apply_update(&data, actor.rank >= ADMIN_RANK, reserved);
        for warning in warnings {
            match warning {
                OptionWarning::ReservedPageTitle => st.send_to(
                    id,
                    ChannelEvent::ErrorMsg {
                        msg: "That pagetitle is reserved".to_string(),
                        alert: true,
                    },
                ),
            }
        }
        if st.opts.afk_timeout != old_afk {
            let now = Instant::now();
            for m in st.members.iter_mut() {
                m.last_active = now;
            }
        }

        st.log
            .log(format!("[mod] {} updated channel options", actor.name));
        let opts = st.opts.clone();
        st.send_all(ChannelEvent::ChannelOpts(opts));
        st.check_voteskip_pass();
    }

    pub(super) fn handle_set_css(&self, id: MemberId, css: String) {
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if actor.rank < ADMIN_RANK {
            st.kick_member(id, "Attempted setChannelCSS as non-admin");
            return;
        }
        st.css = truncate(&css, MAX_CSS_JS_LENGTH);
        st.send_css_js();
        st.log
            .log(format!("[mod] {} updated the channel CSS", actor.name));
    }

    pub(super) fn handle_set_js(&self, id: MemberId, js: String) {
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if actor.rank < ADMIN_RANK {
            st.kick_member(id, "Attempted setChannelJS as non-admin");
            return;
        }
        st.js = truncate(&js, MAX_CSS_JS_LENGTH);
        st.send_css_js();
        st.log
            .log(format!("[mod] {} updated the channel JS", actor.name));
    }

    pub(super) fn handle_set_motd(&self, id: MemberId, motd: &str) {
        let sanitizer = self.services.sanitizer.as_ref();
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if !st.allows(actor.rank, PermissionKey::MotdEdit) {
            st.kick_member(id, "Attempted setMotd with insufficient permission");
            return;
        }

        let motd = sanitizer.sanitize_html(&truncate(motd, MAX_CSS_JS_LENGTH));
        let html = motd.replace('\n', "<br>");
        st.motd = Motd { motd, html };
        let update = st.motd.clone();
        st.send_all(ChannelEvent::SetMotd(update));
        st.log
            .log(format!("[mod] {} updated the MOTD", actor.name));
    }

    // ── Ranks ───────────────────────────────────────────────────────

    /// Effective rank of an account in this room.
    async fn stored_rank(&self, name: &str) -> Result<Rank, LookupError> {
        let global = self.services.db.global_rank(name).await?;
        let channel = self.services.db.channel_rank(&self.key, name).await?;
        Ok(global.max(channel))
    }

    /// Highest rank among every account seen from `ip`.
    async fn ip_rank(&self, ip: &str) -> Result<Rank, LookupError> {
        let names = self.services.db.aliases(ip).await?;
        if names.is_empty() {
            return Ok(0.0);
        }
        let global = self.services.db.global_ranks(&names).await?;
        let channel = self.services.db.channel_ranks(&self.key, &names).await?;
        Ok(global.into_iter().chain(channel).fold(0.0, Rank::max))
    }

    pub(super) fn handle_set_channel_rank(&self, id: MemberId, user: String, rank: Rank) {
        let name = truncate(&user, MAX_NAME_LENGTH);
        let actor = {
            let mut st = self.state.lock();
            let Some(a) = st.actor(id) else {
                return;
            };
            if a.rank < MODERATOR_RANK {
                st.kick_member(id, "Attempted setChannelRank as a non-moderator");
                return;
            }
            if !rank.is_finite() || rank < 1.0 || !outranks(a.rank, rank) {
                st.send_to(
                    id,
                    ChannelEvent::ChannelRankFail {
                        msg: RANK_BOUNDS_FAIL.to_string(),
                    },
                );
                return;
            }

            let online = st
                .member_by_name(&name)
                .map(|m| (m.id, m.name.clone(), m.rank.max(m.global_rank)));
            if let Some((_, receiver, current)) = &online
                && current > &a.rank
                && !(a.rank == FOUNDER_RANK && *current == FOUNDER_RANK)
            {
                st.send_to(
                    id,
                    ChannelEvent::ChannelRankFail {
                        msg: format!("Updating user rank failed: {receiver} has higher rank than you."),
                    },
                );
                return;
            }

            if !st.registered {
                if let Some((receiver_id, receiver, _)) = online {
                    st.log
                        .log(format!("[mod] {} set {receiver}'s rank to {rank}", a.name));
                    st.apply_rank(receiver_id, rank);
                }
                return;
            }
            a
        };

        self.spawn_with(move |channel| async move {
            let fail = |channel: &Channel, msg: String| {
                channel.state.lock().send_to(
                    actor.id,
                    ChannelEvent::ChannelRankFail {
                        msg: format!("Updating user rank failed: {msg}"),
                    },
                );
            };

            let old = match channel.stored_rank(&name).await {
                Ok(old) => old,
                Err(e) => {
                    fail(&channel, e.to_string());
                    return;
                }
            };
            if channel.is_dead() {
                return;
            }
            if !outranks(actor.rank, old) {
                fail(&channel, format!("{name} has equal or higher rank than you"));
                return;
            }

            let result = channel
                .services
                .db
                .set_channel_rank(&channel.key, &name, rank)
                .await;
            if channel.is_dead() {
                return;
            }
            if let Err(e) = result {
                fail(&channel, e.to_string());
                return;
            }

            let mut st = channel.state.lock();
            st.log
                .log(format!("[mod] {} set {name}'s rank to {rank}", actor.name));
            match st.member_by_name(&name).map(|m| m.id) {
                Some(receiver_id) => st.apply_rank(receiver_id, rank),
                None => st.send_user_rank(&name, rank),
            }
        });
    }

    pub(super) fn handle_request_channel_ranks(&self, id: MemberId) {
        {
            let st = self.state.lock();
            let Some(actor) = st.actor(id) else {
                return;
            };
            if actor.rank < ADMIN_RANK || !st.registered {
                return;
            }
        }
        self.spawn_with(move |channel| async move {
            let result = channel.services.db.list_channel_ranks(&channel.key).await;
            if channel.is_dead() {
                return;
            }
            let st = channel.state.lock();
            match result {
                Ok(ranks) => st.send_to(id, ChannelEvent::ChannelRanks(ranks)),
                Err(e) => st.send_to(id, ChannelEvent::error(e.to_string())),
            }
        });
    }

    // ── Bans ────────────────────────────────────────────────────────

    /// Permission and registration checks shared by the ban handlers.
    fn ban_actor(&self, id: MemberId, name: &str, unregistered_msg: &str) -> Option<Actor> {
        let st = self.state.lock();
        let actor = st.actor(id)?;
        if !st.allows(actor.rank, PermissionKey::Ban) {
            return None;
        }
        if !st.registered {
            st.send_to(id, ChannelEvent::error(unregistered_msg));
            return None;
        }
        if name.eq_ignore_ascii_case(&actor.name) {
            st.send_to(
                id,
                ChannelEvent::Costanza {
                    msg: "Trying to ban yourself?".to_string(),
                },
            );
            return None;
        }
        Some(actor)
    }

    pub(super) fn handle_name_ban(&self, id: MemberId, name: String, reason: String) {
        let Some(actor) = self.ban_actor(id, &name, "Banning is only supported in registered channels")
        else {
            return;
        };
        let name = name.to_lowercase();
        let reason = truncate(&reason, MAX_BAN_REASON_LENGTH);

        self.spawn_with(move |channel| async move {
            let rank = match channel.stored_rank(&name).await {
                Ok(rank) => rank,
                Err(e) => {
                    channel
                        .state
                        .lock()
                        .send_to(actor.id, ChannelEvent::error(format!("Internal error: {e}")));
                    return;
                }
            };
            if channel.is_dead() {
                return;
            }
            if rank >= actor.rank {
                channel.state.lock().send_to(
                    actor.id,
                    ChannelEvent::error(format!("You don't have permission to ban {name}")),
                );
                return;
            }

            {
                let st = channel.state.lock();
                if let Some(target) = st.member_by_name(&name) {
                    target.kick("You're banned!");
                }
                st.log.log(format!("[mod] {} namebanned {name}", actor.name));
                st.send_mod_message(&format!("{} banned {name}", actor.name), st.ban_threshold());
            }

            let db = channel.services.db.clone();
            match db.is_name_banned(&channel.key, &name).await {
                Ok(true) => {
                    channel
                        .state
                        .lock()
                        .send_to(actor.id, ChannelEvent::error(format!("{name} is already banned")));
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(channel = %channel.key, error = %e, "name ban lookup failed");
                }
            }
            if channel.is_dead() {
                return;
            }

            let result = db
                .add_ban(&channel.key, NAME_BAN_IP, &name, &reason, &actor.name)
                .await;
            if channel.is_dead() {
                return;
            }
            match result {
                Ok(()) => channel.refresh_banlist().await,
                Err(e) => channel
                    .state
                    .lock()
                    .send_to(actor.id, ChannelEvent::error(format!("Ban failed: {e}"))),
            }
        });
    }

    pub(super) fn handle_ban_all_ips(&self, id: MemberId, name: String, reason: String, range: bool) {
        let Some(actor) = self.ban_actor(id, &name, "Banning is not supported for unregistered rooms")
        else {
            return;
        };
        let reason = truncate(&reason, MAX_BAN_REASON_LENGTH);

        self.spawn_with(move |channel| async move {
            let ips = match channel.services.db.ips_for_name(&name).await {
                Ok(ips) => ips,
                Err(e) => {
                    channel
                        .state
                        .lock()
                        .send_to(actor.id, ChannelEvent::error(format!("Internal error: {e}")));
                    return;
                }
            };
            for ip in ips {
                if channel.is_dead() {
                    return;
                }
                channel.ban_ip(&actor, &ip, &name, &reason, range).await;
            }
        });
    }

    /// Ban one address, or the range around it, on behalf of `actor`.
    async fn ban_ip(&self, actor: &Actor, ip: &str, name: &str, reason: &str, range: bool) {
        let ip = if range { range_prefix(ip) } else { ip.to_string() };
        let masked = mask_ip(&ip);

        let rank = match self.ip_rank(&ip).await {
            Ok(rank) => rank,
            Err(e) => {
                self.state
                    .lock()
                    .send_to(actor.id, ChannelEvent::error(format!("Internal error: {e}")));
                return;
            }
        };
        if self.is_dead() {
            return;
        }
        if rank >= actor.rank {
            self.state.lock().send_to(
                actor.id,
                ChannelEvent::error(format!("You don't have permission to ban IP: {masked}")),
            );
            return;
        }

        {
            let st = self.state.lock();
            st.log
                .log(format!("[mod] {} banned {ip} ({name})", actor.name));
            st.send_mod_message(
                &format!("{} banned {masked} ({name})", actor.name),
                st.ban_threshold(),
            );
            for m in st.members.iter().filter(|m| ip_matches(&ip, &m.ip)) {
                m.kick("You're banned!");
            }
        }

        let db = self.services.db.clone();
        match db.is_ip_banned(&self.key, &ip).await {
            Ok(true) => {
                let shown = if actor.global_rank >= SITE_ADMIN_RANK {
                    ip.clone()
                } else {
                    masked
                };
                self.state
                    .lock()
                    .send_to(actor.id, ChannelEvent::error(format!("{shown} is already banned")));
                return;
            }
            Ok(false) => {}
            Err(e) => warn!(channel = %self.key, error = %e, "ip ban lookup failed"),
        }
        if self.is_dead() {
            return;
        }

        let result = db.add_ban(&self.key, &ip, name, reason, &actor.name).await;
        if self.is_dead() {
            return;
        }
        match result {
            Ok(()) => self.refresh_banlist().await,
            Err(e) => self
                .state
                .lock()
                .send_to(actor.id, ChannelEvent::error(format!("Ban failed: {e}"))),
        }
    }

    pub(super) fn handle_unban(&self, id: MemberId, ban_id: i64, name: String) {
        let actor = {
            let st = self.state.lock();
            let Some(actor) = st.actor(id) else {
                return;
            };
            if !st.allows(actor.rank, PermissionKey::Ban) || !st.registered {
                return;
            }
            actor
        };

        self.spawn_with(move |channel| async move {
            let result = channel.services.db.remove_ban(&channel.key, ban_id).await;
            if channel.is_dead() {
                return;
            }
            let st = channel.state.lock();
            match result {
                Ok(Some(entry)) => {
                    st.log
                        .log(format!("[mod] {} unbanned {}", actor.name, entry.name));
                    st.send_mod_message(
                        &format!("{} unbanned {}", actor.name, entry.name),
                        st.ban_threshold(),
                    );
                    st.send_where(
                        |m| st.member_allows(m, PermissionKey::Ban),
                        ChannelEvent::BanlistRemove {
                            id: entry.id,
                            name: entry.name,
                            actor: actor.name.clone(),
                        },
                    );
                }
                Ok(None) => st.send_to(
                    actor.id,
                    ChannelEvent::error(format!("No ban with id {ban_id} for {name}")),
                ),
                Err(e) => st.send_to(actor.id, ChannelEvent::error(e.to_string())),
            }
        });
    }

    /// Re-send the ban list to everyone holding `ban`.
    async fn refresh_banlist(&self) {
        match self.services.db.list_bans(&self.key).await {
            Ok(bans) if !self.is_dead() => self.state.lock().send_banlist_masked(&bans, None),
            Ok(_) => {}
            Err(e) => warn!(channel = %self.key, error = %e, "ban list lookup failed"),
        }
    }

    pub(super) fn handle_request_banlist(&self, id: MemberId) {
        {
            let st = self.state.lock();
            let Some(actor) = st.actor(id) else {
                return;
            };
            if !st.allows(actor.rank, PermissionKey::Ban) || !st.registered {
                return;
            }
        }
        self.spawn_with(move |channel| async move {
            let result = channel.services.db.list_bans(&channel.key).await;
            if channel.is_dead() {
                return;
            }
            let st = channel.state.lock();
            match result {
                Ok(bans) => st.send_banlist_masked(&bans, Some(id)),
                Err(e) => st.send_to(id, ChannelEvent::error(e.to_string())),
            }
        });
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub(super) fn handle_read_chan_log(&self, id: MemberId) {
        let mask = {
            let st = self.state.lock();
            let Some(actor) = st.actor(id) else {
                return;
            };
            if actor.rank < ADMIN_RANK {
                st.kick_member(id, "Attempted readChanLog with insufficient permission");
                return;
            }
            if !st.registered {
                st.send_to(
                    id,
                    ChannelEvent::ReadChanLog {
                        success: false,
                        data: "Channel log is only available to registered channels.".to_string(),
                    },
                );
                return;
            }
            actor.global_rank < SITE_ADMIN_RANK
        };

        self.spawn_with(move |channel| async move {
            let result = channel.log.read_tail(mask).await;
            if channel.is_dead() {
                return;
            }
            let event = match result {
                Ok(data) => ChannelEvent::ReadChanLog {
                    success: true,
                    data,
                },
                Err(e) => {
                    warn!(channel = %channel.key, error = %e, "room log read failed");
                    ChannelEvent::ReadChanLog {
                        success: false,
                        data: "Reading channel log failed.".to_string(),
                    }
                }
            };
            channel.state.lock().send_to(id, event);
        });
    }

    pub(super) fn handle_request_chat_filters(&self, id: MemberId) {
        let st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if st.allows(actor.rank, PermissionKey::FilterEdit) {
            st.send_to(id, ChannelEvent::ChatFilters(st.filters.pack()));
        }
    }
}

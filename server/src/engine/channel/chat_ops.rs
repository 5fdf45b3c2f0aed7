use serde_json::Value;

use super::{Channel, ChannelState, MuteKind};
use crate::engine::chat::{ChatMessage, ChatMeta, CommandOutcome, PrivateMessage, truncate_chat};
use crate::engine::emotes::validate_emote;
use crate::engine::events::{ChannelEvent, InboundChatMeta};
use crate::engine::filter::validate_filter;
use crate::engine::member::MemberId;
use crate::engine::permissions::{MODERATOR_RANK, PermissionKey, Rank};
use crate::engine::sanitize::TextSanitizer;
use crate::engine::validation::is_valid_name;

/// Only moderators may wear flair, and only at their own rank.
fn chat_meta(rank: Rank, inbound: &InboundChatMeta) -> ChatMeta {
    ChatMeta {
        modflair: inbound
            .modflair
            .filter(|flair| rank >= MODERATOR_RANK && *flair == rank),
        ..ChatMeta::default()
    }
}

impl ChannelState {
    /// Escape, filter and linkify member text.
    fn render(&self, sanitizer: &dyn TextSanitizer, msg: &str) -> String {
        let escaped = sanitizer.sanitize_text(msg);
        self.filters
            .filter_message(&escaped, self.opts.enable_link_regex)
    }

    /// Broadcast a chat line and keep it in history and the room log.
    fn send_message(
        &mut self,
        sanitizer: &dyn TextSanitizer,
        username: &str,
        msg: &str,
        meta: ChatMeta,
    ) {
        let text = self.render(sanitizer, msg);
        let class = meta
            .add_class
            .as_deref()
            .map(|c| format!(".{c}"))
            .unwrap_or_default();
        self.log.log(format!(
            "<{username}{class}> {}",
            sanitizer.decode_text(&text)
        ));
        let message = ChatMessage::new(username, text, meta);
        self.send_all(ChannelEvent::ChatMsg(message.clone()));
        self.history.push(message);
    }
}

impl Channel {
    // ── Chat ────────────────────────────────────────────────────────

    pub(super) fn handle_chat(&self, id: MemberId, msg: String, inbound: InboundChatMeta) {
        let sanitizer = self.services.sanitizer.as_ref();
        let max_len = self.services.settings.max_chat_length;

        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if actor.name.is_empty() || !st.allows(actor.rank, PermissionKey::Chat) {
            return;
        }

        let msg = truncate_chat(&msg, max_len);
        let mut meta = chat_meta(actor.rank, &inbound);

        if !msg.starts_with("/afk") {
            st.set_afk(id, false);
        }

        if actor.rank < MODERATOR_RANK && st.opts.chat_antiflood {
            let params = st.opts.chat_antiflood_params;
            let throttled = st
                .member_mut(id)
                .is_some_and(|m| m.chat_limiter.throttle(&params));
            if throttled {
                st.send_to(id, ChannelEvent::ChatCooldown(params.interval_ms()));
                return;
            }
        }

        match st.mute_of(&actor.name) {
            Some(MuteKind::Shadow) => {
                let text = st.render(sanitizer, &msg);
                let message = ChatMessage::new(&actor.name, text, meta);
                st.send_where(
                    |m| m.meta.smuted || m.rank >= MODERATOR_RANK,
                    ChannelEvent::ChatMsg(message),
                );
                return;
            }
            Some(MuteKind::Muted) => {
                st.send_to(
                    id,
                    ChannelEvent::error("You have been muted on this channel."),
                );
                return;
            }
            None => {}
        }

        if !msg.starts_with('/') {
            if msg.starts_with('>') {
                meta.add_class = Some("greentext".to_string());
            }
            st.send_message(sanitizer, &actor.name, &msg, meta);
            return;
        }

        match self.services.commands.interpret(actor.rank, &msg) {
            CommandOutcome::Declined => st.send_message(sanitizer, &actor.name, &msg, meta),
            CommandOutcome::Consumed => {}
            CommandOutcome::Send { msg, meta: rewritten } => {
                let meta = ChatMeta {
                    modflair: meta.modflair,
                    ..rewritten
                };
                st.send_message(sanitizer, &actor.name, &msg, meta);
            }
            CommandOutcome::Drink { msg, count } => {
                if !st.allows(actor.rank, PermissionKey::Drink) {
                    return;
                }
                st.drinks += count;
                let drinks = st.drinks;
                st.send_all(ChannelEvent::DrinkCount(drinks));
                let meta = ChatMeta {
                    modflair: meta.modflair,
                    ..ChatMeta::with_class("drink")
                };
                let mut text = format!("{} drink!", msg.trim()).trim_start().to_string();
                if count != 1 {
                    text.push_str(&format!(" (x{count})"));
                }
                st.send_message(sanitizer, &actor.name, &text, meta);
            }
            CommandOutcome::ToggleAfk => {
                let afk = st.member(id).is_some_and(|m| !m.meta.afk);
                st.set_afk(id, afk);
            }
            CommandOutcome::Mute { target, shadow } => {
                st.mute_by_command(&actor, &target, shadow);
            }
            CommandOutcome::Unmute { target } => st.unmute_by_command(&actor, &target),
            CommandOutcome::Kick { target, reason } => {
                st.kick_by_command(&actor, &target, &reason);
            }
            CommandOutcome::Ban {
                target,
                reason,
                ip,
                range,
            } => {
                drop(st);
                if ip {
                    self.handle_ban_all_ips(id, target, reason, range);
                } else {
                    self.handle_name_ban(id, target, reason);
                }
            }
        }
    }

    pub(super) fn handle_pm(&self, id: MemberId, to: String, msg: String, inbound: InboundChatMeta) {
        let sanitizer = self.services.sanitizer.as_ref();
        let max_len = self.services.settings.max_chat_length;

        let st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if actor.name.is_empty() {
            return;
        }

        if to.eq_ignore_ascii_case(&actor.name) {
            st.send_to(id, ChannelEvent::error("You can't PM yourself!"));
            return;
        }
        if !is_valid_name(&to) {
            st.send_to(
                id,
                ChannelEvent::error(format!("{} isn't a valid username.", to.to_lowercase())),
            );
            return;
        }
        let Some(recipient) = st.member_by_name(&to).map(|m| m.id) else {
            st.send_to(
                id,
                ChannelEvent::error(format!("{} is not on this channel.", to.to_lowercase())),
            );
            return;
        };

        let msg = truncate_chat(&msg, max_len);
        let mut meta = chat_meta(actor.rank, &inbound);
        if msg.starts_with('>') {
            meta.add_class = Some("greentext".to_string());
        }
        let pm = PrivateMessage {
            username: actor.name.clone(),
            to,
            msg: st.render(sanitizer, &msg),
            meta,
            time: chrono::Utc::now().timestamp_millis(),
        };
        st.send_to(recipient, ChannelEvent::Pm(pm.clone()));
        st.send_to(id, ChannelEvent::Pm(pm));
    }

    // ── Filters ─────────────────────────────────────────────────────

    pub(super) fn handle_import_filters(&self, id: MemberId, list: Vec<Value>) {
        let sanitizer = self.services.sanitizer.as_ref();
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if !st.allows(actor.rank, PermissionKey::FilterImport) {
            return;
        }
        let filters = list
            .iter()
            .filter_map(|f| validate_filter(f, sanitizer))
            .collect();
        st.filters.import(filters);
        st.log
            .log(format!("[mod] {} imported chat filters", actor.name));
        st.send_chat_filters();
    }

    pub(super) fn handle_update_filter(&self, id: MemberId, data: Value) {
        let sanitizer = self.services.sanitizer.as_ref();
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if !st.allows(actor.rank, PermissionKey::FilterEdit) {
            st.kick_member(id, "Attempted updateFilter with insufficient permission");
            return;
        }
        let Some(filter) = validate_filter(&data, sanitizer) else {
            return;
        };

        let spec = filter.spec().clone();
        st.log.log(format!(
            "[mod] {} updated filter: {} -> s/{}/{}/{} active: {}",
            actor.name, spec.name, spec.source, spec.replace, spec.flags, spec.active
        ));
        st.filters.update(filter);
        st.send_where(
            |m| st.member_allows(m, PermissionKey::FilterEdit),
            ChannelEvent::UpdateChatFilter(spec),
        );
    }

    pub(super) fn handle_remove_filter(&self, id: MemberId, name: &str) {
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if !st.allows(actor.rank, PermissionKey::FilterEdit) {
            st.kick_member(id, "Attempted removeFilter with insufficient permission");
            return;
        }
        st.log
            .log(format!("[mod] {} removed filter: {name}", actor.name));
        if let Some(removed) = st.filters.remove(name) {
            let spec = removed.spec().clone();
            st.send_where(
                |m| st.member_allows(m, PermissionKey::FilterEdit),
                ChannelEvent::DeleteChatFilter(spec),
            );
        }
    }

    pub(super) fn handle_move_filter(&self, id: MemberId, from: usize, to: usize) {
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if !st.allows(actor.rank, PermissionKey::FilterEdit) {
            st.kick_member(id, "Attempted moveFilter with insufficient permission");
            return;
        }
        if st.filters.move_filter(from, to) {
            st.send_chat_filters();
        }
    }

    // ── Emotes ──────────────────────────────────────────────────────

    pub(super) fn handle_import_emotes(&self, id: MemberId, list: Vec<Value>) {
        let sanitizer = self.services.sanitizer.as_ref();
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if !st.allows(actor.rank, PermissionKey::EmoteImport) {
            return;
        }
        let emotes = list
            .iter()
            .filter_map(|e| validate_emote(e, sanitizer))
            .collect();
        st.emotes.import(emotes);
        st.log.log(format!("[mod] {} imported emotes", actor.name));
        let list = st.emotes.as_slice().to_vec();
        st.send_all(ChannelEvent::EmoteList(list));
    }

    pub(super) fn handle_update_emote(&self, id: MemberId, data: Value) {
        let sanitizer = self.services.sanitizer.as_ref();
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if !st.allows(actor.rank, PermissionKey::EmoteEdit) {
            st.kick_member(id, "Attempted updateEmote with insufficient permission");
            return;
        }
        let Some(emote) = validate_emote(&data, sanitizer) else {
            return;
        };
        st.log.log(format!(
            "[mod] {} updated emote: {} -> {}",
            actor.name, emote.name, emote.image
        ));
        st.emotes.update(emote.clone());
        st.send_all(ChannelEvent::UpdateEmote(emote));
    }

    pub(super) fn handle_remove_emote(&self, id: MemberId, name: &str) {
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if !st.allows(actor.rank, PermissionKey::EmoteEdit) {
            st.kick_member(id, "Attempted removeEmote with insufficient permission");
            return;
        }
        st.log
            .log(format!("[mod] {} removed emote: {name}", actor.name));
        if let Some(removed) = st.emotes.remove(name) {
            st.send_all(ChannelEvent::RemoveEmote(removed));
        }
    }
}

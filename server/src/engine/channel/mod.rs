use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::channel_log::ChannelLog;
use super::chat::{ChatHistory, ChatMessage, ChatMeta};
use super::emotes::EmoteList;
use super::events::{ChannelEvent, ChannelRequest};
use super::filter::FilterList;
use super::member::{Member, MemberId, ViewTier};
use super::mutation_queue::MutationQueue;
use super::options::ChannelOptions;
use super::permissions::{PermissionKey, PermissionTable, Rank, has_permission};
use super::persistence::{ChannelSnapshot, Motd};
use super::playlist::{Advanced, Playlist, Tick};
use super::poll::Poll;
use super::services::Services;

mod chat_ops;
mod membership;
mod moderation;
mod playlist_ops;
mod polls;

pub use membership::JoinRequest;

/// How often the server-led playback clock and AFK sweep run.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Longest inline CSS or JS kept.
pub const MAX_CSS_JS_LENGTH: usize = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MuteKind {
    Muted,
    Shadow,
}

/// What the public room listing shows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSummary {
    pub name: String,
    pub pagetitle: String,
    pub usercount: usize,
    pub mediatitle: String,
}

/// A member's identity and rank captured under the state lock, for handlers
/// that continue after an await.
#[derive(Debug, Clone)]
pub(crate) struct Actor {
    pub id: MemberId,
    pub name: String,
    pub ip: String,
    pub rank: Rank,
    pub global_rank: Rank,
}

/// In-memory state for a single room. Only touched under the room's lock,
/// which is never held across an await.
pub(crate) struct ChannelState {
    pub registered: bool,
    pub members: Vec<Member>,
    /// Lowercase names muted in this room.
    pub mutes: HashMap<String, MuteKind>,
    pub playlist: Playlist,
    pub playlist_locked: bool,
    pub permissions: PermissionTable,
    pub opts: ChannelOptions,
    pub filters: FilterList,
    pub emotes: EmoteList,
    pub motd: Motd,
    pub history: ChatHistory,
    pub drinks: i64,
    pub leader: Option<MemberId>,
    pub poll: Option<Poll>,
    pub voteskip: Option<Poll>,
    pub css: String,
    pub js: String,
    /// Set when the snapshot could not be loaded; disables saving.
    pub error: bool,
    pub log: ChannelLog,
}

impl ChannelState {
    fn new(name: &str, log: ChannelLog) -> Self {
        Self {
            registered: false,
            members: Vec::new(),
            mutes: HashMap::new(),
            playlist: Playlist::new(),
            playlist_locked: true,
            permissions: PermissionTable::default(),
            opts: ChannelOptions::with_pagetitle(name),
            filters: FilterList::default(),
            emotes: EmoteList::default(),
            motd: Motd::default(),
            history: ChatHistory::default(),
            drinks: 0,
            leader: None,
            poll: None,
            voteskip: None,
            css: String::new(),
            js: String::new(),
            error: false,
            log,
        }
    }

    // ── Lookup ──────────────────────────────────────────────────────

    pub fn member(&self, id: MemberId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn member_mut(&mut self, id: MemberId) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.id == id)
    }

    pub fn member_by_name(&self, name: &str) -> Option<&Member> {
        self.members
            .iter()
            .find(|m| m.is_named() && m.name.eq_ignore_ascii_case(name))
    }

    pub fn actor(&self, id: MemberId) -> Option<Actor> {
        self.member(id).map(|m| Actor {
            id: m.id,
            name: m.name.clone(),
            ip: m.ip.clone(),
            rank: m.rank,
            global_rank: m.global_rank,
        })
    }

    pub fn mute_of(&self, name: &str) -> Option<MuteKind> {
        self.mutes.get(&name.to_lowercase()).copied()
    }

    // ── Permissions ─────────────────────────────────────────────────

    pub fn allows(&self, rank: Rank, key: PermissionKey) -> bool {
        has_permission(rank, key, &self.permissions, self.playlist_locked)
    }

    pub fn member_allows(&self, member: &Member, key: PermissionKey) -> bool {
        self.allows(member.rank, key)
    }

    // ── Fan-out ─────────────────────────────────────────────────────

    pub fn send_all(&self, event: ChannelEvent) {
        for m in &self.members {
            m.send(event.clone());
        }
    }

    pub fn send_to(&self, id: MemberId, event: ChannelEvent) {
        if let Some(m) = self.member(id) {
            m.send(event);
        }
    }

    pub fn send_where(&self, pred: impl Fn(&Member) -> bool, event: ChannelEvent) {
        for m in self.members.iter().filter(|m| pred(m)) {
            m.send(event.clone());
        }
    }

    /// Send each member the event built for their view tier.
    pub fn send_tiered(&self, build: impl Fn(ViewTier) -> ChannelEvent) {
        let mut cache: [Option<ChannelEvent>; 3] = [None, None, None];
        for m in &self.members {
            let tier = m.view_tier();
            let slot = &mut cache[tier as usize];
            let event = slot.get_or_insert_with(|| build(tier));
            m.send(event.clone());
        }
    }

    /// A `[server]` whisper to members at or above `min_rank`.
    pub fn send_mod_message(&self, msg: &str, min_rank: Rank) {
        let notice = ChatMessage::new(
            "[server]",
            msg.to_string(),
            ChatMeta {
                add_class: Some("server-whisper".to_string()),
                add_class_to_name_and_timestamp: true,
                ..ChatMeta::default()
            },
        );
        self.send_where(|m| m.rank >= min_rank, ChannelEvent::ChatMsg(notice.clone()));
    }

    pub fn send_usercount(&self) {
        self.send_all(ChannelEvent::Usercount(self.members.len()));
    }

    pub fn send_user_meta(&self, id: MemberId) {
        let Some(target) = self.member(id) else {
            return;
        };
        if !target.is_named() {
            return;
        }
        self.send_tiered(|tier| ChannelEvent::SetUserMeta {
            name: target.name.clone(),
            meta: target.meta_view(tier),
        });
    }

    pub fn send_user_rank(&self, name: &str, rank: Rank) {
        self.send_all(ChannelEvent::SetUserRank {
            name: name.to_string(),
            rank,
        });
    }

    pub fn send_playlist_meta(&self) {
        let meta = ChannelEvent::SetPlaylistMeta(self.playlist.meta());
        self.send_where(|m| self.member_allows(m, PermissionKey::SeePlaylist), meta);
    }

    /// Full playlist plus meta, to everyone allowed to see it or just `only`.
    pub fn send_playlist(&self, only: Option<MemberId>) {
        let packed = ChannelEvent::Playlist(self.playlist.pack());
        let meta = ChannelEvent::SetPlaylistMeta(self.playlist.meta());
        for m in &self.members {
            if only.is_some_and(|id| id != m.id) || !self.member_allows(m, PermissionKey::SeePlaylist)
            {
                continue;
            }
            m.send(packed.clone());
            m.send(meta.clone());
        }
    }

    pub fn send_playlist_lock(&self) {
        self.send_all(ChannelEvent::SetPlaylistLocked(self.playlist_locked));
    }

    pub fn send_css_js(&self) {
        self.send_all(ChannelEvent::ChannelCssJs {
            css: self.css.clone(),
            js: self.js.clone(),
        });
    }

    pub fn send_chat_filters(&self) {
        let packed = ChannelEvent::ChatFilters(self.filters.pack());
        self.send_where(|m| self.member_allows(m, PermissionKey::FilterEdit), packed);
    }

    // ── Playback ────────────────────────────────────────────────────

    /// Announce a cursor move and reset per-video state.
    pub fn on_cursor_moved(&mut self, advanced: Advanced) {
        if let Some(uid) = advanced.removed_temp {
            self.send_all(ChannelEvent::Delete { uid });
            self.send_playlist_meta();
        }

        self.voteskip = None;
        self.drinks = 0;
        self.send_voteskip_update();
        self.send_all(ChannelEvent::DrinkCount(0));

        if let Some(uid) = advanced.current
            && let Some(update) = self.playlist.snapshot_for_join(Instant::now())
        {
            self.log
                .log(format!("[playlist] Now playing: {}", update.media.title));
            self.send_all(ChannelEvent::ChangeMedia(update));
            self.send_all(ChannelEvent::SetCurrent(uid));
        }
    }

    /// Move to the next item, honouring the loop option.
    pub fn advance(&mut self) {
        let advanced = self.playlist.advance(self.opts.playlist_loop);
        self.on_cursor_moved(advanced);
    }

    fn tick(&mut self, now: Instant) {
        if self.leader.is_none() {
            match self.playlist.tick(now) {
                Tick::Idle => {}
                Tick::Update(update) => self.send_all(ChannelEvent::MediaUpdate(update)),
                Tick::Ended => self.advance(),
            }
        }

        if self.opts.afk_timeout > 0 {
            let timeout = Duration::from_secs(self.opts.afk_timeout);
            let idle: Vec<MemberId> = self
                .members
                .iter()
                .filter(|m| !m.meta.afk && now.saturating_duration_since(m.last_active) >= timeout)
                .map(|m| m.id)
                .collect();
            for id in idle {
                self.set_afk(id, true);
            }
        }
    }

    // ── Snapshots ───────────────────────────────────────────────────

    fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            playlist: Some(self.playlist.dump()),
            opts: serde_json::to_value(&self.opts).unwrap_or_default(),
            permissions: serde_json::to_value(&self.permissions).unwrap_or_default(),
            filters: Some(self.filters.pack()),
            emotes: self.emotes.as_slice().to_vec(),
            motd: self.motd.clone(),
            playlist_lock: self.playlist_locked,
            chatbuffer: self.history.to_vec(),
            css: self.css.clone(),
            js: self.js.clone(),
        }
    }

    fn apply_snapshot(&mut self, snapshot: ChannelSnapshot, services: &Services) {
        if let Some(dump) = snapshot.playlist {
            self.playlist.load(dump);
        }
        self.playlist_locked = snapshot.playlist_lock;
        self.opts.merge_from(&snapshot.opts);
        let rejected = self.permissions.merge_from(&snapshot.permissions);
        if rejected > 0 {
            debug!(rejected, "ignored unknown permission keys in snapshot");
        }
        if let Some(specs) = snapshot.filters {
            self.filters = FilterList::from_specs(specs);
        }
        self.emotes = EmoteList::from_stored(snapshot.emotes, services.sanitizer.as_ref());
        self.motd = snapshot.motd;
        self.history = ChatHistory::from_vec(snapshot.chatbuffer);
        self.css = snapshot.css.chars().take(MAX_CSS_JS_LENGTH).collect();
        self.js = snapshot.js.chars().take(MAX_CSS_JS_LENGTH).collect();
    }
}

/// One room: its state, mutation queue, clock and collaborators.
pub struct Channel {
    name: String,
    key: String,
    me: Weak<Channel>,
    state: Mutex<ChannelState>,
    queue: MutationQueue,
    dead: AtomicBool,
    torn_down: AtomicBool,
    save_lock: tokio::sync::Mutex<()>,
    ready: watch::Sender<bool>,
    services: Services,
    log: ChannelLog,
    ticker: Mutex<Option<AbortHandle>>,
}

impl Channel {
    /// Create an empty, not-yet-ready room. Must be called inside a tokio
    /// runtime; the caller starts [`Channel::load_state`].
    pub fn new(name: &str, services: Services) -> Arc<Self> {
        let key = name.to_lowercase();
        let log = match &services.settings.log_dir {
            Some(dir) => ChannelLog::open(dir, &key),
            None => ChannelLog::disabled(),
        };
        let (ready, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            name: name.to_string(),
            key: key.clone(),
            me: me.clone(),
            state: Mutex::new(ChannelState::new(name, log.clone())),
            queue: MutationQueue::new(&key),
            dead: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            save_lock: tokio::sync::Mutex::new(()),
            ready,
            services,
            log,
            ticker: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical lowercase name, used for storage and lookups.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn is_registered(&self) -> bool {
        self.state.lock().registered
    }

    pub fn has_error(&self) -> bool {
        self.state.lock().error
    }

    pub fn usercount(&self) -> usize {
        self.state.lock().members.len()
    }

    pub fn log(&self) -> &ChannelLog {
        &self.log
    }

    fn arc(&self) -> Option<Arc<Channel>> {
        self.me.upgrade()
    }

    /// Resolves once the snapshot has been applied. False if the room died first.
    pub async fn wait_ready(&self) -> bool {
        let mut rx = self.ready.subscribe();
        loop {
            if self.is_dead() {
                return false;
            }
            if *rx.borrow_and_update() {
                return true;
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    fn set_ready(&self) {
        self.ready.send_replace(true);
    }

    /// Listing entry, or `None` for rooms that opted out.
    pub fn summary(&self) -> Option<ChannelSummary> {
        let st = self.state.lock();
        if !st.opts.show_public || st.opts.password.is_some() {
            return None;
        }
        Some(ChannelSummary {
            name: self.name.clone(),
            pagetitle: st.opts.pagetitle.clone(),
            usercount: st.members.len(),
            mediatitle: st
                .playlist
                .current()
                .map(|it| it.media.title.clone())
                .unwrap_or_default(),
        })
    }

    // ── Persistence ─────────────────────────────────────────────────

    /// Work out registration, then apply the stored snapshot. Runs once per
    /// room; members wait on [`Channel::wait_ready`].
    pub async fn load_state(&self) {
        let registered = match self.services.db.is_channel_registered(&self.key).await {
            Ok(registered) => registered,
            Err(e) => {
                warn!(channel = %self.key, error = %e, "registration lookup failed");
                false
            }
        };
        if self.is_dead() {
            return;
        }

        if !registered {
            {
                let mut st = self.state.lock();
                st.registered = false;
                st.permissions.apply_unregistered_preset();
                st.playlist_locked = false;
            }
            self.set_ready();
            debug!(channel = %self.key, "unregistered room ready");
            return;
        }

        self.state.lock().registered = true;
        match self.services.snapshots.load(&self.key).await {
            Ok(None) => {
                if self.is_dead() {
                    return;
                }
                self.set_ready();
                self.log.log("[init] No channel data found, starting fresh");
                if let Err(e) = self.save_state().await {
                    warn!(channel = %self.key, error = %e, "initial save failed");
                }
            }
            Ok(Some(snapshot)) => {
                if self.is_dead() {
                    return;
                }
                self.state.lock().apply_snapshot(snapshot, &self.services);
                self.set_ready();
                self.log.log("[init] Loaded channel from disk");
                info!(channel = %self.key, "room state loaded");
            }
            Err(e) => {
                if self.is_dead() {
                    return;
                }
                error!(channel = %self.key, error = %e, "room state load failed");
                {
                    let mut st = self.state.lock();
                    st.error = true;
                    let notice = e.motd_notice().to_string();
                    st.motd = Motd {
                        motd: notice.clone(),
                        html: notice,
                    };
                }
                self.log.log(format!("[init] Channel state load failed: {e}"));
                self.set_ready();
            }
        }
    }

    /// Write the snapshot. Skipped for unregistered rooms and after a failed load.
    pub async fn save_state(&self) -> std::io::Result<()> {
        // Saves of one room run one at a time, each writing the state it saw last
        let _saving = self.save_lock.lock().await;
        let snapshot = {
            let st = self.state.lock();
            if !st.registered || st.error {
                return Ok(());
            }
            st.snapshot()
        };
        self.services.snapshots.save(&self.key, &snapshot).await
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Start the one-second clock. Idempotent.
    pub fn start_ticker(&self) {
        let mut slot = self.ticker.lock();
        if slot.is_some() {
            return;
        }
        let me = self.me.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(channel) = me.upgrade() else {
                    break;
                };
                if channel.is_dead() {
                    break;
                }
                channel.state.lock().tick(Instant::now());
            }
        });
        *slot = Some(handle.abort_handle());
    }

    /// Release everything and set the dead marker. Pending queue tasks,
    /// timers and lookups observe the marker and stop.
    pub fn teardown(&self) {
        self.dead.store(true, Ordering::SeqCst);
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue.close();
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.abort();
        }
        {
            let mut st = self.state.lock();
            st.poll = None;
            st.voteskip = None;
            st.leader = None;
            st.playlist.clear();
            st.mutes.clear();
            for m in st.members.drain(..) {
                m.kick("Channel is shutting down");
            }
        }
        // Wake anyone still waiting to join
        self.ready.send_replace(false);
        info!(channel = %self.key, "room torn down");
    }

    /// Mark the room dead if nobody is in it. Joins check the marker under
    /// the same lock, so a racing join either lands first or is refused.
    /// Returns true when this call closed the room.
    pub fn close_if_empty(&self) -> bool {
        let st = self.state.lock();
        st.members.is_empty() && !self.dead.swap(true, Ordering::SeqCst)
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Route a decoded request from member `id`.
    pub fn handle(&self, id: MemberId, request: ChannelRequest) {
        if self.is_dead() {
            return;
        }
        {
            let mut st = self.state.lock();
            let Some(member) = st.member_mut(id) else {
                return;
            };
            member.last_active = Instant::now();
        }

        match request {
            ChannelRequest::ChatMsg { msg, meta } => self.handle_chat(id, msg, meta),
            ChannelRequest::Pm { to, msg, meta } => self.handle_pm(id, to, msg, meta),
            ChannelRequest::ChannelPassword(_) => {}

            ChannelRequest::Queue(req) => self.handle_queue(id, req),
            ChannelRequest::QueuePlaylist { name, pos, temp } => {
                self.handle_queue_playlist(id, name, pos, temp)
            }
            ChannelRequest::Delete(uid) => self.handle_delete(id, uid),
            ChannelRequest::MoveMedia { from, after } => self.handle_move(id, from, after),
            ChannelRequest::SetTemp { uid, temp } => self.handle_set_temp(id, uid, temp),
            ChannelRequest::PlayNext => self.handle_play_next(id),
            ChannelRequest::JumpTo(uid) => self.handle_jump_to(id, uid),
            ChannelRequest::ClearPlaylist => self.handle_clear(id),
            ChannelRequest::ShufflePlaylist => self.handle_shuffle(id),
            ChannelRequest::MediaUpdate {
                id: media_id,
                current_time,
                paused,
            } => self.handle_media_update(id, &media_id, current_time, paused),
            ChannelRequest::SetPlaylistLock(locked) => self.handle_set_lock(id, Some(locked)),
            ChannelRequest::TogglePlaylistLock => self.handle_set_lock(id, None),
            ChannelRequest::Uncache { id: media_id } => self.handle_uncache(id, media_id),
            ChannelRequest::SearchMedia { query } => self.handle_search(id, query),

            ChannelRequest::NewPoll {
                title,
                opts,
                obscured,
                timeout,
            } => self.handle_new_poll(id, title, opts, obscured, timeout),
            ChannelRequest::ClosePoll => self.handle_close_poll(id),
            ChannelRequest::Vote { option } => self.handle_vote(id, option),
            ChannelRequest::Voteskip => self.handle_voteskip(id),

            ChannelRequest::ImportFilters(list) => self.handle_import_filters(id, list),
            ChannelRequest::UpdateFilter(data) => self.handle_update_filter(id, data),
            ChannelRequest::RemoveFilter { name } => self.handle_remove_filter(id, &name),
            ChannelRequest::MoveFilter { from, to } => self.handle_move_filter(id, from, to),
            ChannelRequest::ImportEmotes(list) => self.handle_import_emotes(id, list),
            ChannelRequest::UpdateEmote(data) => self.handle_update_emote(id, data),
            ChannelRequest::RemoveEmote { name } => self.handle_remove_emote(id, &name),

            ChannelRequest::SetPermissions(data) => self.handle_set_permissions(id, data),
            ChannelRequest::SetOptions(data) => self.handle_set_options(id, data),
            ChannelRequest::SetChannelCss { css } => self.handle_set_css(id, css),
            ChannelRequest::SetChannelJs { js } => self.handle_set_js(id, js),
            ChannelRequest::SetMotd { motd } => self.handle_set_motd(id, &motd),

            ChannelRequest::SetChannelRank { user, rank } => {
                self.handle_set_channel_rank(id, user, rank)
            }
            ChannelRequest::AssignLeader { name } => self.handle_assign_leader(id, &name),
            ChannelRequest::BanName { name, reason } => self.handle_name_ban(id, name, reason),
            ChannelRequest::BanAllIps {
                name,
                reason,
                range,
            } => self.handle_ban_all_ips(id, name, reason, range),
            ChannelRequest::Unban { id: ban_id, name } => self.handle_unban(id, ban_id, name),
            ChannelRequest::ReadChanLog => self.handle_read_chan_log(id),
            ChannelRequest::RequestBanlist => self.handle_request_banlist(id),
            ChannelRequest::RequestChannelRanks => self.handle_request_channel_ranks(id),
            ChannelRequest::RequestChatFilters => self.handle_request_chat_filters(id),
        }
    }

    /// Spawn a follow-up that needs the room handle after an await.
    fn spawn_with<F, Fut>(&self, task: F)
    where
        F: FnOnce(Arc<Channel>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Some(channel) = self.arc() {
            tokio::spawn(task(channel));
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.get_mut().take() {
            ticker.abort();
        }
    }
}

#[cfg(test)]
mod tests;

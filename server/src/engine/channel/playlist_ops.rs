use tracing::{debug, warn};

use super::Channel;
use crate::engine::error::{LookupError, QueueError};
use crate::engine::events::{After, ChannelEvent, QueueRequest};
use crate::engine::media::{
    CUSTOM_TYPE, Media, PLAYLIST_TYPE, UNCACHEABLE_TYPE, format_link, is_live,
};
use crate::engine::member::MemberId;
use crate::engine::permissions::{MODERATOR_RANK, PermissionKey};
use crate::engine::playlist::{Advanced, InsertPosition, ItemId, order_for_next};
use crate::engine::rate_limiter::{QUEUE_LIMIT, QUEUE_LIMIT_PRIVILEGED};

/// Longest library search query kept.
const MAX_SEARCH_QUERY: usize = 100;

/// One playlist addition, resolved inside the mutation queue.
#[derive(Debug, Clone)]
pub(crate) struct AddRequest {
    pub id: String,
    pub media_type: String,
    /// Member-supplied title, honoured for custom embeds only.
    pub title: Option<String>,
    /// Media that needs no lookup, e.g. from a saved user playlist.
    pub known: Option<Media>,
    pub pos: InsertPosition,
    pub queueby: String,
    pub temp: bool,
    /// Duration override for live media.
    pub duration: Option<f64>,
    /// Zero means unlimited.
    pub maxlength: u64,
}

impl Channel {
    // ── Additions ───────────────────────────────────────────────────

    pub(super) fn handle_queue(&self, id: MemberId, req: QueueRequest) {
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if !st.allows(actor.rank, PermissionKey::PlaylistAdd) {
            return;
        }

        let Some(pos) = InsertPosition::parse(req.pos.as_deref().unwrap_or("end")) else {
            return;
        };
        if pos == InsertPosition::Next && !st.allows(actor.rank, PermissionKey::PlaylistNext) {
            return;
        }

        let link = format_link(&req.id, &req.media_type);
        if req.media_type == PLAYLIST_TYPE
            && !st.allows(actor.rank, PermissionKey::PlaylistAddList)
        {
            st.send_to(
                id,
                ChannelEvent::queue_fail("You don't have permission to add playlists", Some(link)),
            );
            return;
        }
        if is_live(&req.media_type) && !st.allows(actor.rank, PermissionKey::PlaylistAddLive) {
            st.send_to(
                id,
                ChannelEvent::queue_fail(QueueError::LiveNotAllowed.to_string(), Some(link)),
            );
            return;
        }
        if req.media_type == CUSTOM_TYPE
            && !st.allows(actor.rank, PermissionKey::PlaylistAddCustom)
        {
            st.send_to(
                id,
                ChannelEvent::queue_fail(QueueError::CustomNotAllowed.to_string(), None),
            );
            return;
        }

        let title = req.title.filter(|_| req.media_type == CUSTOM_TYPE);
        let temp = req.temp.unwrap_or(false) || !st.allows(actor.rank, PermissionKey::AddNonTemp);
        let duration = req
            .duration
            .filter(|d| is_live(&req.media_type) && d.is_finite() && *d >= 0.0);
        let maxlength = if st.allows(actor.rank, PermissionKey::ExceedMaxLength) {
            0
        } else {
            st.opts.maxlength
        };

        let limit = if actor.rank >= MODERATOR_RANK || st.leader == Some(id) {
            QUEUE_LIMIT_PRIVILEGED
        } else {
            QUEUE_LIMIT
        };
        let throttled = st
            .member_mut(id)
            .is_some_and(|m| m.queue_limiter.throttle(&limit));
        if throttled {
            st.send_to(
                id,
                ChannelEvent::queue_fail(QueueError::Throttled.to_string(), None),
            );
            return;
        }
        drop(st);

        self.add_media(
            AddRequest {
                id: req.id,
                media_type: req.media_type,
                title,
                known: None,
                pos,
                queueby: actor.name,
                temp,
                duration,
                maxlength,
            },
            id,
        );
    }

    pub(super) fn handle_queue_playlist(
        &self,
        id: MemberId,
        name: String,
        pos: Option<String>,
        temp: Option<bool>,
    ) {
        let (actor, pos, temp) = {
            let st = self.state.lock();
            let Some(actor) = st.actor(id) else {
                return;
            };
            if actor.name.is_empty() || !st.allows(actor.rank, PermissionKey::PlaylistAddList) {
                return;
            }
            let Some(pos) = InsertPosition::parse(pos.as_deref().unwrap_or("end")) else {
                return;
            };
            if pos == InsertPosition::Next && !st.allows(actor.rank, PermissionKey::PlaylistNext) {
                return;
            }
            let temp = temp.unwrap_or(false) || !st.allows(actor.rank, PermissionKey::AddNonTemp);
            (actor, pos, temp)
        };

        self.spawn_with(move |channel| async move {
            let loaded = channel.services.db.user_playlist(&actor.name, &name).await;
            if channel.is_dead() {
                return;
            }
            let items = match loaded {
                Ok(items) => items,
                Err(e) => {
                    let cause = match e {
                        LookupError::NotFound => "Playlist not found".to_string(),
                        other => other.to_string(),
                    };
                    channel.state.lock().send_to(
                        id,
                        ChannelEvent::error(format!("Playlist load failed: {cause}")),
                    );
                    return;
                }
            };

            let items = if pos == InsertPosition::Next {
                let empty = channel.state.lock().playlist.is_empty();
                order_for_next(items, empty)
            } else {
                items
            };
            for media in items {
                channel.add_media(
                    AddRequest {
                        id: media.id.clone(),
                        media_type: media.media_type.clone(),
                        title: None,
                        known: Some(media),
                        pos,
                        queueby: actor.name.clone(),
                        temp,
                        duration: None,
                        maxlength: 0,
                    },
                    id,
                );
            }
        });
    }

    /// Queue an addition and report its outcome to `requester`.
    pub(crate) fn add_media(&self, req: AddRequest, requester: MemberId) {
        let Some(channel) = self.arc() else {
            return;
        };
        self.queue.queue(move |lock| async move {
            let outcome = channel.resolve_and_insert(&req).await;
            drop(lock);

            let link = Some(format_link(&req.id, &req.media_type));
            let st = channel.state.lock();
            match outcome {
                Err(QueueError::Dead) => {}
                Err(e) => st.send_to(requester, ChannelEvent::queue_fail(e.to_string(), link)),
                Ok(added) => {
                    for media in added {
                        if let Some(restricted) = &media.meta.restricted {
                            st.send_to(
                                requester,
                                ChannelEvent::QueueWarn {
                                    msg: format!(
                                        "This video is blocked in the following countries: {restricted}"
                                    ),
                                    link: link.clone(),
                                },
                            );
                        }
                    }
                }
            }
        });
    }

    /// Resolve the media and insert it. Runs while holding the queue lock;
    /// the dead marker is re-checked after every await.
    async fn resolve_and_insert(&self, req: &AddRequest) -> Result<Vec<Media>, QueueError> {
        if self.is_dead() {
            return Err(QueueError::Dead);
        }

        if let Some(media) = &req.known {
            return self.insert_resolved(req, media.clone(), false).map(|m| vec![m]);
        }

        if req.media_type == PLAYLIST_TYPE {
            let batch = self
                .services
                .resolver
                .resolve(&req.id, &req.media_type)
                .await?;
            if self.is_dead() {
                return Err(QueueError::Dead);
            }
            let batch = if req.pos == InsertPosition::Next {
                let empty = self.state.lock().playlist.is_empty();
                order_for_next(batch, empty)
            } else {
                batch
            };

            let mut added = Vec::with_capacity(batch.len());
            let mut first_error = None;
            for media in batch {
                match self.insert_resolved(req, media, true) {
                    Ok(media) => added.push(media),
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            return match (added.is_empty(), first_error) {
                (true, Some(e)) => Err(e),
                _ => Ok(added),
            };
        }

        if !self.is_registered() || is_live(&req.media_type) {
            let mut media = self.resolve_one(req).await?;
            if self.is_dead() {
                return Err(QueueError::Dead);
            }
            if let Some(seconds) = req.duration {
                media.set_seconds(seconds as u64);
            }
            return self.insert_resolved(req, media, false).map(|m| vec![m]);
        }

        let cached = self
            .services
            .db
            .library_lookup(&self.key, &req.id, &req.media_type)
            .await?;
        if self.is_dead() {
            return Err(QueueError::Dead);
        }
        let media = match cached {
            Some(media) => media,
            None => {
                let media = self.resolve_one(req).await?;
                if self.is_dead() {
                    return Err(QueueError::Dead);
                }
                media
            }
        };
        self.insert_resolved(req, media, true).map(|m| vec![m])
    }

    async fn resolve_one(&self, req: &AddRequest) -> Result<Media, QueueError> {
        let mut found = self
            .services
            .resolver
            .resolve(&req.id, &req.media_type)
            .await?;
        if found.is_empty() {
            return Err(LookupError::NotFound.into());
        }
        Ok(found.swap_remove(0))
    }

    fn insert_resolved(
        &self,
        req: &AddRequest,
        mut media: Media,
        should_cache: bool,
    ) -> Result<Media, QueueError> {
        if req.maxlength > 0 && media.seconds > req.maxlength {
            return Err(QueueError::MaxLength(req.maxlength));
        }
        if let Some(title) = &req.title
            && media.media_type == CUSTOM_TYPE
        {
            media.set_custom_title(title);
        }

        let mut st = self.state.lock();
        if self.is_dead() {
            return Err(QueueError::Dead);
        }
        let added = st
            .playlist
            .add(media.clone(), req.pos, req.temp, &req.queueby)?;

        st.log.log(format!(
            "[playlist] {} queued {} ({}:{})",
            req.queueby, media.title, media.media_type, media.id
        ));
        if let Some(item) = st.playlist.find(added.uid).map(|it| it.pack()) {
            let packet = ChannelEvent::Queue {
                item,
                after: After::from_option(added.after),
            };
            st.send_where(|m| st.member_allows(m, PermissionKey::SeePlaylist), packet);
        }
        st.send_playlist_meta();
        if added.started {
            st.on_cursor_moved(Advanced {
                removed_temp: None,
                current: Some(added.uid),
            });
        }
        let registered = st.registered;
        drop(st);

        if should_cache && registered {
            self.cache_media(media.clone());
        }
        Ok(media)
    }

    /// Write media to the room library in the background.
    fn cache_media(&self, media: Media) {
        if media.media_type == UNCACHEABLE_TYPE || media.is_live() {
            return;
        }
        let db = self.services.db.clone();
        let key = self.key.clone();
        tokio::spawn(async move {
            if let Err(e) = db.cache_media(&key, &media).await {
                warn!(channel = %key, id = %media.id, error = %e, "library write failed");
            }
        });
    }

    // ── Structure ───────────────────────────────────────────────────

    pub(super) fn handle_delete(&self, id: MemberId, uid: ItemId) {
        let actor = {
            let st = self.state.lock();
            match st.actor(id) {
                Some(actor) if st.allows(actor.rank, PermissionKey::PlaylistDelete) => actor,
                _ => return,
            }
        };
        let Some(channel) = self.arc() else {
            return;
        };
        self.queue.queue(move |lock| async move {
            if channel.is_dead() {
                return;
            }
            let mut st = channel.state.lock();
            let title = st.playlist.find(uid).map(|it| it.media.title.clone());
            let wrap = st.opts.playlist_loop;
            if let Some(removed) = st.playlist.remove(uid, wrap) {
                st.send_all(ChannelEvent::Delete { uid });
                st.send_playlist_meta();
                if let Some(title) = title {
                    st.log
                        .log(format!("[playlist] {} deleted {title}", actor.name));
                }
                if removed.current_changed {
                    let current = st.playlist.current_uid();
                    st.on_cursor_moved(Advanced {
                        removed_temp: None,
                        current,
                    });
                }
            }
            drop(st);
            lock.release();
        });
    }

    pub(super) fn handle_move(&self, id: MemberId, from: ItemId, after: After) {
        if after.item() == Some(from) {
            return;
        }
        let actor = {
            let st = self.state.lock();
            match st.actor(id) {
                Some(actor) if st.allows(actor.rank, PermissionKey::PlaylistMove) => actor,
                _ => return,
            }
        };
        let Some(channel) = self.arc() else {
            return;
        };
        self.queue.queue(move |lock| async move {
            if channel.is_dead() {
                return;
            }
            let mut st = channel.state.lock();
            if st.playlist.move_item(from, after.item()) {
                st.send_all(ChannelEvent::MoveVideo { from, after });
                let moved = st.playlist.find(from).map(|it| it.media.title.clone());
                let behind = after
                    .item()
                    .and_then(|uid| st.playlist.find(uid))
                    .map(|it| format!(" after {}", it.media.title))
                    .unwrap_or_default();
                if let Some(moved) = moved {
                    st.log.log(format!(
                        "[playlist] {} moved {moved}{behind}",
                        actor.name
                    ));
                }
            }
            drop(st);
            lock.release();
        });
    }

    pub(super) fn handle_set_temp(&self, id: MemberId, uid: ItemId, temp: bool) {
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if !st.allows(actor.rank, PermissionKey::SetTemp) {
            return;
        }
        let Some(media) = st.playlist.set_temp(uid, temp).map(|it| it.media.clone()) else {
            return;
        };
        st.send_all(ChannelEvent::SetTemp { uid, temp });
        let registered = st.registered;
        drop(st);

        if !temp && registered {
            self.cache_media(media);
        }
    }

    pub(super) fn handle_play_next(&self, id: MemberId) {
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if !st.allows(actor.rank, PermissionKey::PlaylistJump) {
            return;
        }
        let title = st
            .playlist
            .current()
            .map(|it| format!(" {}", it.media.title))
            .unwrap_or_default();
        st.log
            .log(format!("[playlist] {} skipped{title}", actor.name));
        st.advance();
    }

    pub(super) fn handle_jump_to(&self, id: MemberId, uid: ItemId) {
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if !st.allows(actor.rank, PermissionKey::PlaylistJump) {
            return;
        }
        let Some(title) = st.playlist.find(uid).map(|it| it.media.title.clone()) else {
            return;
        };
        if let Some(advanced) = st.playlist.jump(uid) {
            st.log
                .log(format!("[playlist] {} skipped to {title}", actor.name));
            st.on_cursor_moved(advanced);
        }
    }

    pub(super) fn handle_clear(&self, id: MemberId) {
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if !st.allows(actor.rank, PermissionKey::PlaylistClear) {
            return;
        }
        st.log
            .log(format!("[playlist] {} cleared the playlist", actor.name));
        st.playlist.clear();
        self.queue.reset();
        st.send_playlist(None);
    }

    pub(super) fn handle_shuffle(&self, id: MemberId) {
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if !st.allows(actor.rank, PermissionKey::PlaylistShuffle) {
            return;
        }
        st.log
            .log(format!("[playlist] {} shuffled the playlist", actor.name));
        st.playlist.shuffle();
        self.queue.reset();
        st.send_playlist(None);
        let current = st.playlist.current_uid();
        st.on_cursor_moved(Advanced {
            removed_temp: None,
            current,
        });
    }

    // ── Playback ────────────────────────────────────────────────────

    pub(super) fn handle_media_update(
        &self,
        id: MemberId,
        media_id: &str,
        current_time: f64,
        paused: bool,
    ) {
        let mut st = self.state.lock();
        if st.leader != Some(id) {
            return;
        }
        if let Some(update) = st.playlist.report_time(media_id, current_time, paused) {
            st.send_all(ChannelEvent::MediaUpdate(update));
        }
    }

    pub(super) fn handle_set_lock(&self, id: MemberId, locked: Option<bool>) {
        let mut st = self.state.lock();
        let Some(actor) = st.actor(id) else {
            return;
        };
        if !st.allows(actor.rank, PermissionKey::PlaylistLock) {
            return;
        }
        let locked = locked.unwrap_or(!st.playlist_locked);
        st.log.log(format!(
            "[playlist] {} set playlist lock to {locked}",
            actor.name
        ));
        st.playlist_locked = locked;
        st.send_playlist_lock();
    }

    // ── Library ─────────────────────────────────────────────────────

    pub(super) fn handle_uncache(&self, id: MemberId, media_id: String) {
        let actor = {
            let st = self.state.lock();
            match st.actor(id) {
                Some(actor) if st.registered && actor.rank >= MODERATOR_RANK => actor,
                _ => return,
            }
        };
        self.spawn_with(move |channel| async move {
            let result = channel
                .services
                .db
                .uncache_media(&channel.key, &media_id)
                .await;
            if channel.is_dead() {
                return;
            }
            match result {
                Ok(()) => channel.log.log(format!(
                    "[library] {} deleted {media_id} from library",
                    actor.name
                )),
                Err(e) => debug!(channel = %channel.key, error = %e, "uncache failed"),
            }
        });
    }

    pub(super) fn handle_search(&self, id: MemberId, query: String) {
        let registered = {
            let st = self.state.lock();
            let Some(actor) = st.actor(id) else {
                return;
            };
            if !st.allows(actor.rank, PermissionKey::PlaylistAdd) {
                return;
            }
            st.registered
        };
        if !registered {
            self.state
                .lock()
                .send_to(id, ChannelEvent::SearchResults { results: Vec::new() });
            return;
        }

        let query: String = query.chars().take(MAX_SEARCH_QUERY).collect();
        self.spawn_with(move |channel| async move {
            let results = channel
                .services
                .db
                .search_library(&channel.key, &query)
                .await
                .unwrap_or_else(|e| {
                    warn!(channel = %channel.key, error = %e, "library search failed");
                    Vec::new()
                });
            if channel.is_dead() {
                return;
            }
            channel
                .state
                .lock()
                .send_to(id, ChannelEvent::SearchResults { results });
        });
    }
}

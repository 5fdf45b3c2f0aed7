use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::error::QueueError;
use super::media::{FullMediaUpdate, Media, SEEKABLE_LIVE_TYPE, TimeUpdate, format_time};

pub type ItemId = u64;

/// How often the server-led clock is pushed to members.
pub const MEDIA_UPDATE_INTERVAL: Duration = Duration::from_secs(5);

/// Where a new item lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    Append,
    Prepend,
    /// Directly after the current item.
    Next,
}

impl InsertPosition {
    pub fn parse(pos: &str) -> Option<Self> {
        match pos {
            "end" | "append" => Some(Self::Append),
            "prepend" => Some(Self::Prepend),
            "next" => Some(Self::Next),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlaylistItem {
    pub uid: ItemId,
    pub media: Media,
    pub temp: bool,
    pub queueby: String,
    prev: Option<ItemId>,
    next: Option<ItemId>,
}

impl PlaylistItem {
    pub fn prev(&self) -> Option<ItemId> {
        self.prev
    }

    pub fn next(&self) -> Option<ItemId> {
        self.next
    }

    pub fn pack(&self) -> PackedItem {
        PackedItem {
            media: self.media.clone(),
            uid: self.uid,
            temp: self.temp,
            queueby: self.queueby.clone(),
        }
    }
}

/// Wire form of a playlist item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackedItem {
    pub media: Media,
    pub uid: ItemId,
    pub temp: bool,
    pub queueby: String,
}

/// `{count, time}` summary sent as `setPlaylistMeta`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaylistMeta {
    pub count: usize,
    pub time: String,
}

impl Default for PlaylistMeta {
    fn default() -> Self {
        Self {
            count: 0,
            time: format_time(0),
        }
    }
}

/// Persisted playlist form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaylistDump {
    pub pl: Vec<DumpedItem>,
    pub pos: usize,
    pub time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpedItem {
    pub media: Media,
    #[serde(default)]
    pub temp: bool,
    #[serde(default)]
    pub queueby: String,
}

/// Result of a successful insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct Added {
    pub uid: ItemId,
    /// Item now preceding the new one; `None` means it was placed first.
    pub after: Option<ItemId>,
    /// The new item became current because nothing was playing.
    pub started: bool,
}

/// Result of a removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removed {
    pub current_changed: bool,
}

/// Result of moving the cursor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Advanced {
    /// A temp item that was played past and removed.
    pub removed_temp: Option<ItemId>,
    pub current: Option<ItemId>,
}

/// What the server-led clock produced on a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    Idle,
    Update(TimeUpdate),
    Ended,
}

/// Ordered playlist stored as an arena keyed by item id, with a cursor and
/// the playback clock of the current item.
#[derive(Debug)]
pub struct Playlist {
    items: HashMap<ItemId, PlaylistItem>,
    head: Option<ItemId>,
    tail: Option<ItemId>,
    current: Option<ItemId>,
    next_uid: ItemId,
    /// Instant at which the current item's `current_time` was last set.
    anchor: Instant,
    last_broadcast: Instant,
}

impl Default for Playlist {
    fn default() -> Self {
        Self::new()
    }
}

impl Playlist {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            items: HashMap::new(),
            head: None,
            tail: None,
            current: None,
            next_uid: 0,
            anchor: now,
            last_broadcast: now,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn find(&self, uid: ItemId) -> Option<&PlaylistItem> {
        self.items.get(&uid)
    }

    pub fn current(&self) -> Option<&PlaylistItem> {
        self.current.and_then(|uid| self.items.get(&uid))
    }

    pub fn current_uid(&self) -> Option<ItemId> {
        self.current
    }

    pub fn head(&self) -> Option<ItemId> {
        self.head
    }

    /// Items in playlist order.
    pub fn iter(&self) -> PlaylistIter<'_> {
        PlaylistIter {
            playlist: self,
            cursor: self.head,
        }
    }

    pub fn pack(&self) -> Vec<PackedItem> {
        self.iter().map(PlaylistItem::pack).collect()
    }

    pub fn meta(&self) -> PlaylistMeta {
        let total: u64 = self.iter().map(|it| it.media.seconds).sum();
        PlaylistMeta {
            count: self.len(),
            time: format_time(total),
        }
    }

    pub fn contains_media(&self, media: &Media) -> bool {
        self.items.values().any(|it| it.media.same_source(media))
    }

    // ── Structure ──────────────────────────────────────────────────────

    /// Insert new media. Duplicates (same id and type) are refused.
    pub fn add(
        &mut self,
        media: Media,
        pos: InsertPosition,
        temp: bool,
        queueby: &str,
    ) -> Result<Added, QueueError> {
        if self.contains_media(&media) {
            return Err(QueueError::Duplicate);
        }

        let uid = self.next_uid;
        self.next_uid += 1;
        self.items.insert(
            uid,
            PlaylistItem {
                uid,
                media,
                temp,
                queueby: queueby.to_string(),
                prev: None,
                next: None,
            },
        );

        let after = match pos {
            InsertPosition::Prepend => None,
            InsertPosition::Append => self.tail,
            InsertPosition::Next => self.current.or(self.tail),
        };
        self.link_after(uid, after);

        let started = self.current.is_none();
        if started {
            self.current = Some(uid);
            self.start_playback(None);
        }

        Ok(Added {
            uid,
            after,
            started,
        })
    }

    /// Remove an item. When it was current, the cursor moves on.
    pub fn remove(&mut self, uid: ItemId, wrap: bool) -> Option<Removed> {
        if !self.items.contains_key(&uid) {
            return None;
        }

        let mut current_changed = false;
        if self.current == Some(uid) {
            let next = self.following(uid, wrap).filter(|n| *n != uid);
            self.current = next;
            current_changed = true;
        }

        self.unlink(uid);
        self.items.remove(&uid);

        if current_changed && self.current.is_some() {
            self.start_playback(None);
        }
        Some(Removed { current_changed })
    }

    /// Move `from` to directly after `after` (`None` = to the front).
    pub fn move_item(&mut self, from: ItemId, after: Option<ItemId>) -> bool {
        if Some(from) == after || !self.items.contains_key(&from) {
            return false;
        }
        if let Some(after) = after
            && !self.items.contains_key(&after)
        {
            return false;
        }
        self.unlink(from);
        self.link_after(from, after);
        true
    }

    pub fn set_temp(&mut self, uid: ItemId, temp: bool) -> Option<&PlaylistItem> {
        let item = self.items.get_mut(&uid)?;
        item.temp = temp;
        Some(item)
    }

    /// Drop every item. Ids are not reused afterwards.
    pub fn clear(&mut self) {
        self.items.clear();
        self.head = None;
        self.tail = None;
        self.current = None;
    }

    /// Rebuild the playlist in random order. Items get fresh ids; playback
    /// restarts from the new head.
    pub fn shuffle(&mut self) {
        let mut entries: Vec<DumpedItem> = self
            .iter()
            .map(|it| DumpedItem {
                media: it.media.clone(),
                temp: it.temp,
                queueby: it.queueby.clone(),
            })
            .collect();
        entries.shuffle(&mut rand::thread_rng());

        self.clear();
        for entry in entries {
            self.push_unchecked(entry);
        }
        self.current = self.head;
        if self.current.is_some() {
            self.start_playback(None);
        }
    }

    // ── Cursor ─────────────────────────────────────────────────────────

    /// Move to the next item, wrapping when `wrap` is set. A temp item that
    /// was played past is removed.
    pub fn advance(&mut self, wrap: bool) -> Advanced {
        let Some(prev) = self.current else {
            return Advanced::default();
        };

        self.current = self.following(prev, wrap);

        let mut removed_temp = None;
        if self.items.get(&prev).is_some_and(|it| it.temp) {
            if self.current == Some(prev) {
                self.current = None;
            }
            self.unlink(prev);
            self.items.remove(&prev);
            removed_temp = Some(prev);
        }

        if self.current.is_some() {
            self.start_playback(None);
        }

        Advanced {
            removed_temp,
            current: self.current,
        }
    }

    /// Jump straight to `uid`. A temp item being left is removed.
    pub fn jump(&mut self, uid: ItemId) -> Option<Advanced> {
        if !self.items.contains_key(&uid) {
            return None;
        }

        let prev = self.current.replace(uid);
        let mut removed_temp = None;
        if let Some(prev) = prev
            && prev != uid
            && self.items.get(&prev).is_some_and(|it| it.temp)
        {
            self.unlink(prev);
            self.items.remove(&prev);
            removed_temp = Some(prev);
        }

        self.start_playback(None);
        Some(Advanced {
            removed_temp,
            current: Some(uid),
        })
    }

    // ── Clock ──────────────────────────────────────────────────────────

    /// Reset the clock for the current item, optionally resuming at `time`.
    pub fn start_playback(&mut self, time: Option<f64>) {
        let now = Instant::now();
        self.anchor = now;
        self.last_broadcast = now;
        if let Some(uid) = self.current
            && let Some(item) = self.items.get_mut(&uid)
        {
            item.media.current_time = time.unwrap_or(0.0);
            item.media.paused = false;
        }
    }

    /// Accept a playback position from the leader. The report must name the
    /// current media; live media other than seekable streams ignore it.
    pub fn report_time(&mut self, media_id: &str, position: f64, paused: bool) -> Option<TimeUpdate> {
        if !position.is_finite() {
            return None;
        }
        let uid = self.current?;
        let item = self.items.get_mut(&uid)?;
        let media = &mut item.media;
        if media.is_live() && media.media_type != SEEKABLE_LIVE_TYPE {
            return None;
        }
        if media.id != media_id {
            return None;
        }
        media.current_time = position;
        media.paused = paused;
        self.anchor = Instant::now();
        Some(media.time_update())
    }

    /// Advance the server-led clock to `now`.
    pub fn tick(&mut self, now: Instant) -> Tick {
        let Some(uid) = self.current else {
            return Tick::Idle;
        };
        let elapsed = now.saturating_duration_since(self.anchor).as_secs_f64();
        self.anchor = now;

        let Some(item) = self.items.get_mut(&uid) else {
            return Tick::Idle;
        };
        let media = &mut item.media;
        if media.paused {
            return Tick::Idle;
        }
        media.current_time += elapsed;

        // Zero seconds means the length is unknown, so the clock never ends it
        if !media.is_live() && media.seconds > 0 && media.current_time > media.seconds as f64 {
            return Tick::Ended;
        }

        if now.saturating_duration_since(self.last_broadcast) >= MEDIA_UPDATE_INTERVAL {
            self.last_broadcast = now;
            return Tick::Update(media.time_update());
        }
        Tick::Idle
    }

    /// Current item with its clock extrapolated to `now`, for late joiners.
    pub fn snapshot_for_join(&self, now: Instant) -> Option<FullMediaUpdate> {
        let item = self.current()?;
        let mut update = item.media.full_update();
        if !update.paused {
            update.current_time += now.saturating_duration_since(self.anchor).as_secs_f64();
        }
        Some(update)
    }

    // ── Persistence ────────────────────────────────────────────────────

    pub fn dump(&self) -> PlaylistDump {
        let mut pos = 0;
        let mut pl = Vec::with_capacity(self.len());
        for (i, item) in self.iter().enumerate() {
            if Some(item.uid) == self.current {
                pos = i;
            }
            pl.push(DumpedItem {
                media: item.media.clone(),
                temp: item.temp,
                queueby: item.queueby.clone(),
            });
        }
        let time = self.current().map(|it| it.media.current_time).unwrap_or(0.0);
        PlaylistDump { pl, pos, time }
    }

    /// Replace the contents with a dump, resuming the saved item and position.
    pub fn load(&mut self, dump: PlaylistDump) {
        self.clear();
        let mut ids = Vec::with_capacity(dump.pl.len());
        for entry in dump.pl {
            if self.contains_media(&entry.media) {
                continue;
            }
            ids.push(self.push_unchecked(entry));
        }
        self.current = ids.get(dump.pos).or(ids.first()).copied();
        if self.current.is_some() {
            let time = dump.time.is_finite().then_some(dump.time);
            self.start_playback(time);
        }
    }

    // ── Links ──────────────────────────────────────────────────────────

    fn push_unchecked(&mut self, entry: DumpedItem) -> ItemId {
        let uid = self.next_uid;
        self.next_uid += 1;
        let mut media = entry.media;
        media.set_seconds(media.seconds);
        self.items.insert(
            uid,
            PlaylistItem {
                uid,
                media,
                temp: entry.temp,
                queueby: entry.queueby,
                prev: None,
                next: None,
            },
        );
        self.link_after(uid, self.tail);
        uid
    }

    fn following(&self, uid: ItemId, wrap: bool) -> Option<ItemId> {
        match self.items.get(&uid).and_then(|it| it.next) {
            Some(next) => Some(next),
            None if wrap => self.head,
            None => None,
        }
    }

    /// Splice a detached item in after `after` (or at the front).
    fn link_after(&mut self, uid: ItemId, after: Option<ItemId>) {
        let next = match after {
            Some(a) => self.items.get(&a).and_then(|it| it.next),
            None => self.head,
        };

        if let Some(item) = self.items.get_mut(&uid) {
            item.prev = after;
            item.next = next;
        }
        match after {
            Some(a) => {
                if let Some(it) = self.items.get_mut(&a) {
                    it.next = Some(uid);
                }
            }
            None => self.head = Some(uid),
        }
        match next {
            Some(n) => {
                if let Some(it) = self.items.get_mut(&n) {
                    it.prev = Some(uid);
                }
            }
            None => self.tail = Some(uid),
        }
    }

    /// Detach an item from its neighbours; it stays in the arena.
    fn unlink(&mut self, uid: ItemId) {
        let Some((prev, next)) = self.items.get(&uid).map(|it| (it.prev, it.next)) else {
            return;
        };
        match prev {
            Some(p) => {
                if let Some(it) = self.items.get_mut(&p) {
                    it.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(it) = self.items.get_mut(&n) {
                    it.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(item) = self.items.get_mut(&uid) {
            item.prev = None;
            item.next = None;
        }
    }
}

pub struct PlaylistIter<'a> {
    playlist: &'a Playlist,
    cursor: Option<ItemId>,
}

impl<'a> Iterator for PlaylistIter<'a> {
    type Item = &'a PlaylistItem;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.playlist.items.get(&self.cursor?)?;
        self.cursor = item.next;
        Some(item)
    }
}

/// Order a batch queued "next" so it ends up in its original order after
/// being inserted one by one behind the cursor.
pub fn order_for_next<T>(mut batch: Vec<T>, playlist_empty: bool) -> Vec<T> {
    batch.reverse();
    if playlist_empty && let Some(last) = batch.pop() {
        batch.insert(0, last);
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(id: &str, seconds: u64) -> Media {
        Media::new(id, &format!("title {id}"), seconds, "yt")
    }

    fn ids(pl: &Playlist) -> Vec<String> {
        pl.iter().map(|it| it.media.id.clone()).collect()
    }

    fn assert_links(pl: &Playlist) {
        let forward: Vec<ItemId> = pl.iter().map(|it| it.uid).collect();
        assert_eq!(forward.len(), pl.len(), "every item reachable from head");
        let mut back = Vec::new();
        let mut cursor = pl.tail;
        while let Some(uid) = cursor {
            back.push(uid);
            cursor = pl.items[&uid].prev;
        }
        back.reverse();
        assert_eq!(forward, back, "prev links mirror next links");
        if let Some(cur) = pl.current {
            assert!(pl.items.contains_key(&cur));
        }
    }

    #[test]
    fn test_add_assigns_sequential_ids_and_meta() {
        let mut pl = Playlist::new();
        let a = pl.add(media("abc", 120), InsertPosition::Append, false, "alice").unwrap();
        assert_eq!(a.uid, 0);
        assert!(a.started);
        assert_eq!(a.after, None);
        let b = pl.add(media("def", 60), InsertPosition::Append, false, "alice").unwrap();
        assert_eq!(b.uid, 1);
        assert_eq!(b.after, Some(0));
        assert!(!b.started);
        assert_eq!(
            pl.meta(),
            PlaylistMeta {
                count: 2,
                time: "00:03:00".into()
            }
        );
        assert_links(&pl);
    }

    #[test]
    fn test_add_positions() {
        let mut pl = Playlist::new();
        pl.add(media("a", 1), InsertPosition::Append, false, "").unwrap();
        pl.add(media("b", 1), InsertPosition::Append, false, "").unwrap();
        pl.add(media("c", 1), InsertPosition::Prepend, false, "").unwrap();
        pl.add(media("d", 1), InsertPosition::Next, false, "").unwrap();
        assert_eq!(ids(&pl), vec!["c", "a", "d", "b"]);
        assert_links(&pl);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut pl = Playlist::new();
        pl.add(media("a", 1), InsertPosition::Append, false, "").unwrap();
        let err = pl.add(media("a", 1), InsertPosition::Append, false, "");
        assert!(matches!(err, Err(QueueError::Duplicate)));
    }

    #[test]
    fn test_ids_never_reused() {
        let mut pl = Playlist::new();
        let a = pl.add(media("a", 1), InsertPosition::Append, false, "").unwrap();
        pl.remove(a.uid, true);
        pl.clear();
        let b = pl.add(media("a", 1), InsertPosition::Append, false, "").unwrap();
        assert!(b.uid > a.uid);
    }

    #[test]
    fn test_move_rejects_self_and_keeps_links() {
        let mut pl = Playlist::new();
        for id in ["a", "b", "c", "d"] {
            pl.add(media(id, 1), InsertPosition::Append, false, "").unwrap();
        }
        assert!(!pl.move_item(1, Some(1)));
        assert!(!pl.move_item(99, None));
        assert!(!pl.move_item(1, Some(99)));

        assert!(pl.move_item(0, Some(3)));
        assert_eq!(ids(&pl), vec!["b", "c", "d", "a"]);
        assert_links(&pl);

        assert!(pl.move_item(0, None));
        assert_eq!(ids(&pl), vec!["a", "b", "c", "d"]);
        assert_links(&pl);

        assert!(pl.move_item(2, Some(0)));
        assert_eq!(ids(&pl), vec!["a", "c", "b", "d"]);
        assert_links(&pl);
    }

    #[test]
    fn test_remove_current_moves_cursor() {
        let mut pl = Playlist::new();
        for id in ["a", "b"] {
            pl.add(media(id, 1), InsertPosition::Append, false, "").unwrap();
        }
        let removed = pl.remove(0, true).unwrap();
        assert!(removed.current_changed);
        assert_eq!(pl.current_uid(), Some(1));
        let removed = pl.remove(1, true).unwrap();
        assert!(removed.current_changed);
        assert_eq!(pl.current_uid(), None);
        assert!(pl.remove(1, true).is_none());
        assert_links(&pl);
    }

    #[test]
    fn test_advance_wraps_and_drops_temp() {
        let mut pl = Playlist::new();
        pl.add(media("a", 1), InsertPosition::Append, true, "").unwrap();
        pl.add(media("b", 1), InsertPosition::Append, false, "").unwrap();

        let adv = pl.advance(true);
        assert_eq!(adv.removed_temp, Some(0));
        assert_eq!(adv.current, Some(1));
        assert_eq!(pl.len(), 1);

        let adv = pl.advance(true);
        assert_eq!(adv.current, Some(1));
        assert_eq!(adv.removed_temp, None);

        let adv = pl.advance(false);
        assert_eq!(adv.current, None);
        assert_links(&pl);
    }

    #[test]
    fn test_jump() {
        let mut pl = Playlist::new();
        for id in ["a", "b", "c"] {
            pl.add(media(id, 1), InsertPosition::Append, false, "").unwrap();
        }
        assert!(pl.jump(42).is_none());
        let adv = pl.jump(2).unwrap();
        assert_eq!(adv.current, Some(2));
        assert_eq!(pl.current().unwrap().media.id, "c");
    }

    #[test]
    fn test_report_time_requires_current_media() {
        let mut pl = Playlist::new();
        pl.add(media("a", 100), InsertPosition::Append, false, "").unwrap();
        assert!(pl.report_time("other", 5.0, false).is_none());
        assert!(pl.report_time("a", f64::NAN, false).is_none());
        let update = pl.report_time("a", 42.0, true).unwrap();
        assert_eq!(update.current_time, 42.0);
        assert!(update.paused);

        let mut live = Playlist::new();
        live.add(Media::new("chan", "live", 0, "tw"), InsertPosition::Append, false, "")
            .unwrap();
        assert!(live.report_time("chan", 5.0, false).is_none());
    }

    #[test]
    fn test_tick_broadcasts_and_ends() {
        let mut pl = Playlist::new();
        pl.add(media("a", 10), InsertPosition::Append, false, "").unwrap();
        let start = pl.anchor;

        assert_eq!(pl.tick(start + Duration::from_secs(1)), Tick::Idle);
        match pl.tick(start + Duration::from_secs(5)) {
            Tick::Update(u) => assert!((u.current_time - 5.0).abs() < 1e-6),
            other => panic!("expected update, got {other:?}"),
        }
        assert_eq!(pl.tick(start + Duration::from_secs(11)), Tick::Ended);
    }

    #[test]
    fn test_untimed_media_never_ends_on_its_own() {
        let mut pl = Playlist::new();
        pl.add(media("dQw4w9WgXcQ", 0), InsertPosition::Append, false, "").unwrap();
        let start = pl.anchor;

        assert_ne!(pl.tick(start + Duration::from_millis(1100)), Tick::Ended);
        assert_ne!(pl.tick(start + Duration::from_secs(3600)), Tick::Ended);
        assert!(pl.current().is_some());
    }

    #[test]
    fn test_snapshot_for_join_extrapolates() {
        let mut pl = Playlist::new();
        assert!(pl.snapshot_for_join(Instant::now()).is_none());
        pl.add(media("a", 100), InsertPosition::Append, false, "").unwrap();
        pl.report_time("a", 10.0, false).unwrap();
        let snap = pl.snapshot_for_join(pl.anchor + Duration::from_secs(3)).unwrap();
        assert!((snap.current_time - 13.0).abs() < 1e-6);

        pl.report_time("a", 10.0, true).unwrap();
        let snap = pl.snapshot_for_join(pl.anchor + Duration::from_secs(3)).unwrap();
        assert_eq!(snap.current_time, 10.0);
    }

    #[test]
    fn test_dump_load_preserves_order_and_cursor() {
        let mut pl = Playlist::new();
        for id in ["a", "b", "c"] {
            pl.add(media(id, 30), InsertPosition::Append, id == "b", "bob").unwrap();
        }
        pl.jump(1);
        pl.report_time("b", 12.5, false);
        let dump = pl.dump();
        assert_eq!(dump.pos, 1);
        assert_eq!(dump.time, 12.5);

        let json = serde_json::to_string(&dump).unwrap();
        let mut restored = Playlist::new();
        restored.load(serde_json::from_str(&json).unwrap());
        assert_eq!(ids(&restored), vec!["a", "b", "c"]);
        let cur = restored.current().unwrap();
        assert_eq!(cur.media.id, "b");
        assert!(cur.temp);
        assert_eq!(cur.queueby, "bob");
        assert_eq!(cur.media.current_time, 12.5);
        assert_links(&restored);
    }

    #[test]
    fn test_shuffle_keeps_items() {
        let mut pl = Playlist::new();
        for id in ["a", "b", "c", "d", "e"] {
            pl.add(media(id, 1), InsertPosition::Append, false, "").unwrap();
        }
        pl.shuffle();
        let mut after = ids(&pl);
        after.sort();
        assert_eq!(after, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(pl.current_uid(), pl.head());
        assert!(pl.iter().all(|it| it.uid >= 5));
        assert_links(&pl);
    }

    #[test]
    fn test_order_for_next() {
        let mut pl = Playlist::new();
        let batch = order_for_next(vec!["a", "b", "c"], true);
        for id in batch {
            pl.add(media(id, 1), InsertPosition::Next, false, "").unwrap();
        }
        assert_eq!(ids(&pl), vec!["a", "b", "c"]);

        let batch = order_for_next(vec!["x", "y"], false);
        for id in batch {
            pl.add(media(id, 1), InsertPosition::Next, false, "").unwrap();
        }
        assert_eq!(ids(&pl), vec!["a", "x", "y", "b", "c"]);
    }
}

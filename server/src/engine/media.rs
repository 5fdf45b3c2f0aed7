use serde::{Deserialize, Serialize};

/// Media source types that stream live and have no fixed duration.
const LIVE_TYPES: &[&str] = &["li", "tw", "jt", "us", "rt", "jw", "im", "cu", "hb"];

/// Media type that resolves to a list of media rather than a single item.
pub const PLAYLIST_TYPE: &str = "yp";
/// Custom embed type; title comes from the member.
pub const CUSTOM_TYPE: &str = "cu";
/// Live type whose leader may still report playback time.
pub const SEEKABLE_LIVE_TYPE: &str = "jw";
/// Type whose resolved links expire, so it is never written to the library.
pub const UNCACHEABLE_TYPE: &str = "gd";

/// Longest title kept for custom embeds.
const MAX_CUSTOM_TITLE: usize = 100;

pub fn is_live(media_type: &str) -> bool {
    LIVE_TYPES.contains(&media_type)
}

/// Human-readable link for a media id, used in queue failure messages.
pub fn format_link(id: &str, media_type: &str) -> String {
    match media_type {
        "yt" => format!("https://youtu.be/{id}"),
        "vi" => format!("https://vimeo.com/{id}"),
        "dm" => format!("https://dailymotion.com/video/{id}"),
        "yp" => format!("https://youtube.com/playlist?list={id}"),
        "li" => format!("https://livestream.com/{id}"),
        "tw" => format!("https://twitch.tv/{id}"),
        "us" => format!("https://ustream.tv/{id}"),
        "gd" => format!("https://docs.google.com/file/d/{id}"),
        "im" => format!("https://imgur.com/a/{id}"),
        "hb" => format!("https://hitbox.tv/{id}"),
        _ => id.to_string(),
    }
}

/// Format seconds as `HH:MM:SS`.
pub fn format_time(total: u64) -> String {
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Extra per-media notes that travel with the item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMeta {
    /// Countries where the media is blocked, as reported by the resolver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restricted: Option<String>,
}

/// A resolved media descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    pub id: String,
    pub title: String,
    pub seconds: u64,
    /// `seconds` pre-formatted for clients.
    #[serde(default)]
    pub duration: String,
    #[serde(rename = "type")]
    pub media_type: String,
    #[serde(default)]
    pub meta: MediaMeta,
    #[serde(rename = "currentTime", default, skip_serializing)]
    pub current_time: f64,
    #[serde(default, skip_serializing)]
    pub paused: bool,
}

impl Media {
    pub fn new(id: &str, title: &str, seconds: u64, media_type: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            seconds,
            duration: format_time(seconds),
            media_type: media_type.to_string(),
            meta: MediaMeta::default(),
            current_time: 0.0,
            paused: false,
        }
    }

    pub fn is_live(&self) -> bool {
        is_live(&self.media_type)
    }

    pub fn link(&self) -> String {
        format_link(&self.id, &self.media_type)
    }

    pub fn set_seconds(&mut self, seconds: u64) {
        self.seconds = seconds;
        self.duration = format_time(seconds);
    }

    /// Custom embeds may carry a member-supplied title, capped for display.
    pub fn set_custom_title(&mut self, title: &str) {
        self.title = if title.chars().count() > MAX_CUSTOM_TITLE {
            let mut t: String = title.chars().take(MAX_CUSTOM_TITLE - 3).collect();
            t.push_str("...");
            t
        } else {
            title.to_string()
        };
    }

    /// Same source, regardless of title or timing.
    pub fn same_source(&self, other: &Media) -> bool {
        self.id == other.id && self.media_type == other.media_type
    }

    pub fn time_update(&self) -> TimeUpdate {
        TimeUpdate {
            current_time: self.current_time,
            paused: self.paused,
        }
    }

    /// Full media packet with the playback position, sent on `changeMedia`.
    pub fn full_update(&self) -> FullMediaUpdate {
        FullMediaUpdate {
            media: self.clone(),
            current_time: self.current_time,
            paused: self.paused,
        }
    }
}

/// Clock state broadcast on `mediaUpdate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeUpdate {
    #[serde(rename = "currentTime")]
    pub current_time: f64,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FullMediaUpdate {
    #[serde(flatten)]
    pub media: Media,
    #[serde(rename = "currentTime")]
    pub current_time: f64,
    pub paused: bool,
}

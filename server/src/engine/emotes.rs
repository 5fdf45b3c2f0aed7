use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::sanitize::TextSanitizer;

/// Longest emote image URL kept.
pub const MAX_IMAGE_LENGTH: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emote {
    pub name: String,
    pub image: String,
    /// Pattern clients use to find the emote in chat text.
    pub source: String,
}

impl Emote {
    /// Build an emote, deriving its match pattern from the name.
    pub fn new(name: &str, image: &str, sanitizer: &dyn TextSanitizer) -> Self {
        let image: String = image.chars().take(MAX_IMAGE_LENGTH).collect();
        Self {
            name: name.to_string(),
            image: sanitizer.sanitize_text(&image),
            source: emote_source(name),
        }
    }
}

/// `(^|\s)<name>($|\s)`, with the name escaped for regex use and for the
/// HTML it will be matched against.
pub fn emote_source(name: &str) -> String {
    let html = name
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    format!(r"(^|\s){}($|\s)", regex::escape(&html))
}

/// Check an emote submitted by a member.
pub fn validate_emote(data: &Value, sanitizer: &dyn TextSanitizer) -> Option<Emote> {
    let name = data.get("name")?.as_str()?;
    let image = data.get("image")?.as_str()?;
    if name.is_empty() {
        return None;
    }
    Some(Emote::new(name, image, sanitizer))
}

/// The room's emote list, keyed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmoteList {
    emotes: Vec<Emote>,
}

impl EmoteList {
    pub fn len(&self) -> usize {
        self.emotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emotes.is_empty()
    }

    pub fn as_slice(&self) -> &[Emote] {
        &self.emotes
    }

    /// Replace the emote with the same name, or append it.
    pub fn update(&mut self, emote: Emote) {
        match self.emotes.iter_mut().find(|e| e.name == emote.name) {
            Some(existing) => *existing = emote,
            None => self.emotes.push(emote),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Emote> {
        let idx = self.emotes.iter().position(|e| e.name == name)?;
        Some(self.emotes.remove(idx))
    }

    pub fn import(&mut self, emotes: Vec<Emote>) {
        self.emotes = emotes;
    }

    /// Restore from stored entries, re-deriving each pattern.
    pub fn from_stored(stored: Vec<Emote>, sanitizer: &dyn TextSanitizer) -> Self {
        let mut list = Self::default();
        for e in stored {
            if !e.name.is_empty() {
                list.update(Emote::new(&e.name, &sanitizer.decode_text(&e.image), sanitizer));
            }
        }
        list
    }
}

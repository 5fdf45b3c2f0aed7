use std::collections::VecDeque;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::permissions::{LEADER_RANK, Rank};

/// Chat text is cut to this many characters before anything else runs.
pub const MAX_CHAT_LENGTH: usize = 240;
/// Messages replayed to members on join.
pub const CHAT_HISTORY_LEN: usize = 15;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMeta {
    #[serde(rename = "addClass", default, skip_serializing_if = "Option::is_none")]
    pub add_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modflair: Option<f64>,
    #[serde(
        rename = "addClassToNameAndTimestamp",
        default,
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub add_class_to_name_and_timestamp: bool,
}

impl ChatMeta {
    pub fn with_class(class: &str) -> Self {
        Self {
            add_class: Some(class.to_string()),
            ..Self::default()
        }
    }
}

/// A message as broadcast on `chatMsg` and kept in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub username: String,
    pub msg: String,
    #[serde(default)]
    pub meta: ChatMeta,
    pub time: i64,
}

impl ChatMessage {
    pub fn new(username: &str, msg: String, meta: ChatMeta) -> Self {
        Self {
            username: username.to_string(),
            msg,
            meta,
            time: Utc::now().timestamp_millis(),
        }
    }
}

/// A private message as sent on `pm`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrivateMessage {
    pub username: String,
    pub to: String,
    pub msg: String,
    pub meta: ChatMeta,
    pub time: i64,
}

/// The last few chat messages, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatHistory {
    messages: VecDeque<ChatMessage>,
}

impl ChatHistory {
    pub fn push(&mut self, msg: ChatMessage) {
        self.messages.push_back(msg);
        while self.messages.len() > CHAT_HISTORY_LEN {
            self.messages.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }

    pub fn to_vec(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }

    pub fn from_vec(messages: Vec<ChatMessage>) -> Self {
        let mut history = Self::default();
        for msg in messages {
            history.push(msg);
        }
        history
    }
}

pub fn truncate_chat(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

// ── Commands ────────────────────────────────────────────────────────────

/// What a slash command asks the room to do.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// Not a command; send the text as ordinary chat.
    Declined,
    /// Swallowed without effect.
    Consumed,
    /// Send a rewritten message.
    Send { msg: String, meta: ChatMeta },
    /// Take `count` drinks, announcing `msg`.
    Drink { msg: String, count: i64 },
    ToggleAfk,
    Mute { target: String, shadow: bool },
    Unmute { target: String },
    Kick { target: String, reason: String },
    Ban { target: String, reason: String, ip: bool, range: bool },
}

/// Interprets chat text that starts with `/`.
pub trait CommandInterpreter: Send + Sync {
    fn interpret(&self, sender_rank: Rank, msg: &str) -> CommandOutcome;
}

/// The stock command set.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinCommands;

const MAX_DRINKS_PER_COMMAND: i64 = 10_000;

fn split_command(msg: &str) -> (&str, &str) {
    let body = msg.strip_prefix('/').unwrap_or(msg);
    match body.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim_start()),
        None => (body, ""),
    }
}

fn split_target(args: &str) -> (String, String) {
    match args.split_once(char::is_whitespace) {
        Some((target, reason)) => (target.to_string(), reason.trim().to_string()),
        None => (args.trim().to_string(), String::new()),
    }
}

impl CommandInterpreter for BuiltinCommands {
    fn interpret(&self, sender_rank: Rank, msg: &str) -> CommandOutcome {
        if !msg.starts_with('/') {
            return CommandOutcome::Declined;
        }
        let (cmd, args) = split_command(msg);

        if let Some(count) = cmd.strip_prefix('d')
            && (count.is_empty() || count.parse::<i64>().is_ok())
        {
            let count = count
                .parse::<i64>()
                .unwrap_or(1)
                .clamp(-MAX_DRINKS_PER_COMMAND, MAX_DRINKS_PER_COMMAND);
            return CommandOutcome::Drink {
                msg: args.to_string(),
                count,
            };
        }

        match cmd {
            "me" => CommandOutcome::Send {
                msg: args.to_string(),
                meta: ChatMeta::with_class("action"),
            },
            "sp" => CommandOutcome::Send {
                msg: args.to_string(),
                meta: ChatMeta::with_class("spoiler"),
            },
            "say" if sender_rank >= LEADER_RANK => CommandOutcome::Send {
                msg: args.to_string(),
                meta: ChatMeta::with_class("shout"),
            },
            "say" => CommandOutcome::Consumed,
            "afk" => CommandOutcome::ToggleAfk,
            "mute" | "smute" if !args.is_empty() => CommandOutcome::Mute {
                target: split_target(args).0,
                shadow: cmd == "smute",
            },
            "unmute" if !args.is_empty() => CommandOutcome::Unmute {
                target: split_target(args).0,
            },
            "kick" if !args.is_empty() => {
                let (target, reason) = split_target(args);
                CommandOutcome::Kick { target, reason }
            }
            "ban" | "ipban" if !args.is_empty() => {
                let (target, rest) = split_target(args);
                let (range, reason) = match rest.strip_prefix("range") {
                    Some(r) if cmd == "ipban" => (true, r.trim().to_string()),
                    _ => (false, rest),
                };
                CommandOutcome::Ban {
                    target,
                    reason,
                    ip: cmd == "ipban",
                    range,
                }
            }
            "mute" | "smute" | "unmute" | "kick" | "ban" | "ipban" => CommandOutcome::Consumed,
            _ => CommandOutcome::Declined,
        }
    }
}

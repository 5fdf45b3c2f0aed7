pub mod channel;
pub mod channel_log;
pub mod chat;
pub mod emotes;
pub mod error;
pub mod events;
pub mod filter;
pub mod media;
pub mod member;
pub mod mutation_queue;
pub mod options;
pub mod permissions;
pub mod persistence;
pub mod playlist;
pub mod poll;
pub mod rate_limiter;
pub mod registry;
pub mod sanitize;
pub mod services;
pub mod validation;

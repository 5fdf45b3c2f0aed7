pub mod aliases;
pub mod bans;
pub mod channels;
pub mod library;
pub mod playlists;
pub mod users;

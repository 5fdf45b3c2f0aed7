use thiserror::Error;

/// Failure of an external lookup (metadata resolver or database).
#[derive(Debug, Clone, Error)]
pub enum LookupError {
    #[error("{0}")]
    Resolver(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Media not found")]
    NotFound,
}

/// Why a playlist addition was refused.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("Maximum length exceeded: {0} seconds")]
    MaxLength(u64),
    #[error("You are adding videos too quickly")]
    Throttled,
    #[error("This item is already on the playlist")]
    Duplicate,
    #[error("You don't have permission to add livestreams")]
    LiveNotAllowed,
    #[error("You don't have permission to add custom embeds")]
    CustomNotAllowed,
    #[error("Channel is shutting down")]
    Dead,
    #[error(transparent)]
    Lookup(#[from] LookupError),
}

/// Snapshot load failures. Every variant sets the sticky error flag.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot is {size} bytes, limit is {limit}")]
    Oversized { size: u64, limit: u64 },
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot parse: {0}")]
    Parse(#[from] serde_json::Error),
}

impl SnapshotError {
    /// Notice shown in place of the MOTD while the room runs degraded.
    pub fn motd_notice(&self) -> &'static str {
        match self {
            SnapshotError::Oversized { .. } => {
                "Your channel file has exceeded the maximum size of 1MB and cannot be loaded. \
                 Please ask an administrator for assistance in restoring it."
            }
            _ => "Channel state load failed. Contact an administrator.",
        }
    }
}

/// Reasons a member is refused entry to a room.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("You're banned!")]
    Banned,
    #[error("This channel is password protected")]
    PasswordRequired,
    #[error("Channel is shutting down")]
    Dead,
}

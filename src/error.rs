/// Errors crossing component boundaries inside one venue context.
///
/// Cloneable so a single failure can be handed to every caller coalesced on
/// the same in-flight computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// An adapter callback failed.
    Adapter(String),
    Journal(String),
    Serialization(String),
    LimitExceeded(&'static str),
    InvalidVenue(String),
    NotInitialized(String),
    ShutDown(String),
}

impl SyncError {
    pub fn adapter(e: impl std::fmt::Display) -> Self {
        SyncError::Adapter(e.to_string())
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Adapter(e) => write!(f, "adapter error: {e}"),
            SyncError::Journal(e) => write!(f, "cache journal error: {e}"),
            SyncError::Serialization(e) => write!(f, "serialization error: {e}"),
            SyncError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            SyncError::InvalidVenue(msg) => write!(f, "invalid venue: {msg}"),
            SyncError::NotInitialized(venue) => write!(f, "venue {venue} is not initialized"),
            SyncError::ShutDown(venue) => write!(f, "venue {venue} has been shut down"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

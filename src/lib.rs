pub mod adapter;
pub mod cache;
pub mod config;
pub mod error;
pub mod limits;
pub mod manager;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod singleflight;
pub mod tags;
pub mod venue;
pub mod wal;

pub use adapter::{Adapter, AdapterResult, AttractionTemplate};
pub use cache::{Cache, Ttl};
pub use config::SyncConfig;
pub use error::SyncError;
pub use manager::VenueManager;
pub use venue::{Venue, VenueSettings};

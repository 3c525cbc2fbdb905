//! Authenticated, paginated, cache-aware ingest from the game server's API.

pub mod auth;
pub mod client;
pub mod endpoints;
pub mod status;

pub use auth::TokenManager;
pub use client::{CallOptions, EsiTransport, ResponseMeta, DEFAULT_BASE_URL};
pub use endpoints::EsiClient;
pub use status::{FetchState, FetchStatusTracker};

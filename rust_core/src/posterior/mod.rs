//! Team posterior persistence.

pub mod cache;
pub mod schema;
pub mod store;

pub use cache::{Clock, ManualClock, PosteriorCache, SystemClock};
pub use schema::{decode_posterior, encode_posterior, StoredPosterior};
pub use store::{InMemoryBackend, PosteriorBackend, PosteriorStore};

//! PostgreSQL adapters.
//!
//! Tables:
//! - `team_posteriors(team_id PK, posterior JSONB, updated_at)`
//! - `game_labels(...)`, read in date order, `processed` flipped once,
//!   unusable rows quarantined through `failure_reason`
//! - `upcoming_games(...)` with market odds as JSONB

pub mod games;
pub mod pool;
pub mod posteriors;

pub use games::PgGameSource;
pub use pool::{create_pool, DbPoolConfig};
pub use posteriors::PgPosteriorBackend;

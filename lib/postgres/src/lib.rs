//! PostgreSQL backend for the World contract.
//!
//! Storage follows the repository idiom: one store per entity, private row
//! structs deriving `FromRow`, explicit conversions into contract types.
//! State transitions run inside a transaction with `SELECT ... FOR UPDATE`
//! and write derived timestamps with `COALESCE`, so concurrent observers of
//! the same transition produce at most one timestamp write.
//!
//! The streamer is poll-based: readers fetch `id > last_seen` at a bounded
//! cadence. The queue is injected: in production the NATS JetStream queue,
//! under test the in-process one.

pub mod events;
pub mod hooks;
pub mod runs;
pub mod steps;
pub mod streamer;
pub mod values;
pub mod world;

pub use events::PostgresEventStore;
pub use hooks::PostgresHookStore;
pub use runs::PostgresRunStore;
pub use steps::PostgresStepStore;
pub use streamer::PostgresStreamer;
pub use world::PostgresWorld;

use worldkit_core::WorldError;

/// Maps a store error from an insert, classifying unique violations as
/// `Conflict` and everything else as `Internal`.
pub(crate) fn map_insert_error(error: sqlx::Error, entity: &'static str, id: &str) -> WorldError {
    if let sqlx::Error::Database(db) = &error
        && db.is_unique_violation()
    {
        return WorldError::conflict(entity, id);
    }
    WorldError::internal(error)
}

/// Applies schema migrations.
///
/// # Errors
///
/// Returns `Internal` when a migration fails to apply.
pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), WorldError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(WorldError::internal)
}

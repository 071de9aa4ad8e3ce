// =============================================================================
// Store layer — connection pool, schema bootstrap, batch writer, watchdog
// =============================================================================

pub mod schema;
pub mod store;
pub mod watchdog;
pub mod writer;

pub use store::connect_pool;
pub use writer::BatchWriter;

pub mod schema;
pub mod sqlite;
pub mod store;

pub use sqlite::SqliteStateStore;
pub use store::StateStore;

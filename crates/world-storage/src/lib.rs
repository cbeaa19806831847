// SQL storage layer over postgres / mysql / sqlite

pub mod adapter;
pub mod model;
pub mod mysql;
pub mod postgres;
pub mod schema;
pub mod sqlite;
pub mod store;

pub use adapter::{DatabaseKind, DbPool};
pub use mysql::MySqlStorage;
pub use postgres::PostgresStorage;
pub use sqlite::SqliteStorage;
pub use store::{EventStore, HookStore, RunStore, StepStore};

pub mod database;
pub mod error;
pub mod memory;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod store;

pub use database::Database;
pub use error::StoreError;
pub use memory::MemorySessionStore;
pub use sessions::SqliteSessionStore;
pub use store::SessionStore;

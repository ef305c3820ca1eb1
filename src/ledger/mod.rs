pub mod memory;
pub mod models;
pub mod repository;
pub mod store;

pub use memory::MemoryEntityStore;
pub use repository::PgEntityStore;
pub use store::EntityStore;

pub mod memory;
pub mod postgres;
pub mod retry;
pub mod store;
pub mod supabase;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use retry::*;
pub use store::*;

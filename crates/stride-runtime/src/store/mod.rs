mod memory;
mod postgres;

pub use memory::MemoryTransactionStore;
pub use postgres::PgTransactionStore;

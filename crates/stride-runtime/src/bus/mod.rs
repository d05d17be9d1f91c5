mod memory;
mod postgres;

pub use memory::MemoryEventBus;
pub use postgres::{PgEventBus, PgEventBusConfig};

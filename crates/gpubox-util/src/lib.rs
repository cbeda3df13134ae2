pub mod pool;
pub mod transport;

pub use pool::{PoolConfig, PoolError, PoolStats, Saturation, WorkerPool};
pub use transport::{Connection, Discipline, Received, TransportError, MAX_HANDLES};

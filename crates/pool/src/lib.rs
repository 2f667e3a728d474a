//! Generic async resource pool, specialised to pooled upstream HTTP
//! connections.

pub mod buffer;
pub mod guard;
pub mod pool;
pub mod upstream;

pub use buffer::{BufferPool, PooledBuffer};
pub use guard::Guard;
pub use pool::{Pool, PoolConfig, PoolStats, Resource};
pub use upstream::{UpstreamConfig, UpstreamConnection};

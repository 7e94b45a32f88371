// Cache layer: per-id disk artifacts plus the refcounted memory LRU.
pub mod disk;
pub mod memory;

pub use disk::{deserialize, serialize, CacheStore, CacheValidity, CACHE_SIGNATURE};
pub use memory::{MemoryCache, DEFAULT_IDLE_EXPIRY, DEFAULT_MEMORY_BUDGET};

pub mod cache;
pub mod json;
pub mod lock;

pub use cache::{CacheChild, CacheEntry, CacheStore};
pub use lock::{CacheLock, LockMode};

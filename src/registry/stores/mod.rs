//! # Registry Stores Module
//!
//! Document store implementations: in-memory and Redis-based.

pub mod memory;
pub mod redis_store;

pub use memory::InMemoryStore;
pub use redis_store::RedisStore;

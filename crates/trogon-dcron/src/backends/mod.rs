pub mod memory;
pub mod nats_kv;
#[cfg(feature = "redis")]
pub mod redis;

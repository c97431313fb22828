mod inmemory;
#[cfg(feature = "redis-backend")]
mod redis;

pub use inmemory::InMemoryStubRepository;
#[cfg(feature = "redis-backend")]
pub use self::redis::RedisStubRepository;

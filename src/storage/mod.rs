pub mod memory;
pub mod queue;
pub mod redis_broker;

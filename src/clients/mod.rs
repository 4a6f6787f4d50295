pub mod circuit_breaker;
pub mod health;
pub mod queue;
pub mod rbmq;
pub mod redis;
pub mod store;
pub mod template;

pub mod attempt;
pub mod circuit_breaker;
pub mod health;
pub mod message;
pub mod notification;
pub mod response;
pub mod retry;
pub mod status;
pub mod template;
pub mod validation;
pub mod vendor;

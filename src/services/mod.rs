pub mod gateway;
pub mod monitor;
pub mod orchestrator;
pub mod selector;
pub mod worker;

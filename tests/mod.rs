mod common;

mod orchestrator_tests;
mod redis_tests;
mod retry_tests;

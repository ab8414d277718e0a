pub mod chain;
pub mod config;
pub mod error;
pub mod executor;
pub mod gate;
pub mod llm;
pub mod payment;
pub mod plan;
pub mod planner;
pub mod server;
pub mod tools;
pub mod validator;

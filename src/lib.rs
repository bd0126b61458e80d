pub mod advisor;
pub mod agent;
pub mod cancel;
pub mod catalog;
pub mod config;
pub mod error;
pub mod http;
pub mod llm;
pub mod server;
pub mod session;
pub mod tools;

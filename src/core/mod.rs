pub mod chat_stream;
pub mod config;
pub mod constants;
pub mod engine;
pub mod health;
pub mod message;
pub mod pipeline;
pub mod session;

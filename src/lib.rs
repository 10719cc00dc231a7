//! Palaver connects a locally hosted language model to external tool
//! backends and streams the resulting conversation with minimal time to
//! first token.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`mcp`] owns tool-protocol integration: one transport adapter per
//!   backend kind (subprocess, HTTP event-stream, persistent socket), the
//!   merged tool registry, and the connection manager that supervises
//!   backend lifecycle.
//! - [`core`] owns the engine client with its pooled connections and
//!   warmup paths, the lazily initialized agent session that runs the
//!   tool-augmented chat loop, and the stream pipeline that frames events
//!   for the wire.
//! - [`api`] defines the request and response payloads spoken to the
//!   inference engine.
//! - [`utils`] holds small shared helpers.
//!
//! Configuration loading, HTTP routing, and presentation live outside this
//! crate; hosts construct [`core::engine::EngineClient`] and
//! [`mcp::manager::ConnectionManager`] from already-typed configuration
//! and route requests into [`core::session::AgentSession`] and
//! [`core::pipeline::StreamPipeline`].

pub mod api;
pub mod core;
pub mod mcp;
pub mod utils;

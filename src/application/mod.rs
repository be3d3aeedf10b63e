//! Application layer - orchestration of domain logic.
//!
//! This layer coordinates the domain types and owns the runtime behavior:
//! - Admission gate (fixed-window limits over a shared counter store)
//! - Feature cache (TTL entries with lazy and background eviction)
//! - Feature pipeline (validate, transform, monitor)
//! - Connection registry (subscriber tracking and fan-out)
//! - Serving context (one request end to end)
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters must implement. This keeps the application layer independent
//! from infrastructure details.

pub mod admission;
pub mod cache;
pub mod circuit_breaker;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod ports;
pub mod registry;
pub mod service;

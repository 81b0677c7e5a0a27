//! Bulwark - Rate Limiting & Abuse Detection Engine
//!
//! This crate implements fixed-window rate limiting over a pluggable counter
//! store, a time-bounded block list and a small attack pattern detector. An
//! axum middleware and HTTP service expose the engine to callers.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;

//! Rate Admission - request admission control
//!
//! This crate decides, per request, whether a caller keyed by an identifier
//! (user id, IP, resource name) may proceed under a configured budget. The core
//! is an in-memory sliding window counter with one lock per key; a fixed window
//! counter and a Redis-backed counter cover the simpler cases.

pub mod config;
pub mod error;
pub mod ratelimit;

//! Tollgate - Admission Control for Expensive Operations
//!
//! This crate implements per-client, per-policy sliding-window rate limiting
//! for operations that are costly to run, such as calls into a metered AI
//! service or mutating database writes. Callers ask for a decision right
//! before performing the protected operation and decline it with a 429 when
//! the client's window is full.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;

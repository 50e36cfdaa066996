//! Gatekeeper - Token-Bucket Rate Limiting for Analytics Ingestion
//!
//! This crate throttles the chargeable endpoints of an analytics backend with
//! a per-caller and a global token bucket. Bucket state is shared between
//! instances through Redis, stored as versioned binary snapshots that expire
//! once the bucket would have refilled. Within one process, updates to the
//! same key are serialized by a fixed set of striped locks.

pub mod codec;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

//! Coordkit - concurrency coordination primitives
//!
//! This crate provides the building blocks a web service uses to coordinate
//! concurrent work: period limiters that cap operations per key and window
//! (in process or shared through redis), a re-entrant lock whose state lives
//! in a shared store, and an in-process TTL cache with scheduled eviction.

pub mod cache;
mod clock;
pub mod config;
pub mod error;
pub mod lock;
pub mod ratelimit;
pub mod store;
pub mod task;

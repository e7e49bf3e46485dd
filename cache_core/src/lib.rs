//! Simulation core for the cache teaching tool.
//!
//! A [`Session`](exercise::Session) drives a sequence of memory operations
//! against a [`Cache`](cache::Cache) backed by a word-addressable
//! [`Memory`](memory::Memory), and grades student answers (address
//! decomposition, hit/miss prediction) against the ground truth the cache
//! produces. Presentation is left entirely to the caller.

pub mod cache;
pub mod exercise;
pub mod exercises;
pub mod memory;

#[cfg(feature = "stat")]
pub mod stat;

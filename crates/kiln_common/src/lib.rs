//! Shared foundational types used across the Kiln build cache.
//!
//! This crate provides content hashing and the lexical path helpers used to
//! derive stable module identities.

#![warn(missing_docs)]

pub mod hash;
pub mod path;

pub use hash::ContentHash;

//! Hashing primitives used to fingerprint blocks

pub mod hash;

pub use hash::*;

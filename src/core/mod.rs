//! Core primitives.
//!
//! Leaf types shared by every other module: grid positions, the seeded
//! PRNG and the lock helpers that encode the global lock order.

pub mod position;
pub mod rng;
pub mod sync;

// Re-export core types
pub use position::Position;
pub use rng::{DeterministicRng, derive_audio_seed};

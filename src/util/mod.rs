//! Internal utilities.
//!
//! Intentionally minimal and dependency-light so that seeded runs stay
//! reproducible.

pub mod det_rng;

pub use det_rng::DetRng;

//! Pure types, audio math and frame indexing.
//!
//! No async runtime, no I/O, no platform dependencies.

pub mod chunk;
pub mod error;
pub mod mirror;
pub mod types;
pub mod wav;

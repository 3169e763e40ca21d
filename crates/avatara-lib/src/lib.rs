//! Talking-avatar session engine.
//!
//! Audio ingest, feature windowing, batched rendering, compositing, pacing,
//! recording, speech synthesis, the session controller and its HTTP API.
//! Depends on avatara-core for plain types and audio math.

pub mod assets;
pub mod cache;
pub mod compositor;
pub mod custom;
pub mod error;
pub mod features;
pub mod ingest;
pub mod pacer;
pub mod recorder;
pub mod registry;
pub mod renderer;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod stage;
pub mod synth;
pub mod transport;
pub mod windower;

// Re-export avatara-core for convenience
pub use avatara_core;

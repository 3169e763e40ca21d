//! Error taxonomy for the session engine.
//!
//! Only [`SessionError`] reaches callers. The others are absorbed by the
//! stage that produced them and logged.

use std::io;

use thiserror::Error;

use avatara_core::error::ConfigError;
use avatara_core::types::Region;

/// Speech synthesis backend failure. The utterance degrades to silence.
#[derive(Error, Debug)]
pub enum SynthError {
    #[error("synthesis request failed: {0}")]
    Request(String),

    #[error("synthesis backend returned {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("synthesis stream broke: {0}")]
    Stream(String),
}

/// Failure of one inference batch. The batch is emitted as no-op slots.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("inference failed: {0}")]
    Inference(String),

    #[error("renderer returned {got} crops for a batch of {expected}")]
    BatchShape { expected: usize, got: usize },

    #[error("bad renderer input: {0}")]
    Input(String),
}

/// Failure to compose one frame. The frame is dropped.
#[derive(Error, Debug)]
pub enum CompositeError {
    #[error("cycle index {index} out of range for {len} frames")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("region {region:?} does not fit a {width}x{height} frame")]
    RegionOutOfBounds {
        region: Region,
        width: u32,
        height: u32,
    },

    #[error("empty crop")]
    EmptyCrop,

    #[error("mask {mask_w}x{mask_h} does not match blend box {box_w}x{box_h}")]
    MaskShape {
        mask_w: u32,
        mask_h: u32,
        box_w: u32,
        box_h: u32,
    },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("already recording")]
    AlreadyRecording,

    #[error("not recording")]
    NotRecording,

    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(io::Error),

    #[error("recording pipe failed: {0}")]
    Io(#[from] io::Error),

    #[error("muxing failed: {0}")]
    Mux(String),
}

/// Errors surfaced by the session control surface.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("audio chunk has {got} samples, expected {expected}")]
    ChunkSize { expected: usize, got: usize },

    #[error("undecodable audio: {0}")]
    Audio(String),

    #[error("failed to spawn {stage} thread: {source}")]
    Spawn { stage: &'static str, source: io::Error },

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("session {0} not found")]
    NotFound(u32),

    #[error("session is shut down")]
    Closed,
}

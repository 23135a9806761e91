//! Crate-wide error types.
//!
//! Library code returns `Result<T>` and propagates with `?`; panics are
//! reserved for genuinely unreachable states (documented at the call site).

use thiserror::Error;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Hid(#[from] HidError),
}

/// Errors raised by the video transcoding pipeline and its stages.
///
/// Most of these are handled locally (see the design notes on error
/// handling): only `CaptureLost` and `FatalEncode` escalate to the
/// supervisor and trigger a backoff/restart cycle.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to decode JPEG frame: {0}")]
    TransientDecode(String),

    #[error("encoder produced no output for frame {frame_number}")]
    TransientEncode { frame_number: u64 },

    #[error("encoder reported a fatal failure: {0}")]
    FatalEncode(String),

    #[error("capture device lost: {0}")]
    CaptureLost(String),

    #[error("stage '{stage}' queue full, dropped job")]
    BackpressureDrop { stage: String },

    #[error("unsupported pixel format: {0:?}")]
    UnsupportedFormat(crate::video::format::PixelFormat),

    #[error("parser invariant violated: {0}")]
    ParserInvariant(String),
}

/// Errors raised by the reverse-direction HID input path.
#[derive(Error, Debug)]
pub enum HidError {
    #[error("input report truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("input report identifier {got} did not advance past {last}")]
    StaleIdentifier { got: u32, last: u32 },

    #[error("gadget sink '{sink}' write failed: {reason}")]
    SinkWrite { sink: String, reason: String },
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AppError>;

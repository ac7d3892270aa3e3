//! Lossless block encoding.
//!
//! Blocks go through optional false-stereo collapse, wasted-bit removal
//! and joint-stereo transform, then adaptive decorrelation passes and
//! three-median entropy coding. Achieves 2-3x compression on typical
//! audio while preserving every bit.

pub mod decorrelate;
pub mod encoder;
pub mod entropy;

pub use decorrelate::{term_history_len, Decorrelator, SlotState};
pub use encoder::Encoder;
pub use entropy::ResidualCoder;

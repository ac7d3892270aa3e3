//! Lossless block audio encoder.
//!
//! Streams of little-endian blocks, each carrying a fixed 32-byte header
//! and a list of sub-blocks: decorrelation state, entropy state, optional
//! RIFF passthrough chunks and the residual bitstream itself. Multichannel
//! audio splits into mono and stereo blocks by the WAVE channel mask, and
//! an MD5 of the raw PCM rides in a trailing metadata block.
//!
//! The [`Encoder`] builder is the main entry point:
//!
//! ```
//! use libwv_audio::Encoder;
//!
//! let samples: Vec<i32> = vec![0; 8820]; // a tenth of a second of stereo silence
//! let stream = Encoder::new(44100, 2, 16)
//!     .unwrap()
//!     .decorrelation_passes(2)
//!     .unwrap()
//!     .joint_stereo(true)
//!     .encode(&samples)
//!     .unwrap();
//! assert_eq!(&stream[0..4], b"wvpk");
//! ```

pub mod core;
pub mod lossless;
pub mod pcm;

mod writer;

pub use core::{
    channel_mask_splits, sample_rate_code, BitAccumulator, BitRecorder, BitWrite, BitWriter,
    EncodeOptions, EncodeStats, Endianness, WvResult, HEADER_SIZE, MAGIC, SAMPLE_RATES, VERSION,
};
pub use lossless::Encoder;
pub use pcm::{InterleavedSource, PcmSource};

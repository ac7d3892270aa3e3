//! common types and constants for the block stream

use serde::{Deserialize, Serialize};

/// Result type used throughout the encoder.
pub type WvResult<T> = Result<T, String>;

/// Block magic, "wvpk" once serialized little-endian.
pub const MAGIC: u32 = 0x6B70_7677;

/// Stream version carried in every block header.
pub const VERSION: u16 = 0x407;

/// Size of the fixed block header in bytes.
pub const HEADER_SIZE: u32 = 32;

/// Decorrelation weights stay inside [-WEIGHT_MAXIMUM, WEIGHT_MAXIMUM].
pub const WEIGHT_MAXIMUM: i32 = 1024;

/// Unary prefixes at or above this length use the escape encoding.
pub const UNARY_LIMIT: u32 = 16;

/// Sample rates with a dedicated 4-bit header code; anything else
/// stores the reserved code 0xF.
pub const SAMPLE_RATES: [u32; 15] = [
    6000, 8000, 9600, 11025, 12000, 16000, 22050, 24000, 32000, 44100, 48000, 64000, 88200, 96000,
    192000,
];

/// 4-bit header code for a sample rate.
pub fn sample_rate_code(sample_rate: u32) -> u32 {
    SAMPLE_RATES
        .iter()
        .position(|&rate| rate == sample_rate)
        .map(|i| i as u32)
        .unwrap_or(0xF)
}

/// 2-bit header code for a supported bit depth.
pub fn bits_per_sample_code(bits_per_sample: u32) -> u32 {
    match bits_per_sample {
        8 => 0,
        16 => 1,
        24 => 2,
        32 => 3,
        other => panic!("unsupported bit depth {}", other),
    }
}

// sub-block function codes (5 bits)
pub const FN_DUMMY: u32 = 0x0;
pub const FN_DECORR_TERMS: u32 = 0x2;
pub const FN_DECORR_WEIGHTS: u32 = 0x3;
pub const FN_DECORR_SAMPLES: u32 = 0x4;
pub const FN_ENTROPY_VARIABLES: u32 = 0x5;
pub const FN_INT32_INFO: u32 = 0x9;
pub const FN_BITSTREAM: u32 = 0xA;
pub const FN_CHANNEL_INFO: u32 = 0xD;

// non-decoder sub-block function codes
pub const FN_WAVE_HEADER: u32 = 0x1;
pub const FN_WAVE_FOOTER: u32 = 0x2;
pub const FN_MD5: u32 = 0x6;

/// Initial value of the per-block sample checksum.
pub const CRC_INITIAL: u32 = 0xFFFF_FFFF;

/// One step of the per-block sample checksum.
pub fn crc_update(crc: u32, sample: i32) -> u32 {
    crc.wrapping_mul(3).wrapping_add(sample as u32)
}

/// Fixed 32-byte header preceding every block's sub-block payload.
#[derive(Debug, Clone)]
pub struct BlockHeader {
    pub block_size: u32,
    pub version: u16,
    pub track_number: u8,
    pub index_number: u8,
    pub total_samples: u32,
    pub block_index: u32,
    pub block_samples: u32,
    pub bits_per_sample: u32,
    pub mono_output: bool,
    pub hybrid_mode: bool,
    pub joint_stereo: bool,
    pub cross_channel_decorrelation: bool,
    pub hybrid_noise_shaping: bool,
    pub floating_point_data: bool,
    pub extended_size_integers: bool,
    pub hybrid_parameters_control_bitrate: bool,
    pub hybrid_noise_balanced: bool,
    pub initial_block: bool,
    pub final_block: bool,
    pub left_shift: u32,
    pub maximum_data_magnitude: u32,
    pub sample_rate: u32,
    pub use_iir: bool,
    pub false_stereo: bool,
    pub crc: u32,
}

impl BlockHeader {
    /// Header for a PCM block. Size, magnitude and CRC are filled in by
    /// the assembler; `total_samples` stays 0 until the session
    /// back-patches it.
    pub fn new(
        sample_rate: u32,
        bits_per_sample: u32,
        block_index: u32,
        block_samples: u32,
        mono_output: bool,
        initial_block: bool,
        final_block: bool,
    ) -> BlockHeader {
        BlockHeader {
            block_size: 0,
            version: VERSION,
            track_number: 0,
            index_number: 0,
            total_samples: 0,
            block_index,
            block_samples,
            bits_per_sample,
            mono_output,
            hybrid_mode: false,
            joint_stereo: false,
            cross_channel_decorrelation: false,
            hybrid_noise_shaping: false,
            floating_point_data: false,
            extended_size_integers: false,
            hybrid_parameters_control_bitrate: false,
            hybrid_noise_balanced: false,
            initial_block,
            final_block,
            left_shift: 0,
            maximum_data_magnitude: 0,
            sample_rate,
            use_iir: false,
            false_stereo: false,
            crc: CRC_INITIAL,
        }
    }
}

/// Tunable encoding behavior, verified before a session starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodeOptions {
    /// PCM frames per block.
    pub block_size: u32,
    /// Decorrelation pass count; one of 0, 1, 2, 5, 10 or 16.
    pub decorrelation_passes: u32,
    /// Store mid/side instead of left/right for stereo pairs.
    pub joint_stereo: bool,
    /// Collapse stereo pairs with identical channels to mono.
    pub false_stereo: bool,
    /// Detect and strip shared low zero bits per block.
    pub wasted_bits: bool,
    /// Verbatim RIFF header to store instead of synthesizing one.
    #[serde(skip)]
    pub wave_header: Option<Vec<u8>>,
    /// Verbatim RIFF footer appended after the PCM data.
    #[serde(skip)]
    pub wave_footer: Option<Vec<u8>>,
}

impl Default for EncodeOptions {
    fn default() -> EncodeOptions {
        EncodeOptions {
            block_size: 22050,
            decorrelation_passes: 0,
            joint_stereo: false,
            false_stereo: true,
            wasted_bits: true,
            wave_header: None,
            wave_footer: None,
        }
    }
}

impl EncodeOptions {
    pub fn verify(&self) -> WvResult<()> {
        if self.block_size == 0 {
            return Err("block size must be positive".to_string());
        }
        if ![0, 1, 2, 5, 10, 16].contains(&self.decorrelation_passes) {
            return Err(format!(
                "invalid decorrelation pass count {} (expected 0, 1, 2, 5, 10 or 16)",
                self.decorrelation_passes
            ));
        }
        Ok(())
    }
}

/// Summary of a finished encoding session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodeStats {
    pub frames: u64,
    pub blocks: u32,
    pub pcm_bytes: u64,
    pub stream_bytes: u64,
    pub md5: [u8; 16],
}

// left-speaker bit index -> right partner bit index for the WAVE
// channel mask pairs that encode as one stereo block
const SPEAKER_PAIRS: [(u32, u32); 6] = [
    (0, 1),   // front left/right
    (4, 5),   // back left/right
    (6, 7),   // front left/right of center
    (9, 10),  // side left/right
    (12, 14), // top front left/right
    (15, 17), // top back left/right
];

/// Splits a frame's channels into per-block groups of 1 or 2 according
/// to the channel mask. Defined L/R speaker pairs become stereo blocks
/// when both bits are set; every other speaker, and any channel beyond
/// the mask's population count, becomes its own mono block.
pub fn channel_mask_splits(channel_count: usize, channel_mask: u32) -> Vec<usize> {
    let mut splits = Vec::new();
    let mut assigned = 0;
    let mut bit = 0;
    while bit < 32 && assigned < channel_count {
        if channel_mask & (1 << bit) == 0 {
            bit += 1;
            continue;
        }
        // the partner only pairs up when it is the next channel in
        // stream order, otherwise interleaving would be wrong
        let next_set = ((bit + 1)..32).find(|&b| channel_mask & (1 << b) != 0);
        let partner = SPEAKER_PAIRS
            .iter()
            .find(|&&(left, _)| left == bit)
            .map(|&(_, right)| right)
            .filter(|&right| next_set == Some(right));
        match partner {
            Some(right) if channel_count - assigned >= 2 => {
                splits.push(2);
                assigned += 2;
                bit = right + 1;
            }
            _ => {
                splits.push(1);
                assigned += 1;
                bit += 1;
            }
        }
    }
    while assigned < channel_count {
        splits.push(1);
        assigned += 1;
    }
    splits
}

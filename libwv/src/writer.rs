//! Container framing: block headers and sub-block emitters.
//!
//! Everything here writes through the [`BitWrite`] trait so the block
//! assembler can target a recorder while sizing a block and the real
//! stream when committing it.

use crate::core::{
    bit_length, bits_per_sample_code, sample_rate_code, BitWrite, BlockHeader, WvResult,
    FN_CHANNEL_INFO, FN_DECORR_SAMPLES, FN_DECORR_TERMS, FN_DECORR_WEIGHTS, FN_ENTROPY_VARIABLES,
    FN_INT32_INFO, FN_WAVE_HEADER, MAGIC,
};

// PCM sub-format GUID for WAVEFORMATEXTENSIBLE
const EXTENSIBLE_SUB_FORMAT: [u8; 16] = [
    0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xaa, 0x00, 0x38, 0x9b,
    0x71,
];

/// Writes the fixed 32-byte block header.
pub fn write_block_header<B: BitWrite>(bs: &mut B, header: &BlockHeader) -> WvResult<()> {
    bs.write_bits64(32, MAGIC as u64)?;
    bs.write_bits64(32, header.block_size as u64)?;
    bs.write_bits(16, header.version as u32)?;
    bs.write_bits(8, header.track_number as u32)?;
    bs.write_bits(8, header.index_number as u32)?;
    bs.write_bits64(32, header.total_samples as u64)?;
    bs.write_bits64(32, header.block_index as u64)?;
    bs.write_bits64(32, header.block_samples as u64)?;
    bs.write_bits(2, bits_per_sample_code(header.bits_per_sample))?;
    bs.write_bits(1, header.mono_output as u32)?;
    bs.write_bits(1, header.hybrid_mode as u32)?;
    bs.write_bits(1, header.joint_stereo as u32)?;
    bs.write_bits(1, header.cross_channel_decorrelation as u32)?;
    bs.write_bits(1, header.hybrid_noise_shaping as u32)?;
    bs.write_bits(1, header.floating_point_data as u32)?;
    bs.write_bits(1, header.extended_size_integers as u32)?;
    bs.write_bits(1, header.hybrid_parameters_control_bitrate as u32)?;
    bs.write_bits(1, header.hybrid_noise_balanced as u32)?;
    bs.write_bits(1, header.initial_block as u32)?;
    bs.write_bits(1, header.final_block as u32)?;
    bs.write_bits(5, header.left_shift)?;
    bs.write_bits(5, header.maximum_data_magnitude)?;
    bs.write_bits(4, sample_rate_code(header.sample_rate))?;
    bs.write_bits(2, 0)?;
    bs.write_bits(1, header.use_iir as u32)?;
    bs.write_bits(1, header.false_stereo as u32)?;
    bs.write_bits(1, 0)?;
    bs.write_bits64(32, header.crc as u64)
}

/// Writes a sub-block header. `byte_count` is the body size in bytes;
/// the odd-size bit marks a trailing pad byte the body must then carry.
pub fn write_subblock_header<B: BitWrite>(
    bs: &mut B,
    function: u32,
    nondecoder_data: bool,
    byte_count: u32,
) -> WvResult<()> {
    bs.write_bits(5, function)?;
    bs.write_bits(1, nondecoder_data as u32)?;
    bs.write_bits(1, byte_count % 2)?;

    let words = (byte_count / 2) + (byte_count % 2);
    if words > 0xFF {
        bs.write_bits(1, 1)?;
        bs.write_bits(24, words)
    } else {
        bs.write_bits(1, 0)?;
        bs.write_bits(8, words)
    }
}

/// Writes a verbatim body, padding odd sizes to the 16-bit boundary the
/// odd-size header bit accounts for.
pub fn write_verbatim_sub_block<B: BitWrite>(
    bs: &mut B,
    function: u32,
    nondecoder_data: bool,
    data: &[u8],
) -> WvResult<()> {
    write_subblock_header(bs, function, nondecoder_data, data.len() as u32)?;
    for &byte in data {
        bs.write_bits(8, byte as u32)?;
    }
    if data.len() % 2 == 1 {
        bs.write_bits(8, 0)?;
    }
    Ok(())
}

/// Decorrelation terms and deltas, most recently applied pass first.
pub fn write_decorr_terms<B: BitWrite>(bs: &mut B, terms: &[i32], deltas: &[i32]) -> WvResult<()> {
    write_subblock_header(bs, FN_DECORR_TERMS, false, terms.len() as u32)?;
    for i in (0..terms.len()).rev() {
        bs.write_bits(5, (terms[i] + 5) as u32)?;
        bs.write_bits(3, deltas[i] as u32)?;
    }
    if terms.len() % 2 == 1 {
        bs.write_bits(8, 0)?;
    }
    Ok(())
}

/// Quantized weights as signed bytes, channels interleaved per pass.
pub fn write_decorr_weights<B: BitWrite>(
    bs: &mut B,
    channel_count: usize,
    weight_codes_a: &[i32],
    weight_codes_b: &[i32],
) -> WvResult<()> {
    debug_assert!(channel_count == 1 || channel_count == 2);
    let byte_count = weight_codes_a.len() + if channel_count > 1 { weight_codes_b.len() } else { 0 };

    write_subblock_header(bs, FN_DECORR_WEIGHTS, false, byte_count as u32)?;
    for i in (0..weight_codes_a.len()).rev() {
        bs.write_signed_bits(8, weight_codes_a[i])?;
        if channel_count > 1 {
            bs.write_signed_bits(8, weight_codes_b[i])?;
        }
    }
    if byte_count % 2 == 1 {
        bs.write_bits(8, 0)?;
    }
    Ok(())
}

/// Seed histories as 16-bit pseudo-log codes. Extrapolating terms store
/// newest-first, lag terms oldest-first, cross-channel terms store the
/// opposite channel's seed first.
pub fn write_decorr_samples<B: BitWrite>(
    bs: &mut B,
    channel_count: usize,
    terms: &[i32],
    sample_codes_a: &[Vec<i32>],
    sample_codes_b: &[Vec<i32>],
) -> WvResult<()> {
    debug_assert!(channel_count == 1 || channel_count == 2);

    let mut byte_count = 0u32;
    for &term in terms.iter() {
        byte_count += match term {
            17 | 18 => 4 * channel_count as u32,
            1..=8 => 2 * term as u32 * channel_count as u32,
            -3..=-1 => 4,
            other => panic!("unsupported decorrelation term {}", other),
        };
    }
    write_subblock_header(bs, FN_DECORR_SAMPLES, false, byte_count)?;

    for i in (0..terms.len()).rev() {
        let codes_a = &sample_codes_a[i];
        match terms[i] {
            17 | 18 => {
                bs.write_signed_bits(16, codes_a[1])?;
                bs.write_signed_bits(16, codes_a[0])?;
                if channel_count > 1 {
                    let codes_b = &sample_codes_b[i];
                    bs.write_signed_bits(16, codes_b[1])?;
                    bs.write_signed_bits(16, codes_b[0])?;
                }
            }
            term @ 1..=8 => {
                for k in 0..term as usize {
                    bs.write_signed_bits(16, codes_a[k])?;
                    if channel_count > 1 {
                        bs.write_signed_bits(16, sample_codes_b[i][k])?;
                    }
                }
            }
            -3..=-1 => {
                bs.write_signed_bits(16, sample_codes_b[i][0])?;
                bs.write_signed_bits(16, codes_a[0])?;
            }
            other => panic!("unsupported decorrelation term {}", other),
        }
    }
    Ok(())
}

/// Entropy medians as 16-bit pseudo-log codes, channel A then B.
pub fn write_entropy_variables<B: BitWrite>(
    bs: &mut B,
    median_codes: &[[i32; 3]; 2],
    channel_count: usize,
) -> WvResult<()> {
    debug_assert!(channel_count == 1 || channel_count == 2);

    write_subblock_header(bs, FN_ENTROPY_VARIABLES, false, 6 * channel_count as u32)?;
    for code in median_codes[0].iter() {
        bs.write_signed_bits(16, *code)?;
    }
    if channel_count > 1 {
        for code in median_codes[1].iter() {
            bs.write_signed_bits(16, *code)?;
        }
    }
    Ok(())
}

/// Extended integer info; only the wasted-zero-bits field is used.
pub fn write_int32_info<B: BitWrite>(
    bs: &mut B,
    sent_bits: u8,
    zeroes: u8,
    ones: u8,
    dupes: u8,
) -> WvResult<()> {
    write_subblock_header(bs, FN_INT32_INFO, false, 4)?;
    bs.write_bits(8, sent_bits as u32)?;
    bs.write_bits(8, zeroes as u32)?;
    bs.write_bits(8, ones as u32)?;
    bs.write_bits(8, dupes as u32)
}

/// Channel count and mask, written once for streams above two channels.
pub fn write_channel_info<B: BitWrite>(
    bs: &mut B,
    channel_count: usize,
    channel_mask: u32,
) -> WvResult<()> {
    let mask_bits = bit_length(channel_mask);
    let body_bits = 8 + mask_bits;
    // byte-align, then pad to a 16-bit boundary
    let body_bytes = (body_bits.div_ceil(8) + 1) / 2 * 2;

    write_subblock_header(bs, FN_CHANNEL_INFO, false, body_bytes)?;
    bs.write_bits(8, channel_count as u32)?;
    bs.write_bits(mask_bits, channel_mask)?;
    bs.write_bits(body_bytes * 8 - body_bits, 0)?;
    Ok(())
}

/// Synthesized RIFF/WAVE header sub-block: the classic 16-byte fmt chunk
/// when channels <= 2 and bps <= 16, else WAVEFORMATEXTENSIBLE, followed
/// by a `data` chunk header. Written with `pcm_bytes` 0 up front and
/// back-patched once the real count is known.
pub fn write_wave_header<B: BitWrite>(
    bs: &mut B,
    channel_count: usize,
    channel_mask: u32,
    sample_rate: u32,
    bits_per_sample: u32,
    pcm_bytes: u32,
) -> WvResult<()> {
    let classic = channel_count <= 2 && bits_per_sample <= 16;
    let fmt_size: u32 = if classic { 16 } else { 40 };
    let body_bytes = 4 + 8 + fmt_size + 8;
    let byte_rate = (sample_rate * channel_count as u32 * bits_per_sample) / 8;
    let block_align = (channel_count as u32 * bits_per_sample) / 8;

    write_subblock_header(bs, FN_WAVE_HEADER, true, body_bytes + 8)?;

    bs.write_bits64(32, 0x4646_4952)?; // "RIFF"
    bs.write_bits64(32, (4 + 8 + fmt_size + 8 + pcm_bytes) as u64)?;
    bs.write_bits64(32, 0x4556_4157)?; // "WAVE"
    bs.write_bits64(32, 0x2074_6D66)?; // "fmt "
    bs.write_bits64(32, fmt_size as u64)?;
    bs.write_bits(16, if classic { 1 } else { 0xFFFE })?;
    bs.write_bits(16, channel_count as u32)?;
    bs.write_bits64(32, sample_rate as u64)?;
    bs.write_bits64(32, byte_rate as u64)?;
    bs.write_bits(16, block_align)?;
    bs.write_bits(16, bits_per_sample)?;
    if !classic {
        bs.write_bits(16, 22)?;
        bs.write_bits(16, bits_per_sample)?;
        bs.write_bits64(32, channel_mask as u64)?;
        for &byte in EXTENSIBLE_SUB_FORMAT.iter() {
            bs.write_bits(8, byte as u32)?;
        }
    }
    bs.write_bits64(32, 0x6174_6164)?; // "data"
    bs.write_bits64(32, pcm_bytes as u64)
}

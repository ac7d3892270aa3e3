//! Reference decoder used by the integration tests.
//!
//! Decodes a block stream back to PCM straight from the container
//! layout, independently of the encoder's internal state handling, so
//! the tests catch any drift between what the encoder believes it wrote
//! and what a decoder can actually reconstruct.

#![allow(dead_code)]

use libwv_audio::core::{restore_weight, wv_exp2};

const MAGIC: u32 = 0x6B70_7677;
const UNARY_LIMIT: u32 = 16;

const FN_WAVE_HEADER: u32 = 0x1;
const FN_DECORR_TERMS: u32 = 0x2;
const FN_DECORR_WEIGHTS: u32 = 0x3;
const FN_DECORR_SAMPLES: u32 = 0x4;
const FN_ENTROPY_VARIABLES: u32 = 0x5;
const FN_INT32_INFO: u32 = 0x9;
const FN_BITSTREAM: u32 = 0xA;
const FN_CHANNEL_INFO: u32 = 0xD;
const FN_WAVE_FOOTER: u32 = 0x2;
const FN_MD5: u32 = 0x6;

/// Little-endian bit reader over a byte slice.
pub struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> BitReader<'a> {
        BitReader { data, bit: 0 }
    }

    pub fn byte_position(&self) -> usize {
        assert!(self.bit % 8 == 0, "unaligned byte position");
        self.bit / 8
    }

    pub fn seek_byte(&mut self, byte: usize) {
        self.bit = byte * 8;
    }

    pub fn read_bit(&mut self) -> u32 {
        let value = (self.data[self.bit / 8] >> (self.bit % 8)) & 1;
        self.bit += 1;
        value as u32
    }

    pub fn read_bits(&mut self, count: u32) -> u32 {
        let mut value = 0u32;
        for i in 0..count {
            value |= self.read_bit() << i;
        }
        value
    }

    pub fn read_signed_bits(&mut self, count: u32) -> i32 {
        let value = self.read_bits(count);
        if count < 32 && value & (1 << (count - 1)) != 0 {
            value as i32 - (1i64 << count) as i32
        } else {
            value as i32
        }
    }

    /// Counts one bits up to a zero stop bit.
    pub fn read_unary(&mut self) -> u32 {
        let mut count = 0;
        while self.read_bit() == 1 {
            count += 1;
        }
        count
    }
}

fn get_median(medians: &[i32; 3], i: usize) -> i32 {
    (medians[i] >> 4) + 1
}

fn inc_median(medians: &mut [i32; 3], i: usize) {
    medians[i] += ((medians[i] + (128 >> i)) / (128 >> i)) * 5;
}

fn dec_median(medians: &mut [i32; 3], i: usize) {
    medians[i] -= ((medians[i] + (128 >> i) - 2) / (128 >> i)) * 2;
}

fn apply_weight(weight: i32, sample: i64) -> i32 {
    ((weight as i64 * sample + 512) >> 10) as i32
}

fn update_weight(source: i64, result: i32, delta: i32) -> i32 {
    if source == 0 || result == 0 {
        0
    } else if (source ^ result as i64) >= 0 {
        delta
    } else {
        -delta
    }
}

fn clamp_weight(weight: i32) -> i32 {
    weight.clamp(-1024, 1024)
}

/// Header fields the tests inspect.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub block_size: u32,
    pub version: u32,
    pub total_samples: u32,
    pub block_index: u32,
    pub block_samples: u32,
    pub bits_per_sample: u32,
    pub mono_output: bool,
    pub joint_stereo: bool,
    pub cross_channel_decorrelation: bool,
    pub extended_size_integers: bool,
    pub initial_block: bool,
    pub final_block: bool,
    pub maximum_data_magnitude: u32,
    pub sample_rate_code: u32,
    pub false_stereo: bool,
    pub crc: u32,
}

/// One decoded block: header plus reconstructed channels (a false
/// stereo block comes back as two identical channels).
pub struct DecodedBlock {
    pub info: BlockInfo,
    pub channels: Vec<Vec<i32>>,
    pub wasted_bits: u32,
    pub md5: Option<[u8; 16]>,
    pub wave_header: Option<Vec<u8>>,
    pub wave_footer: Option<Vec<u8>>,
    pub channel_info: Option<(usize, u32)>,
    pub terms: Vec<i32>,
}

/// A fully reassembled stream.
pub struct DecodedStream {
    pub channels: Vec<Vec<i32>>,
    pub bits_per_sample: u32,
    pub sample_rate_code: u32,
    pub total_samples: u32,
    pub block_count: usize,
    pub md5: Option<[u8; 16]>,
    pub wave_header: Option<Vec<u8>>,
    pub wave_footer: Option<Vec<u8>>,
    pub channel_info: Option<(usize, u32)>,
}

fn parse_header(reader: &mut BitReader) -> BlockInfo {
    let magic = reader.read_bits(32);
    assert_eq!(magic, MAGIC, "bad block magic");
    let block_size = reader.read_bits(32);
    let version = reader.read_bits(16);
    let _track = reader.read_bits(8);
    let _index = reader.read_bits(8);
    let total_samples = reader.read_bits(32);
    let block_index = reader.read_bits(32);
    let block_samples = reader.read_bits(32);

    let bits_per_sample = match reader.read_bits(2) {
        0 => 8,
        1 => 16,
        2 => 24,
        _ => 32,
    };
    let mono_output = reader.read_bit() == 1;
    let _hybrid = reader.read_bit();
    let joint_stereo = reader.read_bit() == 1;
    let cross_channel_decorrelation = reader.read_bit() == 1;
    let _noise_shaping = reader.read_bit();
    let _float = reader.read_bit();
    let extended_size_integers = reader.read_bit() == 1;
    let _ctrl_bitrate = reader.read_bit();
    let _balanced = reader.read_bit();
    let initial_block = reader.read_bit() == 1;
    let final_block = reader.read_bit() == 1;
    let _left_shift = reader.read_bits(5);
    let maximum_data_magnitude = reader.read_bits(5);
    let sample_rate_code = reader.read_bits(4);
    let _reserved = reader.read_bits(2);
    let _iir = reader.read_bit();
    let false_stereo = reader.read_bit() == 1;
    let _reserved = reader.read_bit();
    let crc = reader.read_bits(32);

    BlockInfo {
        block_size,
        version,
        total_samples,
        block_index,
        block_samples,
        bits_per_sample,
        mono_output,
        joint_stereo,
        cross_channel_decorrelation,
        extended_size_integers,
        initial_block,
        final_block,
        maximum_data_magnitude,
        sample_rate_code,
        false_stereo,
        crc,
    }
}

struct ResidualDecoder {
    holding_zero: bool,
    holding_one: bool,
    zeros_remaining: u32,
}

impl ResidualDecoder {
    fn new() -> ResidualDecoder {
        ResidualDecoder {
            holding_zero: false,
            holding_one: false,
            zeros_remaining: 0,
        }
    }

    fn read_escape_count(reader: &mut BitReader) -> u32 {
        let t = reader.read_unary();
        if t <= 1 {
            t
        } else {
            (1 << (t - 1)) | reader.read_bits(t - 1)
        }
    }

    fn next(&mut self, reader: &mut BitReader, medians: &mut [[i32; 3]; 2], channel: usize) -> i32 {
        if medians[0][0] < 2 && medians[1][0] < 2 && !self.holding_zero && !self.holding_one {
            if self.zeros_remaining > 0 {
                self.zeros_remaining -= 1;
                if self.zeros_remaining > 0 {
                    return 0;
                }
                // the run is spent; this call decodes a normal symbol
            } else {
                let count = Self::read_escape_count(reader);
                if count > 0 {
                    medians[0] = [0; 3];
                    medians[1] = [0; 3];
                    self.zeros_remaining = count;
                    return 0;
                }
                // an empty count precedes a normal symbol
            }
        }

        let m;
        if self.holding_zero {
            m = 0;
            self.holding_zero = false;
        } else {
            let mut t = reader.read_unary();
            if t == UNARY_LIMIT {
                t += Self::read_escape_count(reader);
            }
            if self.holding_one {
                self.holding_one = t & 1 == 1;
                m = (t >> 1) + 1;
            } else {
                self.holding_one = t & 1 == 1;
                m = t >> 1;
            }
            self.holding_zero = !self.holding_one;
        }

        let bands = &mut medians[channel];
        let low;
        let high;
        match m {
            0 => {
                low = 0;
                high = get_median(bands, 0) - 1;
                dec_median(bands, 0);
            }
            1 => {
                low = get_median(bands, 0);
                high = low.wrapping_add(get_median(bands, 1)).wrapping_sub(1);
                inc_median(bands, 0);
                dec_median(bands, 1);
            }
            2 => {
                low = get_median(bands, 0) + get_median(bands, 1);
                high = low.wrapping_add(get_median(bands, 2)).wrapping_sub(1);
                inc_median(bands, 0);
                inc_median(bands, 1);
                dec_median(bands, 2);
            }
            _ => {
                low = get_median(bands, 0)
                    + get_median(bands, 1)
                    + (m as i32 - 2) * get_median(bands, 2);
                high = low.wrapping_add(get_median(bands, 2)).wrapping_sub(1);
                inc_median(bands, 0);
                inc_median(bands, 1);
                inc_median(bands, 2);
            }
        }

        let code = if high != low {
            let max_code = high.wrapping_sub(low) as u32;
            let bit_count = 32 - max_code.leading_zeros();
            let extras = (1u32 << bit_count) - max_code - 1;
            let p = reader.read_bits(bit_count - 1);
            if p >= extras {
                (p << 1) + reader.read_bit() - extras
            } else {
                p
            }
        } else {
            0
        };

        let value = low + code as i32;
        if reader.read_bit() == 1 {
            !value
        } else {
            value
        }
    }
}

/// Undoes one decorrelation pass, given the pass's seed history.
#[allow(clippy::too_many_arguments)]
fn undo_pass(
    term: i32,
    delta: i32,
    channel_a: &mut Vec<i32>,
    channel_b: &mut Vec<i32>,
    mut weight_a: i32,
    mut weight_b: i32,
    seeds_a: &[i32],
    seeds_b: &[i32],
    channel_count: usize,
) {
    if term > 0 {
        for (channel, seeds, weight) in [
            (&mut *channel_a, seeds_a, &mut weight_a),
            (&mut *channel_b, seeds_b, &mut weight_b),
        ]
        .into_iter()
        .take(channel_count)
        {
            let mut history: Vec<i32> = seeds.to_vec();
            let offset = history.len();
            for i in 0..channel.len() {
                let j = offset + i;
                let temp: i64 = match term {
                    18 => (3 * history[j - 1] as i64 - history[j - 2] as i64) >> 1,
                    17 => 2 * history[j - 1] as i64 - history[j - 2] as i64,
                    t @ 1..=8 => history[j - t as usize] as i64,
                    other => panic!("unsupported term {}", other),
                };
                let residual = channel[i];
                let restored = residual.wrapping_add(apply_weight(*weight, temp));
                history.push(restored);
                channel[i] = restored;
                *weight = clamp_weight(*weight + update_weight(temp, residual, delta));
            }
        }
        return;
    }

    assert_eq!(channel_count, 2, "cross-channel term in a mono block");
    let mut prev_a = seeds_a[0];
    let mut prev_b = seeds_b[0];
    for i in 0..channel_a.len() {
        match term {
            -1 => {
                let temp_a = prev_b as i64;
                let residual_a = channel_a[i];
                channel_a[i] = residual_a.wrapping_add(apply_weight(weight_a, temp_a));
                weight_a = clamp_weight(weight_a + update_weight(temp_a, residual_a, delta));

                let temp_b = channel_a[i] as i64;
                let residual_b = channel_b[i];
                channel_b[i] = residual_b.wrapping_add(apply_weight(weight_b, temp_b));
                weight_b = clamp_weight(weight_b + update_weight(temp_b, residual_b, delta));
            }
            -2 => {
                let temp_b = prev_a as i64;
                let residual_b = channel_b[i];
                channel_b[i] = residual_b.wrapping_add(apply_weight(weight_b, temp_b));
                weight_b = clamp_weight(weight_b + update_weight(temp_b, residual_b, delta));

                let temp_a = channel_b[i] as i64;
                let residual_a = channel_a[i];
                channel_a[i] = residual_a.wrapping_add(apply_weight(weight_a, temp_a));
                weight_a = clamp_weight(weight_a + update_weight(temp_a, residual_a, delta));
            }
            -3 => {
                let temp_a = prev_b as i64;
                let residual_a = channel_a[i];
                channel_a[i] = residual_a.wrapping_add(apply_weight(weight_a, temp_a));
                weight_a = clamp_weight(weight_a + update_weight(temp_a, residual_a, delta));

                let temp_b = prev_a as i64;
                let residual_b = channel_b[i];
                channel_b[i] = residual_b.wrapping_add(apply_weight(weight_b, temp_b));
                weight_b = clamp_weight(weight_b + update_weight(temp_b, residual_b, delta));
            }
            other => panic!("unsupported term {}", other),
        }
        prev_a = channel_a[i];
        prev_b = channel_b[i];
    }
}

/// Decodes `count` residuals from a raw bitstream, interleaving
/// channels the way the encoder does.
pub fn decode_residuals(
    data: &[u8],
    count: usize,
    medians: &mut [[i32; 3]; 2],
    channel_count: usize,
) -> Vec<i32> {
    let mut reader = BitReader::new(data);
    let mut decoder = ResidualDecoder::new();
    (0..count)
        .map(|sample| decoder.next(&mut reader, medians, sample % channel_count))
        .collect()
}

/// Decodes the block starting at `offset`; returns the block and the
/// offset of the next one.
pub fn decode_block(data: &[u8], offset: usize) -> (DecodedBlock, usize) {
    let mut reader = BitReader::new(data);
    reader.seek_byte(offset);
    let info = parse_header(&mut reader);
    let next_offset = offset + info.block_size as usize + 8;
    let sub_blocks_end = next_offset;

    let effective_channels = if info.mono_output || info.false_stereo {
        1
    } else {
        2
    };

    let mut terms: Vec<i32> = Vec::new();
    let mut deltas: Vec<i32> = Vec::new();
    let mut weights = [Vec::new(), Vec::new()];
    let mut seeds: [Vec<Vec<i32>>; 2] = [Vec::new(), Vec::new()];
    let mut medians = [[0i32; 3]; 2];
    let mut wasted_bits = 0u32;
    let mut residual_range: Option<(usize, usize)> = None;
    let mut md5 = None;
    let mut wave_header = None;
    let mut wave_footer = None;
    let mut channel_info = None;

    while reader.byte_position() < sub_blocks_end {
        let function = reader.read_bits(5);
        let nondecoder = reader.read_bit() == 1;
        let odd = reader.read_bit();
        let large = reader.read_bit() == 1;
        let words = if large {
            reader.read_bits(24)
        } else {
            reader.read_bits(8)
        };
        let body_start = reader.byte_position();
        let byte_count = (words * 2 - odd) as usize;
        let body_end = body_start + byte_count;

        match (function, nondecoder) {
            (FN_DECORR_TERMS, false) => {
                for _ in 0..byte_count {
                    let byte = reader.read_bits(8);
                    terms.push((byte & 0x1F) as i32 - 5);
                    deltas.push((byte >> 5) as i32);
                }
                // stored most recently applied first
                terms.reverse();
                deltas.reverse();
            }
            (FN_DECORR_WEIGHTS, false) => {
                let per_channel = byte_count / effective_channels;
                weights[0] = vec![0; per_channel];
                weights[1] = vec![0; per_channel];
                for i in (0..per_channel).rev() {
                    for channel in 0..effective_channels {
                        weights[channel][i] = restore_weight(reader.read_signed_bits(8));
                    }
                }
            }
            (FN_DECORR_SAMPLES, false) => {
                seeds[0] = vec![Vec::new(); terms.len()];
                seeds[1] = vec![Vec::new(); terms.len()];
                for i in (0..terms.len()).rev() {
                    match terms[i] {
                        17 | 18 => {
                            for channel in 0..effective_channels {
                                let newest = wv_exp2(reader.read_signed_bits(16));
                                let oldest = wv_exp2(reader.read_signed_bits(16));
                                seeds[channel][i] = vec![oldest, newest];
                            }
                        }
                        t @ 1..=8 => {
                            for channel in 0..effective_channels {
                                seeds[channel][i] = vec![0; t as usize];
                            }
                            for k in 0..t as usize {
                                for channel in 0..effective_channels {
                                    seeds[channel][i][k] = wv_exp2(reader.read_signed_bits(16));
                                }
                            }
                        }
                        -3..=-1 => {
                            seeds[1][i] = vec![wv_exp2(reader.read_signed_bits(16))];
                            seeds[0][i] = vec![wv_exp2(reader.read_signed_bits(16))];
                        }
                        other => panic!("unsupported term {}", other),
                    }
                }
            }
            (FN_ENTROPY_VARIABLES, false) => {
                for channel in 0..effective_channels {
                    for k in 0..3 {
                        medians[channel][k] = wv_exp2(reader.read_signed_bits(16));
                    }
                }
            }
            (FN_INT32_INFO, false) => {
                let _sent = reader.read_bits(8);
                wasted_bits = reader.read_bits(8);
                let _ones = reader.read_bits(8);
                let _dupes = reader.read_bits(8);
            }
            (FN_BITSTREAM, false) => {
                residual_range = Some((body_start, body_end));
            }
            (FN_CHANNEL_INFO, false) => {
                let count = reader.read_bits(8) as usize;
                let mask_bits = (byte_count as u32 * 8).saturating_sub(8);
                let mask = reader.read_bits(mask_bits.min(32));
                channel_info = Some((count, mask));
            }
            (FN_MD5, true) => {
                let mut digest = [0u8; 16];
                for byte in digest.iter_mut() {
                    *byte = reader.read_bits(8) as u8;
                }
                md5 = Some(digest);
            }
            (FN_WAVE_HEADER, true) => {
                let mut body = Vec::with_capacity(byte_count);
                for _ in 0..byte_count {
                    body.push(reader.read_bits(8) as u8);
                }
                wave_header = Some(body);
            }
            (FN_WAVE_FOOTER, true) => {
                let mut body = Vec::with_capacity(byte_count);
                for _ in 0..byte_count {
                    body.push(reader.read_bits(8) as u8);
                }
                wave_footer = Some(body);
            }
            _ => {}
        }
        reader.seek_byte(body_start + (words * 2) as usize);
    }

    let mut channel_a: Vec<i32> = Vec::new();
    let mut channel_b: Vec<i32> = Vec::new();

    if info.block_samples > 0 {
        let (start, end) = residual_range.expect("PCM block without a bitstream sub-block");
        let mut residuals = BitReader::new(&data[start..end]);
        let mut decoder = ResidualDecoder::new();
        let total = info.block_samples as usize * effective_channels;
        for sample in 0..total {
            let channel = sample % effective_channels;
            let value = decoder.next(&mut residuals, &mut medians, channel);
            if channel == 0 {
                channel_a.push(value);
            } else {
                channel_b.push(value);
            }
        }

        // passes undo in the opposite order they were applied
        for i in 0..terms.len() {
            undo_pass(
                terms[i],
                deltas[i],
                &mut channel_a,
                &mut channel_b,
                weights[0].get(i).copied().unwrap_or(0),
                weights[1].get(i).copied().unwrap_or(0),
                &seeds[0][i],
                &seeds[1][i],
                effective_channels,
            );
        }

        if info.joint_stereo {
            for (mid, side) in channel_a.iter_mut().zip(channel_b.iter_mut()) {
                let a = side.wrapping_add((*mid).wrapping_add(*mid & 1) >> 1);
                let b = a.wrapping_sub(*mid);
                *mid = a;
                *side = b;
            }
        }

        let mut crc = 0xFFFF_FFFFu32;
        if effective_channels == 1 {
            for &sample in channel_a.iter() {
                crc = crc.wrapping_mul(3).wrapping_add(sample as u32);
            }
        } else {
            for (&a, &b) in channel_a.iter().zip(channel_b.iter()) {
                crc = crc.wrapping_mul(3).wrapping_add(a as u32);
                crc = crc.wrapping_mul(3).wrapping_add(b as u32);
            }
        }
        assert_eq!(crc, info.crc, "block checksum mismatch");

        if wasted_bits > 0 {
            for sample in channel_a.iter_mut() {
                *sample <<= wasted_bits;
            }
            for sample in channel_b.iter_mut() {
                *sample <<= wasted_bits;
            }
        }

        if info.false_stereo {
            channel_b = channel_a.clone();
        }
    }

    let channels = if info.block_samples == 0 {
        Vec::new()
    } else if info.mono_output {
        vec![channel_a]
    } else {
        vec![channel_a, channel_b]
    };

    (
        DecodedBlock {
            info,
            channels,
            wasted_bits,
            md5,
            wave_header,
            wave_footer,
            channel_info,
            terms,
        },
        next_offset,
    )
}

/// Decodes a whole stream, reassembling multichannel frames in mask
/// order.
pub fn decode_stream(data: &[u8]) -> DecodedStream {
    let mut offset = 0;
    let mut channels: Vec<Vec<i32>> = Vec::new();
    let mut frame: Vec<Vec<i32>> = Vec::new();
    let mut block_count = 0;
    let mut bits_per_sample = 0;
    let mut sample_rate_code = 0;
    let mut total_samples = 0;
    let mut md5 = None;
    let mut wave_header = None;
    let mut wave_footer = None;
    let mut channel_info = None;

    while offset < data.len() {
        let (block, next_offset) = decode_block(data, offset);
        block_count += 1;
        offset = next_offset;

        bits_per_sample = block.info.bits_per_sample;
        sample_rate_code = block.info.sample_rate_code;
        total_samples = block.info.total_samples;
        md5 = md5.or(block.md5);
        wave_header = wave_header.or(block.wave_header);
        wave_footer = wave_footer.or(block.wave_footer);
        channel_info = channel_info.or(block.channel_info);

        if block.info.block_samples == 0 {
            continue;
        }

        if block.info.initial_block {
            frame.clear();
        }
        frame.extend(block.channels);

        if block.info.final_block {
            if channels.is_empty() {
                channels = vec![Vec::new(); frame.len()];
            }
            assert_eq!(frame.len(), channels.len(), "frame channel count changed");
            for (stream, decoded) in channels.iter_mut().zip(frame.drain(..)) {
                stream.extend(decoded);
            }
        }
    }

    DecodedStream {
        channels,
        bits_per_sample,
        sample_rate_code,
        total_samples,
        block_count,
        md5,
        wave_header,
        wave_footer,
        channel_info,
    }
}

/// Interleaves planar channels for MD5-style comparisons.
pub fn interleave(channels: &[Vec<i32>]) -> Vec<i32> {
    let frames = channels.first().map_or(0, |channel| channel.len());
    let mut output = Vec::with_capacity(frames * channels.len());
    for i in 0..frames {
        for channel in channels {
            output.push(channel[i]);
        }
    }
    output
}

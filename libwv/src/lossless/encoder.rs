//! Block assembly and the streaming encode session.
//!
//! A frame of PCM is split into blocks of one or two channels by the
//! channel mask, and every block gets the same treatment: false-stereo
//! collapse, wasted-bit removal, joint stereo, decorrelation, residual
//! coding, then a header and sub-blocks. The session carries per-slot
//! decorrelation state between blocks and back-patches the stream-wide
//! fields once the input ends.

use std::cell::Cell;
use std::io::{Cursor, Seek, SeekFrom, Write};
use std::rc::Rc;

use log::{debug, trace};

use crate::core::{
    channel_mask_splits, crc_update, restore_weight, store_weight, wv_exp2, wv_log2,
    BitRecorder, BitWrite, BitWriter, BlockHeader, EncodeOptions, EncodeStats, Endianness,
    WvResult, FN_BITSTREAM, FN_MD5, FN_WAVE_FOOTER, FN_WAVE_HEADER, HEADER_SIZE,
};
use crate::core::bit_length;
use crate::lossless::decorrelate::{wrap_samples, Decorrelator, SlotState};
use crate::lossless::entropy;
use crate::pcm::{InterleavedSource, PcmSource};
use crate::writer;

/// Working decorrelation and entropy state for one block. Sub-blocks
/// store the quantized codes while the passes run on the restored
/// values, so a decoder rebuilding state from the codes lands on
/// exactly the values the encoder used.
struct Tunables {
    terms: Vec<i32>,
    deltas: Vec<i32>,
    weights_a: Vec<i32>,
    weights_b: Vec<i32>,
    weight_codes_a: Vec<i32>,
    weight_codes_b: Vec<i32>,
    samples_a: Vec<Vec<i32>>,
    samples_b: Vec<Vec<i32>>,
    sample_codes_a: Vec<Vec<i32>>,
    sample_codes_b: Vec<Vec<i32>>,
    medians: [[i32; 3]; 2],
    median_codes: [[i32; 3]; 2],
}

fn quantize_weights(weights: &[i32]) -> (Vec<i32>, Vec<i32>) {
    let codes: Vec<i32> = weights.iter().map(|&w| store_weight(w)).collect();
    let restored = codes.iter().map(|&c| restore_weight(c)).collect();
    (codes, restored)
}

fn quantize_samples(samples: &[Vec<i32>]) -> (Vec<Vec<i32>>, Vec<Vec<i32>>) {
    let codes: Vec<Vec<i32>> = samples
        .iter()
        .map(|seeds| seeds.iter().map(|&s| wv_log2(s)).collect())
        .collect();
    let restored = codes
        .iter()
        .map(|seeds: &Vec<i32>| seeds.iter().map(|&c| wv_exp2(c)).collect())
        .collect();
    (codes, restored)
}

fn quantize_medians(medians: &[i32; 3]) -> ([i32; 3], [i32; 3]) {
    let codes = [wv_log2(medians[0]), wv_log2(medians[1]), wv_log2(medians[2])];
    let restored = [wv_exp2(codes[0]), wv_exp2(codes[1]), wv_exp2(codes[2])];
    (codes, restored)
}

impl Tunables {
    // Cached slot state is reused when it matches the block's shape,
    // otherwise the default topology starts over.
    fn resolve(slot: &SlotState, configured_passes: usize, channel_count: usize) -> Tunables {
        debug_assert!(channel_count == 1 || channel_count == 2);

        // mono blocks never carry the cross-channel topologies
        let passes = if channel_count == 1 {
            configured_passes.min(5)
        } else {
            configured_passes
        };

        let fresh;
        let state = if passes > 0
            && slot.terms.len() == passes
            && slot.channel_count == channel_count
        {
            slot
        } else {
            fresh = SlotState::default_topology(passes, channel_count);
            &fresh
        };

        let (weight_codes_a, weights_a) = quantize_weights(&state.weights_a);
        let (sample_codes_a, samples_a) = quantize_samples(&state.samples_a);
        let (median_codes_a, medians_a) = quantize_medians(&state.medians_a);

        let (weight_codes_b, weights_b, sample_codes_b, samples_b, median_codes_b, medians_b) =
            if channel_count == 2 {
                let (wc, w) = quantize_weights(&state.weights_b);
                let (sc, s) = quantize_samples(&state.samples_b);
                let (mc, m) = quantize_medians(&state.medians_b);
                (wc, w, sc, s, mc, m)
            } else {
                // padded so mono passes can still borrow per-pass slots
                (
                    vec![0; passes],
                    vec![0; passes],
                    vec![Vec::new(); passes],
                    vec![Vec::new(); passes],
                    [0; 3],
                    [0; 3],
                )
            };

        Tunables {
            terms: state.terms.clone(),
            deltas: state.deltas.clone(),
            weights_a,
            weights_b,
            weight_codes_a,
            weight_codes_b,
            samples_a,
            samples_b,
            sample_codes_a,
            sample_codes_b,
            medians: [medians_a, medians_b],
            median_codes: [median_codes_a, median_codes_b],
        }
    }

    fn store(self, channel_count: usize) -> SlotState {
        SlotState {
            channel_count,
            terms: self.terms,
            deltas: self.deltas,
            weights_a: self.weights_a,
            weights_b: self.weights_b,
            samples_a: self.samples_a,
            samples_b: self.samples_b,
            medians_a: self.medians[0],
            medians_b: self.medians[1],
        }
    }
}

/// Shared low zero bits across a channel's samples, `None` when every
/// sample is zero.
fn max_wasted_bits(samples: &[i32]) -> Option<u32> {
    let mut wasted: Option<u32> = None;
    for &sample in samples {
        if sample != 0 {
            let bits = sample.trailing_zeros();
            wasted = Some(wasted.map_or(bits, |w| w.min(bits)));
            if wasted == Some(0) {
                return wasted;
            }
        }
    }
    wasted
}

// Packs a frame the way a WAVE data chunk stores it, for the MD5 and
// byte-count bookkeeping.
fn frame_to_pcm_bytes(frame: &[Vec<i32>], bits_per_sample: u32) -> Vec<u8> {
    let frames = frame.first().map_or(0, |channel| channel.len());
    let mut bytes = Vec::with_capacity(frames * frame.len() * (bits_per_sample as usize / 8));
    for i in 0..frames {
        for channel in frame {
            let sample = channel[i];
            match bits_per_sample {
                8 => bytes.push((sample + 128) as u8),
                16 => bytes.extend_from_slice(&(sample as i16).to_le_bytes()),
                24 => bytes.extend_from_slice(&sample.to_le_bytes()[..3]),
                32 => bytes.extend_from_slice(&sample.to_le_bytes()),
                other => panic!("unsupported bit depth {}", other),
            }
        }
    }
    bytes
}

struct Session<W: Write + Seek> {
    bs: BitWriter<W>,
    byte_count: Rc<Cell<u64>>,
    options: EncodeOptions,
    sample_rate: u32,
    bits_per_sample: u32,
    channel_count: usize,
    channel_mask: u32,
    splits: Vec<usize>,
    block_index: u32,
    block_offsets: Vec<u64>,
    slots: Vec<SlotState>,
    decorrelator: Decorrelator,
    sub_blocks: BitRecorder,
    residual_data: BitRecorder,
    md5: md5::Context,
    pcm_bytes: u64,
    blocks_written: u32,
    wave_header_written: bool,
    wave_header_offset: u64,
    channel_info_written: bool,
}

impl<W: Write + Seek> Session<W> {
    fn new(
        sink: W,
        sample_rate: u32,
        channel_count: usize,
        bits_per_sample: u32,
        channel_mask: u32,
        options: EncodeOptions,
    ) -> Session<W> {
        let byte_count = Rc::new(Cell::new(0u64));
        let mut bs = BitWriter::new(sink, Endianness::Little);
        let counter = byte_count.clone();
        bs.add_observer(Box::new(move |_| counter.set(counter.get() + 1)));

        let splits = channel_mask_splits(channel_count, channel_mask);
        let slots = vec![SlotState::default(); splits.len()];

        debug!(
            "encode session: {} Hz, {} channel(s), {} bits, mask {:#x}",
            sample_rate, channel_count, bits_per_sample, channel_mask
        );

        Session {
            bs,
            byte_count,
            options,
            sample_rate,
            bits_per_sample,
            channel_count,
            channel_mask,
            splits,
            block_index: 0,
            block_offsets: Vec::new(),
            slots,
            decorrelator: Decorrelator::new(),
            sub_blocks: BitRecorder::new(),
            residual_data: BitRecorder::new(),
            md5: md5::Context::new(),
            pcm_bytes: 0,
            blocks_written: 0,
            wave_header_written: false,
            wave_header_offset: 0,
            channel_info_written: false,
        }
    }

    fn write_frame(&mut self, frame: &[Vec<i32>]) -> WvResult<()> {
        debug_assert_eq!(frame.len(), self.channel_count);
        let frames = frame[0].len();
        debug_assert!(frame.iter().all(|channel| channel.len() == frames));

        let pcm = frame_to_pcm_bytes(frame, self.bits_per_sample);
        self.md5.consume(&pcm);
        self.pcm_bytes += pcm.len() as u64;

        let splits = self.splits.clone();
        let mut current = 0;
        for (i, &count) in splits.iter().enumerate() {
            let channel_a = frame[current].clone();
            let channel_b = if count == 2 {
                frame[current + 1].clone()
            } else {
                Vec::new()
            };
            self.write_block(channel_a, channel_b, i, count, i == 0, i == splits.len() - 1)?;
            current += count;
        }

        self.block_index += frames as u32;
        Ok(())
    }

    fn write_block(
        &mut self,
        mut channel_a: Vec<i32>,
        mut channel_b: Vec<i32>,
        slot_index: usize,
        channel_count: usize,
        initial_block: bool,
        final_block: bool,
    ) -> WvResult<()> {
        debug_assert!(channel_count == 1 || channel_count == 2);

        self.block_offsets.push(self.byte_count.get());

        let mut header = BlockHeader::new(
            self.sample_rate,
            self.bits_per_sample,
            self.block_index,
            channel_a.len() as u32,
            channel_count == 1,
            initial_block,
            final_block,
        );

        let abs_max = |samples: &[i32]| samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
        let magnitude = if channel_count == 1 {
            bit_length(abs_max(&channel_a))
        } else {
            bit_length(abs_max(&channel_a)).max(bit_length(abs_max(&channel_b)))
        };
        // the field is 5 bits wide; full-scale 32-bit data wraps to 0
        header.maximum_data_magnitude = magnitude & 0x1F;

        header.false_stereo =
            self.options.false_stereo && channel_count == 2 && channel_a == channel_b;

        let mut wasted_bits = 0u32;
        if self.options.wasted_bits {
            header.extended_size_integers = true;
            if channel_count == 2 && !header.false_stereo {
                wasted_bits = match (max_wasted_bits(&channel_a), max_wasted_bits(&channel_b)) {
                    (Some(a), Some(b)) => a.min(b),
                    (Some(w), None) | (None, Some(w)) => w,
                    (None, None) => 0,
                };
                if wasted_bits > 0 {
                    for sample in channel_a.iter_mut() {
                        *sample >>= wasted_bits;
                    }
                    for sample in channel_b.iter_mut() {
                        *sample >>= wasted_bits;
                    }
                }
            } else {
                wasted_bits = max_wasted_bits(&channel_a).unwrap_or(0);
                if wasted_bits > 0 {
                    for sample in channel_a.iter_mut() {
                        *sample >>= wasted_bits;
                    }
                }
            }
        }

        // checksum covers the samples after false stereo and wasted
        // bits, before joint stereo
        if channel_count == 1 || header.false_stereo {
            for &sample in channel_a.iter() {
                header.crc = crc_update(header.crc, sample);
            }
        } else {
            for (&a, &b) in channel_a.iter().zip(channel_b.iter()) {
                header.crc = crc_update(crc_update(header.crc, a), b);
            }
        }

        if self.options.joint_stereo && channel_count == 2 && !header.false_stereo {
            for (a, b) in channel_a.iter_mut().zip(channel_b.iter_mut()) {
                let mid = a.wrapping_sub(*b);
                let side = a.wrapping_add(*b) >> 1;
                *a = mid;
                *b = side;
            }
            header.joint_stereo = true;
        }

        // set for every two-channel block whether or not any
        // cross-channel terms are in play
        header.cross_channel_decorrelation = channel_count == 2;

        let effective_channels = channel_count - header.false_stereo as usize;
        let mut tunables = Tunables::resolve(
            &self.slots[slot_index],
            self.options.decorrelation_passes as usize,
            effective_channels,
        );

        let mut sub_blocks = std::mem::take(&mut self.sub_blocks);
        sub_blocks.clear();

        if !self.wave_header_written {
            match &self.options.wave_header {
                None => {
                    self.wave_header_offset = self.byte_count.get() + HEADER_SIZE as u64;
                    writer::write_wave_header(
                        &mut sub_blocks,
                        self.channel_count,
                        self.channel_mask,
                        self.sample_rate,
                        self.bits_per_sample,
                        0,
                    )?;
                }
                Some(blob) => {
                    writer::write_verbatim_sub_block(&mut sub_blocks, FN_WAVE_HEADER, true, blob)?;
                }
            }
            self.wave_header_written = true;
        }

        if !tunables.terms.is_empty() {
            writer::write_decorr_terms(&mut sub_blocks, &tunables.terms, &tunables.deltas)?;
            writer::write_decorr_weights(
                &mut sub_blocks,
                effective_channels,
                &tunables.weight_codes_a,
                &tunables.weight_codes_b,
            )?;
            writer::write_decorr_samples(
                &mut sub_blocks,
                effective_channels,
                &tunables.terms,
                &tunables.sample_codes_a,
                &tunables.sample_codes_b,
            )?;
        }

        if header.extended_size_integers {
            writer::write_int32_info(&mut sub_blocks, 0, wasted_bits as u8, 0, 0)?;
        }

        writer::write_entropy_variables(
            &mut sub_blocks,
            &tunables.median_codes,
            effective_channels,
        )?;

        if !self.channel_info_written && self.channel_count > 2 {
            writer::write_channel_info(&mut sub_blocks, self.channel_count, self.channel_mask)?;
            self.channel_info_written = true;
        }

        // passes run most-recently-listed first, each wrapping its
        // output tail into the seeds for the next block
        for i in (0..tunables.terms.len()).rev() {
            let (weights_a, weights_b) = (&mut tunables.weights_a, &mut tunables.weights_b);
            self.decorrelator.perform_pass(
                tunables.terms[i],
                tunables.deltas[i],
                &mut channel_a,
                &mut channel_b,
                &mut weights_a[i],
                &mut weights_b[i],
                &tunables.samples_a[i],
                &tunables.samples_b[i],
                effective_channels,
            );
            wrap_samples(
                &mut tunables.samples_a[i],
                &mut tunables.samples_b[i],
                tunables.terms[i],
                &channel_a,
                &channel_b,
                effective_channels,
            );
        }

        let mut residual_data = std::mem::take(&mut self.residual_data);
        residual_data.clear();
        entropy::write_residuals(
            &mut residual_data,
            &channel_a,
            &channel_b,
            &mut tunables.medians,
            effective_channels,
        )?;
        writer::write_subblock_header(
            &mut sub_blocks,
            FN_BITSTREAM,
            false,
            (residual_data.bits_written() / 8) as u32,
        )?;
        sub_blocks.append(&residual_data);

        self.slots[slot_index] = tunables.store(effective_channels);

        header.block_size = 24 + (sub_blocks.bits_written() / 8) as u32;
        writer::write_block_header(&mut self.bs, &header)?;
        sub_blocks.replay(&mut self.bs)?;

        self.sub_blocks = sub_blocks;
        self.residual_data = residual_data;
        self.blocks_written += 1;

        trace!(
            "block {}: index {}, {} frame(s), {} channel(s), {} bytes",
            self.blocks_written,
            header.block_index,
            header.block_samples,
            channel_count,
            header.block_size + 8
        );
        Ok(())
    }

    fn finish(mut self) -> WvResult<EncodeStats> {
        self.block_offsets.push(self.byte_count.get());
        let digest = std::mem::replace(&mut self.md5, md5::Context::new()).compute();

        let mut header = BlockHeader::new(
            self.sample_rate,
            self.bits_per_sample,
            self.block_index,
            0,
            true,
            true,
            true,
        );

        let mut sub_blocks = std::mem::take(&mut self.sub_blocks);
        sub_blocks.clear();
        writer::write_verbatim_sub_block(&mut sub_blocks, FN_MD5, true, &digest.0)?;
        if let Some(footer) = &self.options.wave_footer {
            writer::write_verbatim_sub_block(&mut sub_blocks, FN_WAVE_FOOTER, true, footer)?;
        }

        header.block_size = 24 + (sub_blocks.bits_written() / 8) as u32;
        writer::write_block_header(&mut self.bs, &header)?;
        sub_blocks.replay(&mut self.bs)?;
        self.blocks_written += 1;

        let stream_bytes = self.byte_count.get();

        // a synthesized header was written with a zero data size and
        // gets rewritten now that the real size is known
        if self.wave_header_written && self.options.wave_header.is_none() {
            self.bs.seek(SeekFrom::Start(self.wave_header_offset))?;
            writer::write_wave_header(
                &mut self.bs,
                self.channel_count,
                self.channel_mask,
                self.sample_rate,
                self.bits_per_sample,
                self.pcm_bytes as u32,
            )?;
        }

        // every block's total-samples placeholder becomes the frame
        // count, the footer block's included
        for i in 0..self.block_offsets.len() {
            let offset = self.block_offsets[i];
            self.bs.seek(SeekFrom::Start(offset + 12))?;
            self.bs.write_bits64(32, self.block_index as u64)?;
        }

        debug!(
            "encode session done: {} frame(s), {} block(s), {} PCM bytes in, {} stream bytes out",
            self.block_index, self.blocks_written, self.pcm_bytes, stream_bytes
        );

        Ok(EncodeStats {
            frames: self.block_index as u64,
            blocks: self.blocks_written,
            pcm_bytes: self.pcm_bytes,
            stream_bytes,
            md5: digest.0,
        })
    }
}

/// Lossless block encoder, configured through the builder methods and
/// run with [`Encoder::encode_to`] or [`Encoder::encode`].
///
/// ```
/// use libwv_audio::Encoder;
///
/// let samples: Vec<i32> = (0..2000).map(|i| (i % 128) - 64).collect();
/// let stream = Encoder::new(44100, 1, 16)
///     .unwrap()
///     .decorrelation_passes(5)
///     .unwrap()
///     .encode(&samples)
///     .unwrap();
/// assert_eq!(&stream[0..4], b"wvpk");
/// ```
#[derive(Debug, Clone)]
pub struct Encoder {
    sample_rate: u32,
    channel_count: usize,
    bits_per_sample: u32,
    channel_mask: u32,
    options: EncodeOptions,
}

impl Encoder {
    pub fn new(sample_rate: u32, channel_count: usize, bits_per_sample: u32) -> WvResult<Encoder> {
        if sample_rate == 0 {
            return Err("sample rate must be positive".to_string());
        }
        if channel_count == 0 {
            return Err("channel count must be positive".to_string());
        }
        if ![8, 16, 24, 32].contains(&bits_per_sample) {
            return Err(format!(
                "invalid bits per sample {} (expected 8, 16, 24 or 32)",
                bits_per_sample
            ));
        }
        let channel_mask = match channel_count {
            1 => 0x4,
            2 => 0x3,
            n => ((1u64 << n.min(32)) - 1) as u32,
        };
        Ok(Encoder {
            sample_rate,
            channel_count,
            bits_per_sample,
            channel_mask,
            options: EncodeOptions::default(),
        })
    }

    /// Overrides the WAVE channel mask used to group channels into
    /// blocks; 0 makes every channel its own mono block.
    pub fn channel_mask(mut self, channel_mask: u32) -> Encoder {
        self.channel_mask = channel_mask;
        self
    }

    pub fn block_size(mut self, block_size: u32) -> WvResult<Encoder> {
        self.options.block_size = block_size;
        self.options.verify()?;
        Ok(self)
    }

    /// Sets the decorrelation pass count; one of 0, 1, 2, 5, 10 or 16.
    pub fn decorrelation_passes(mut self, passes: u32) -> WvResult<Encoder> {
        self.options.decorrelation_passes = passes;
        self.options.verify()?;
        Ok(self)
    }

    pub fn joint_stereo(mut self, enabled: bool) -> Encoder {
        self.options.joint_stereo = enabled;
        self
    }

    pub fn false_stereo(mut self, enabled: bool) -> Encoder {
        self.options.false_stereo = enabled;
        self
    }

    pub fn wasted_bits(mut self, enabled: bool) -> Encoder {
        self.options.wasted_bits = enabled;
        self
    }

    /// Stores a verbatim RIFF header instead of synthesizing one.
    /// Verbatim headers are never back-patched.
    pub fn wave_header(mut self, header: Vec<u8>) -> Encoder {
        self.options.wave_header = Some(header);
        self
    }

    pub fn wave_footer(mut self, footer: Vec<u8>) -> Encoder {
        self.options.wave_footer = Some(footer);
        self
    }

    pub fn options(mut self, options: EncodeOptions) -> WvResult<Encoder> {
        options.verify()?;
        self.options = options;
        Ok(self)
    }

    /// Encodes everything `source` yields into `sink`, which must be
    /// seekable for the end-of-stream back-patches.
    pub fn encode_to<W, S>(&self, sink: W, source: &mut S) -> WvResult<EncodeStats>
    where
        W: Write + Seek,
        S: PcmSource,
    {
        self.options.verify()?;
        let mut session = Session::new(
            sink,
            self.sample_rate,
            self.channel_count,
            self.bits_per_sample,
            self.channel_mask,
            self.options.clone(),
        );

        loop {
            let frame = source.read(self.options.block_size as usize)?;
            if frame.is_empty() || frame[0].is_empty() {
                break;
            }
            if frame.len() != self.channel_count {
                return Err(format!(
                    "source produced {} channel(s), expected {}",
                    frame.len(),
                    self.channel_count
                ));
            }
            session.write_frame(&frame)?;
        }

        session.finish()
    }

    pub fn encode(&self, samples: &[i32]) -> WvResult<Vec<u8>> {
        let mut source = InterleavedSource::new(samples, self.channel_count)?;
        let mut sink = Cursor::new(Vec::new());
        self.encode_to(&mut sink, &mut source)?;
        Ok(sink.into_inner())
    }
}

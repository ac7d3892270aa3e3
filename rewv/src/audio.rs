use anyhow::{bail, Context, Result};
use std::fs::File;
use std::path::Path;
use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Decoded integer PCM, interleaved frame by frame.
pub struct AudioData {
    pub samples: Vec<i32>,
    pub sample_rate: u32,
    pub channels: usize,
    pub bits_per_sample: u32,
}

impl AudioData {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels
        }
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Reads an audio file, keeping samples in their integer form.
///
/// Odd depths round up to the next stored width (a 20-bit source
/// becomes 24-bit samples with zeroed low bits, which the encoder's
/// wasted-bit scan strips back out).
pub fn read_audio_file(path: &Path) -> Result<AudioData> {
    let file = File::open(path).context("Failed to open audio file")?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .context("Unsupported audio format")?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .context("No audio track found")?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .context("Unknown sample rate")?;
    let channels = track
        .codec_params
        .channels
        .context("Unknown channel count")?
        .count();
    let source_bits = track.codec_params.bits_per_sample;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .context("Failed to create decoder")?;

    let mut samples = Vec::new();
    let mut bits_per_sample = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break
            }
            Err(e) => return Err(e).context("Error reading packet"),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(symphonia::core::errors::Error::DecodeError(_)) => continue,
            Err(e) => return Err(e).context("Error decoding packet"),
        };

        let stored = bits_per_sample
            .get_or_insert_with(|| stored_bits(&decoded, source_bits));
        append_samples(&decoded, &mut samples, channels, *stored)?;
    }

    Ok(AudioData {
        samples,
        sample_rate,
        channels,
        bits_per_sample: bits_per_sample.unwrap_or(16),
    })
}

fn container_bits(buffer: &AudioBufferRef) -> u32 {
    match buffer {
        AudioBufferRef::U8(_) | AudioBufferRef::S8(_) => 8,
        AudioBufferRef::U16(_) | AudioBufferRef::S16(_) => 16,
        AudioBufferRef::U24(_) | AudioBufferRef::S24(_) => 24,
        _ => 32,
    }
}

/// The width samples are kept at: the source depth rounded up to the
/// next whole-byte width, capped by the container.
fn stored_bits(buffer: &AudioBufferRef, source_bits: Option<u32>) -> u32 {
    let container = container_bits(buffer);
    match source_bits {
        Some(bits) if bits > 0 && bits <= container => bits.div_ceil(8) * 8,
        _ => container,
    }
}

fn append_samples(
    buffer: &AudioBufferRef,
    samples: &mut Vec<i32>,
    channels: usize,
    stored_bits: u32,
) -> Result<()> {
    // symphonia buffers are left-justified within their container, so
    // a narrower source shifts back down to its stored width
    let shift = container_bits(buffer) - stored_bits.min(container_bits(buffer));
    match buffer {
        AudioBufferRef::U8(buf) => {
            for frame in 0..buf.frames() {
                for ch in 0..channels {
                    samples.push((buf.chan(ch)[frame] as i32 - 128) >> shift);
                }
            }
        }
        AudioBufferRef::S16(buf) => {
            for frame in 0..buf.frames() {
                for ch in 0..channels {
                    samples.push(buf.chan(ch)[frame] as i32 >> shift);
                }
            }
        }
        AudioBufferRef::S24(buf) => {
            for frame in 0..buf.frames() {
                for ch in 0..channels {
                    samples.push(buf.chan(ch)[frame].inner() >> shift);
                }
            }
        }
        AudioBufferRef::S32(buf) => {
            for frame in 0..buf.frames() {
                for ch in 0..channels {
                    samples.push(buf.chan(ch)[frame] >> shift);
                }
            }
        }
        AudioBufferRef::F32(_) | AudioBufferRef::F64(_) => {
            bail!("floating-point audio has no lossless integer form; convert it first")
        }
        _ => bail!("unsupported sample format"),
    }
    Ok(())
}

//! PCM input abstraction for the encoder.

use crate::core::WvResult;

/// Supplies planar signed PCM to an encode session.
///
/// Each call returns up to `frames` frames as one `Vec<i32>` per
/// channel, all the same length. An empty result (or empty channels)
/// signals the end of the input. The channel count must stay constant
/// for the life of the source.
pub trait PcmSource {
    fn read(&mut self, frames: usize) -> WvResult<Vec<Vec<i32>>>;
}

/// A [`PcmSource`] over a borrowed buffer of interleaved samples.
pub struct InterleavedSource<'a> {
    samples: &'a [i32],
    channels: usize,
    position: usize,
}

impl<'a> InterleavedSource<'a> {
    pub fn new(samples: &'a [i32], channels: usize) -> WvResult<InterleavedSource<'a>> {
        if channels == 0 {
            return Err("channel count must be positive".to_string());
        }
        if samples.len() % channels != 0 {
            return Err(format!(
                "sample count {} is not a multiple of {} channels",
                samples.len(),
                channels
            ));
        }
        Ok(InterleavedSource {
            samples,
            channels,
            position: 0,
        })
    }
}

impl PcmSource for InterleavedSource<'_> {
    fn read(&mut self, frames: usize) -> WvResult<Vec<Vec<i32>>> {
        let available = (self.samples.len() - self.position) / self.channels;
        let count = frames.min(available);
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut planar: Vec<Vec<i32>> = (0..self.channels)
            .map(|_| Vec::with_capacity(count))
            .collect();
        for i in 0..count {
            let frame = &self.samples[self.position + i * self.channels..];
            for (channel, buffer) in planar.iter_mut().enumerate() {
                buffer.push(frame[channel]);
            }
        }
        self.position += count * self.channels;
        Ok(planar)
    }
}

//! Adaptive Golomb-style residual coding with three running medians.
//!
//! Residuals are banded by the medians: a unary band index, an optional
//! fixed-width remainder with rounding extra bit, and a sign. Symbols are
//! held back one step because each unary prefix is re-biased by the
//! `holding_zero`/`holding_one` flip-flops, which depend on the *next*
//! symbol. When both first medians decay below 2, runs of zeroes collapse
//! into an Elias-gamma style escape count.

use crate::core::{BitWrite, WvResult, UNARY_LIMIT};
use crate::core::bit_length;

fn get_median(medians: &[i32; 3], i: usize) -> i32 {
    (medians[i] >> 4) + 1
}

fn inc_median(medians: &mut [i32; 3], i: usize) {
    medians[i] += ((medians[i] + (128 >> i)) / (128 >> i)) * 5;
}

fn dec_median(medians: &mut [i32; 3], i: usize) {
    medians[i] -= ((medians[i] + (128 >> i) - 2) / (128 >> i)) * 2;
}

/// Elias-gamma style escape: unary bit length, then the low bits.
fn write_egc<B: BitWrite>(bs: &mut B, value: u32) -> WvResult<()> {
    debug_assert!(value > 0);
    let fixed_size = bit_length(value) - 1;
    bs.write_unary(0, fixed_size + 1)?;
    bs.write_bits(fixed_size, value & ((1 << fixed_size) - 1))
}

#[derive(Debug, Clone, Copy)]
struct GolombCode {
    unary: u32,
    fixed_value: u32,
    fixed_size: u32,
    extra_bit: Option<u32>,
    sign: u32,
}

/// One symbol held back until the next symbol fixes its holding flags.
#[derive(Debug, Clone, Copy)]
struct Pending {
    zero_run: Option<u32>,
    golomb: Option<GolombCode>,
    input_holding_zero: bool,
    input_holding_one: bool,
    output_holding_zero: bool,
    output_holding_one: bool,
}

/// Streaming residual encoder for one block's bitstream sub-block.
#[derive(Debug)]
pub struct ResidualCoder {
    pending: Pending,
}

impl ResidualCoder {
    pub fn new() -> ResidualCoder {
        ResidualCoder {
            pending: Pending {
                zero_run: None,
                golomb: None,
                input_holding_zero: true,
                input_holding_one: false,
                output_holding_zero: false,
                output_holding_one: false,
            },
        }
    }

    fn flush_pending<B: BitWrite>(&self, bs: &mut B) -> WvResult<()> {
        let pending = &self.pending;

        if let Some(count) = pending.zero_run {
            if count == 0 {
                // a "false alarm" run that never materialized
                bs.write_unary(0, 0)?;
            } else {
                write_egc(bs, count)?;
            }
        }

        let golomb = match pending.golomb {
            Some(golomb) => golomb,
            None => return Ok(()),
        };

        if !pending.input_holding_zero {
            // the raw band index, re-biased by the holding flags
            let unary = if !pending.input_holding_one {
                if pending.output_holding_one {
                    golomb.unary * 2 + 1
                } else {
                    golomb.unary * 2
                }
            } else if pending.output_holding_one {
                golomb.unary * 2 - 1
            } else {
                (golomb.unary - 1) * 2
            };

            if unary >= UNARY_LIMIT {
                bs.write_unary(0, UNARY_LIMIT)?;
                let excess = unary - UNARY_LIMIT;
                if excess > 1 {
                    write_egc(bs, excess)?;
                } else {
                    bs.write_unary(0, excess)?;
                }
            } else {
                bs.write_unary(0, unary)?;
            }
        } else {
            debug_assert!(golomb.unary == 0 && !pending.input_holding_one);
        }

        if golomb.fixed_size > 0 {
            bs.write_bits(golomb.fixed_size, golomb.fixed_value)?;
        }
        if let Some(extra) = golomb.extra_bit {
            bs.write_bits(1, extra)?;
        }
        bs.write_bits(1, golomb.sign)
    }

    /// Encodes one residual for `channel`, possibly emitting the
    /// previously held symbol.
    pub fn encode<B: BitWrite>(
        &mut self,
        bs: &mut B,
        medians: &mut [[i32; 3]; 2],
        channel: usize,
        value: i32,
    ) -> WvResult<()> {
        let mut zero_run: Option<u32> = None;

        if medians[0][0] < 2 && medians[1][0] < 2 {
            if self.pending.zero_run.is_some() && self.pending.golomb.is_none() {
                if value == 0 {
                    // continuing an open run
                    if let Some(run) = self.pending.zero_run.as_mut() {
                        *run += 1;
                    }
                    return Ok(());
                }
                // a nonzero ends the run; its count goes out with the
                // pending symbol and this one is coded normally
            } else if self.pending.input_holding_zero && !self.pending.input_holding_one {
                if value == 0 {
                    // a new run begins: flush the held symbol and hold
                    // the run marker instead
                    self.pending.output_holding_zero = false;
                    self.pending.output_holding_one = false;
                    self.flush_pending(bs)?;
                    self.pending = Pending {
                        zero_run: Some(1),
                        golomb: None,
                        input_holding_zero: false,
                        input_holding_one: false,
                        output_holding_zero: false,
                        output_holding_one: false,
                    };
                    medians[0] = [0; 3];
                    medians[1] = [0; 3];
                    return Ok(());
                }
                // the decoder expects a run count here, so emit an
                // empty one before the coded value
                zero_run = Some(0);
            }
        }

        let sign;
        let magnitude = if value < 0 {
            sign = 1;
            !value
        } else {
            sign = 0;
            value
        };

        let m = &mut medians[channel];
        let ones_count: u32;
        let low: i32;
        let high: i32;
        if magnitude < get_median(m, 0) {
            ones_count = 0;
            low = 0;
            high = get_median(m, 0) - 1;
            dec_median(m, 0);
        } else if magnitude - get_median(m, 0) < get_median(m, 1) {
            ones_count = 1;
            low = get_median(m, 0);
            high = low.wrapping_add(get_median(m, 1)).wrapping_sub(1);
            inc_median(m, 0);
            dec_median(m, 1);
        } else if magnitude - (get_median(m, 0) + get_median(m, 1)) < get_median(m, 2) {
            ones_count = 2;
            low = get_median(m, 0) + get_median(m, 1);
            high = low.wrapping_add(get_median(m, 2)).wrapping_sub(1);
            inc_median(m, 0);
            inc_median(m, 1);
            dec_median(m, 2);
        } else {
            let band = 2 + (magnitude - (get_median(m, 0) + get_median(m, 1))) / get_median(m, 2);
            ones_count = band as u32;
            low = get_median(m, 0) + get_median(m, 1) + (band - 2) * get_median(m, 2);
            // near full-scale this can run past i32::MAX; the spread
            // still comes out right from the wrapped difference
            high = low.wrapping_add(get_median(m, 2)).wrapping_sub(1);
            inc_median(m, 0);
            inc_median(m, 1);
            inc_median(m, 2);
        }

        let golomb = if high != low {
            let max_code = high.wrapping_sub(low) as u32;
            let code = (magnitude - low) as u32;
            let bit_count = bit_length(max_code);
            let extras = (1u32 << bit_count) - max_code - 1;
            if code < extras {
                GolombCode {
                    unary: ones_count,
                    fixed_value: code,
                    fixed_size: bit_count - 1,
                    extra_bit: None,
                    sign,
                }
            } else {
                GolombCode {
                    unary: ones_count,
                    fixed_value: (code + extras) >> 1,
                    fixed_size: bit_count - 1,
                    extra_bit: Some((code + extras) & 1),
                    sign,
                }
            }
        } else {
            GolombCode {
                unary: ones_count,
                fixed_value: 0,
                fixed_size: 0,
                extra_bit: None,
                sign,
            }
        };

        // settle the held symbol's output flags and this symbol's input
        // flags from the two unary values
        let (input_holding_zero, input_holding_one);
        if let Some(held) = self.pending.golomb {
            if held.unary > 0 && golomb.unary > 0 {
                input_holding_zero = false;
                input_holding_one = true;
            } else if held.unary == 0 && golomb.unary > 0 {
                input_holding_zero = false;
                input_holding_one = !self.pending.input_holding_zero;
            } else if held.unary > 0 && golomb.unary == 0 {
                input_holding_zero = true;
                input_holding_one = false;
            } else {
                input_holding_zero = !self.pending.input_holding_zero;
                input_holding_one = false;
            }
            self.pending.output_holding_zero = input_holding_zero;
            self.pending.output_holding_one = input_holding_one;
        } else {
            debug_assert!(!self.pending.output_holding_zero && !self.pending.output_holding_one);
            input_holding_zero = false;
            input_holding_one = false;
        }

        self.flush_pending(bs)?;
        self.pending = Pending {
            zero_run,
            golomb: Some(golomb),
            input_holding_zero,
            input_holding_one,
            output_holding_zero: false,
            output_holding_one: false,
        };
        Ok(())
    }

    /// Flushes the last held symbol at the end of a block.
    pub fn finish<B: BitWrite>(&mut self, bs: &mut B) -> WvResult<()> {
        self.pending.output_holding_zero = false;
        self.pending.output_holding_one = !self.pending.input_holding_zero;
        self.flush_pending(bs)
    }
}

impl Default for ResidualCoder {
    fn default() -> ResidualCoder {
        ResidualCoder::new()
    }
}

/// Encodes a whole block's residuals, interleaving channels sample by
/// sample, and pads the stream to a 16-bit boundary with one bits.
pub fn write_residuals<B: BitWrite>(
    bs: &mut B,
    channel_a: &[i32],
    channel_b: &[i32],
    medians: &mut [[i32; 3]; 2],
    channel_count: usize,
) -> WvResult<()> {
    debug_assert!(channel_count == 1 || channel_count == 2);

    let mut coder = ResidualCoder::new();
    let total = channel_a.len() * channel_count;
    for sample in 0..total {
        let channel = sample % channel_count;
        let residual = if channel == 0 {
            channel_a[sample / channel_count]
        } else {
            channel_b[sample / channel_count]
        };
        coder.encode(bs, medians, channel, residual)?;
    }
    coder.finish(bs)?;

    while bs.bits_written() % 16 != 0 {
        bs.write_bits(1, 1)?;
    }
    Ok(())
}

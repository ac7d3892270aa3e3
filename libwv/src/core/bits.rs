//! Bit-level output primitives for the block writer.
//!
//! Three sinks share one trait: [`BitWriter`] pushes completed bytes to an
//! `io::Write` (notifying any registered byte observers), [`BitAccumulator`]
//! only counts bits, and [`BitRecorder`] logs operations for later replay.
//! All of them accept values most-significant-bit-agnostically: the active
//! endianness decides how partial bits pack into bytes.

use std::io::{Seek, SeekFrom, Write};

use crate::core::types::WvResult;

/// Byte packing order for sub-byte writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Big,
    Little,
}

/// Called once per completed byte, in stream order.
pub type ByteObserver = Box<dyn FnMut(u8)>;

fn check_unsigned(count: u32, value: u32) {
    assert!(count <= 32, "bit count {} out of range", count);
    if count < 32 {
        assert!(value >> count == 0, "value {:#x} exceeds {} bits", value, count);
    }
}

fn check_unsigned64(count: u32, value: u64) {
    assert!(count <= 64, "bit count {} out of range", count);
    if count < 64 {
        assert!(value >> count == 0, "value {:#x} exceeds {} bits", value, count);
    }
}

fn check_signed(count: u32, value: i32) {
    assert!((1..=32).contains(&count), "bit count {} out of range", count);
    if count < 32 {
        let limit = 1i64 << (count - 1);
        assert!(
            (value as i64) < limit && (value as i64) >= -limit,
            "value {} exceeds {} signed bits",
            value,
            count
        );
    }
}

/// Common interface over the direct, counting and recording sinks.
///
/// `write_bits` accepts 0..=32 bits, `write_bits64` 0..=64,
/// `write_signed_bits` 1..=32 (two's complement). `write_unary` emits
/// `value` copies of `!stop_bit` followed by a single `stop_bit`.
/// Violating a width precondition is a caller bug and panics.
pub trait BitWrite {
    fn write_bits(&mut self, count: u32, value: u32) -> WvResult<()>;
    fn write_signed_bits(&mut self, count: u32, value: i32) -> WvResult<()>;
    fn write_bits64(&mut self, count: u32, value: u64) -> WvResult<()>;
    fn write_unary(&mut self, stop_bit: u32, value: u32) -> WvResult<()>;

    /// Pads with zero bits up to the next byte boundary.
    fn byte_align(&mut self) -> WvResult<()>;

    /// Switches packing order, forcing byte alignment first.
    fn set_endianness(&mut self, endianness: Endianness) -> WvResult<()>;

    /// Total bits accepted so far, alignment padding included.
    fn bits_written(&self) -> u64;
}

/// Streams bits straight to an underlying writer.
pub struct BitWriter<W: Write> {
    inner: W,
    endianness: Endianness,
    bitbuf: u64,
    bitcount: u32,
    bits_written: u64,
    observers: Vec<ByteObserver>,
}

impl<W: Write> BitWriter<W> {
    pub fn new(inner: W, endianness: Endianness) -> BitWriter<W> {
        BitWriter {
            inner,
            endianness,
            bitbuf: 0,
            bitcount: 0,
            bits_written: 0,
            observers: Vec::new(),
        }
    }

    /// Registers a callback invoked for every completed byte.
    pub fn add_observer(&mut self, observer: ByteObserver) {
        self.observers.push(observer);
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn put_byte(&mut self, byte: u8) -> WvResult<()> {
        self.inner
            .write_all(&[byte])
            .map_err(|e| format!("write error: {}", e))?;
        for observer in &mut self.observers {
            observer(byte);
        }
        Ok(())
    }

    fn drain(&mut self) -> WvResult<()> {
        match self.endianness {
            Endianness::Little => {
                while self.bitcount >= 8 {
                    let byte = (self.bitbuf & 0xFF) as u8;
                    self.put_byte(byte)?;
                    self.bitbuf >>= 8;
                    self.bitcount -= 8;
                }
            }
            Endianness::Big => {
                while self.bitcount >= 8 {
                    let byte = ((self.bitbuf >> (self.bitcount - 8)) & 0xFF) as u8;
                    self.put_byte(byte)?;
                    self.bitcount -= 8;
                    self.bitbuf &= (1u64 << self.bitcount) - 1;
                }
            }
        }
        Ok(())
    }
}

impl<W: Write + Seek> BitWriter<W> {
    /// Repositions the underlying stream. Only valid on a byte boundary.
    pub fn seek(&mut self, pos: SeekFrom) -> WvResult<u64> {
        assert!(self.bitcount == 0, "seek on unaligned bit writer");
        self.inner
            .seek(pos)
            .map_err(|e| format!("seek error: {}", e))
    }
}

impl<W: Write> BitWrite for BitWriter<W> {
    fn write_bits(&mut self, count: u32, value: u32) -> WvResult<()> {
        check_unsigned(count, value);
        if count == 0 {
            return Ok(());
        }
        match self.endianness {
            Endianness::Little => {
                self.bitbuf |= (value as u64) << self.bitcount;
            }
            Endianness::Big => {
                self.bitbuf = (self.bitbuf << count) | value as u64;
            }
        }
        self.bitcount += count;
        self.bits_written += count as u64;
        self.drain()
    }

    fn write_signed_bits(&mut self, count: u32, value: i32) -> WvResult<()> {
        check_signed(count, value);
        if value >= 0 {
            self.write_bits(count, value as u32)
        } else {
            let encoded = (1u64 << count) - (-(value as i64)) as u64;
            self.write_bits(count, encoded as u32)
        }
    }

    fn write_bits64(&mut self, count: u32, value: u64) -> WvResult<()> {
        check_unsigned64(count, value);
        if count <= 32 {
            return self.write_bits(count, value as u32);
        }
        let low = (value & 0xFFFF_FFFF) as u32;
        let high = (value >> 32) as u32;
        match self.endianness {
            Endianness::Little => {
                self.write_bits(32, low)?;
                self.write_bits(count - 32, high)
            }
            Endianness::Big => {
                self.write_bits(count - 32, high)?;
                self.write_bits(32, low)
            }
        }
    }

    fn write_unary(&mut self, stop_bit: u32, value: u32) -> WvResult<()> {
        assert!(stop_bit <= 1, "stop bit must be 0 or 1");
        let mut remaining = value;
        while remaining > 0 {
            let chunk = remaining.min(31);
            let pattern = if stop_bit == 0 { (1u32 << chunk) - 1 } else { 0 };
            self.write_bits(chunk, pattern)?;
            remaining -= chunk;
        }
        self.write_bits(1, stop_bit)
    }

    fn byte_align(&mut self) -> WvResult<()> {
        if self.bitcount % 8 != 0 {
            let pad = 8 - (self.bitcount % 8);
            self.write_bits(pad, 0)?;
        }
        Ok(())
    }

    fn set_endianness(&mut self, endianness: Endianness) -> WvResult<()> {
        self.byte_align()?;
        self.endianness = endianness;
        Ok(())
    }

    fn bits_written(&self) -> u64 {
        self.bits_written
    }
}

/// Counts the cost of a write sequence without producing output.
///
/// Lets callers evaluate how many bits a candidate encoding would take
/// before committing it to a real stream.
#[derive(Debug, Default, Clone)]
pub struct BitAccumulator {
    bits_written: u64,
}

impl BitAccumulator {
    pub fn new() -> BitAccumulator {
        BitAccumulator::default()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bits_written / 8
    }

    /// Absorbs a recorder's total without replaying its operations.
    pub fn absorb(&mut self, recorder: &BitRecorder) {
        self.bits_written += recorder.bits_written();
    }
}

impl BitWrite for BitAccumulator {
    fn write_bits(&mut self, count: u32, value: u32) -> WvResult<()> {
        check_unsigned(count, value);
        self.bits_written += count as u64;
        Ok(())
    }

    fn write_signed_bits(&mut self, count: u32, value: i32) -> WvResult<()> {
        check_signed(count, value);
        self.bits_written += count as u64;
        Ok(())
    }

    fn write_bits64(&mut self, count: u32, value: u64) -> WvResult<()> {
        check_unsigned64(count, value);
        self.bits_written += count as u64;
        Ok(())
    }

    fn write_unary(&mut self, stop_bit: u32, value: u32) -> WvResult<()> {
        assert!(stop_bit <= 1, "stop bit must be 0 or 1");
        self.bits_written += value as u64 + 1;
        Ok(())
    }

    fn byte_align(&mut self) -> WvResult<()> {
        if self.bits_written % 8 != 0 {
            self.bits_written += 8 - (self.bits_written % 8);
        }
        Ok(())
    }

    fn set_endianness(&mut self, _endianness: Endianness) -> WvResult<()> {
        self.byte_align()
    }

    fn bits_written(&self) -> u64 {
        self.bits_written
    }
}

#[derive(Debug, Clone, Copy)]
enum BitOp {
    Bits { count: u32, value: u32 },
    SignedBits { count: u32, value: i32 },
    Bits64 { count: u32, value: u64 },
    Unary { stop_bit: u32, value: u32 },
    ByteAlign,
    SetEndianness(Endianness),
}

/// Records operations for deferred replay into another sink.
///
/// Widths are validated at record time, so a replay can only fail on I/O.
/// Two recorders can be merged with [`BitRecorder::append`] without
/// replaying, and `std::mem::swap` moves contents between a pair in O(1),
/// which is how the block assembler reuses scratch recorders.
#[derive(Debug, Default, Clone)]
pub struct BitRecorder {
    ops: Vec<BitOp>,
    bits_written: u64,
}

impl BitRecorder {
    pub fn new() -> BitRecorder {
        BitRecorder::default()
    }

    /// Drops all recorded operations, keeping the allocation.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.bits_written = 0;
    }

    /// Appends another recorder's operations to this one.
    pub fn append(&mut self, other: &BitRecorder) {
        self.ops.extend_from_slice(&other.ops);
        self.bits_written += other.bits_written;
    }

    /// Replays every recorded operation into `target` in order.
    pub fn replay<S: BitWrite + ?Sized>(&self, target: &mut S) -> WvResult<()> {
        for op in &self.ops {
            match *op {
                BitOp::Bits { count, value } => target.write_bits(count, value)?,
                BitOp::SignedBits { count, value } => target.write_signed_bits(count, value)?,
                BitOp::Bits64 { count, value } => target.write_bits64(count, value)?,
                BitOp::Unary { stop_bit, value } => target.write_unary(stop_bit, value)?,
                BitOp::ByteAlign => target.byte_align()?,
                BitOp::SetEndianness(endianness) => target.set_endianness(endianness)?,
            }
        }
        Ok(())
    }
}

impl BitWrite for BitRecorder {
    fn write_bits(&mut self, count: u32, value: u32) -> WvResult<()> {
        check_unsigned(count, value);
        self.ops.push(BitOp::Bits { count, value });
        self.bits_written += count as u64;
        Ok(())
    }

    fn write_signed_bits(&mut self, count: u32, value: i32) -> WvResult<()> {
        check_signed(count, value);
        self.ops.push(BitOp::SignedBits { count, value });
        self.bits_written += count as u64;
        Ok(())
    }

    fn write_bits64(&mut self, count: u32, value: u64) -> WvResult<()> {
        check_unsigned64(count, value);
        self.ops.push(BitOp::Bits64 { count, value });
        self.bits_written += count as u64;
        Ok(())
    }

    fn write_unary(&mut self, stop_bit: u32, value: u32) -> WvResult<()> {
        assert!(stop_bit <= 1, "stop bit must be 0 or 1");
        self.ops.push(BitOp::Unary { stop_bit, value });
        self.bits_written += value as u64 + 1;
        Ok(())
    }

    fn byte_align(&mut self) -> WvResult<()> {
        if self.bits_written % 8 != 0 {
            self.ops.push(BitOp::ByteAlign);
            self.bits_written += 8 - (self.bits_written % 8);
        }
        Ok(())
    }

    fn set_endianness(&mut self, endianness: Endianness) -> WvResult<()> {
        self.byte_align()?;
        self.ops.push(BitOp::SetEndianness(endianness));
        Ok(())
    }

    fn bits_written(&self) -> u64 {
        self.bits_written
    }
}

pub mod bits;
pub mod convert;
pub mod types;

pub use bits::{BitAccumulator, BitRecorder, BitWrite, BitWriter, ByteObserver, Endianness};

pub use convert::{bit_length, restore_weight, store_weight, wv_exp2, wv_log2};

pub use types::*;

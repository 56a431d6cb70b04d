//! # Resim Serde
//! Bit-level serialization used by the `resim` scene synchronizer: a growable
//! bit writer, a failable bit reader, and compressed integer types.

mod bit_reader;
mod bit_writer;
mod error;
mod integer;
mod serde;

pub use bit_reader::BitReader;
pub use bit_writer::{overlay_head_u32, BitWrite, BitWriter};
pub use error::SerdeErr;
pub use integer::{
    SignedInteger, SignedVariableInteger, UnsignedInteger, UnsignedVariableInteger,
};
pub use serde::Serde;

use crate::{bit_reader::BitReader, bit_writer::BitWrite, error::SerdeErr};

/// A type that can be written to and read from a bit buffer.
pub trait Serde: Sized {
    fn ser(&self, writer: &mut dyn BitWrite);
    fn de(reader: &mut BitReader) -> Result<Self, SerdeErr>;
    fn bit_length(&self) -> u32;
}

impl Serde for bool {
    fn ser(&self, writer: &mut dyn BitWrite) {
        writer.write_bit(*self);
    }

    fn de(reader: &mut BitReader) -> Result<Self, SerdeErr> {
        reader.read_bit()
    }

    fn bit_length(&self) -> u32 {
        1
    }
}

macro_rules! impl_serde_uint {
    ($type:ty, $bytes:expr) => {
        impl Serde for $type {
            fn ser(&self, writer: &mut dyn BitWrite) {
                for byte in self.to_le_bytes() {
                    writer.write_byte(byte);
                }
            }

            fn de(reader: &mut BitReader) -> Result<Self, SerdeErr> {
                let mut bytes = [0u8; $bytes];
                for byte in bytes.iter_mut() {
                    *byte = reader.read_byte()?;
                }
                Ok(<$type>::from_le_bytes(bytes))
            }

            fn bit_length(&self) -> u32 {
                $bytes * 8
            }
        }
    };
}

impl_serde_uint!(u8, 1);
impl_serde_uint!(u16, 2);
impl_serde_uint!(u32, 4);
impl_serde_uint!(u64, 8);
impl_serde_uint!(i8, 1);
impl_serde_uint!(i16, 2);
impl_serde_uint!(i32, 4);
impl_serde_uint!(i64, 8);

impl Serde for f32 {
    fn ser(&self, writer: &mut dyn BitWrite) {
        self.to_bits().ser(writer);
    }

    fn de(reader: &mut BitReader) -> Result<Self, SerdeErr> {
        Ok(f32::from_bits(u32::de(reader)?))
    }

    fn bit_length(&self) -> u32 {
        32
    }
}

impl Serde for f64 {
    fn ser(&self, writer: &mut dyn BitWrite) {
        self.to_bits().ser(writer);
    }

    fn de(reader: &mut BitReader) -> Result<Self, SerdeErr> {
        Ok(f64::from_bits(u64::de(reader)?))
    }

    fn bit_length(&self) -> u32 {
        64
    }
}

impl Serde for String {
    fn ser(&self, writer: &mut dyn BitWrite) {
        let bytes = self.as_bytes();
        (bytes.len() as u16).ser(writer);
        for byte in bytes {
            writer.write_byte(*byte);
        }
    }

    fn de(reader: &mut BitReader) -> Result<Self, SerdeErr> {
        let length = u16::de(reader)? as usize;
        if reader.bits_remaining() < length * 8 {
            return Err(SerdeErr::BadLength { declared: length });
        }
        let mut bytes = Vec::with_capacity(length);
        for _ in 0..length {
            bytes.push(reader.read_byte()?);
        }
        String::from_utf8(bytes).map_err(|_| SerdeErr::BadUtf8)
    }

    fn bit_length(&self) -> u32 {
        16 + self.len() as u32 * 8
    }
}

impl Serde for Vec<u8> {
    fn ser(&self, writer: &mut dyn BitWrite) {
        (self.len() as u32).ser(writer);
        for byte in self {
            writer.write_byte(*byte);
        }
    }

    fn de(reader: &mut BitReader) -> Result<Self, SerdeErr> {
        let length = u32::de(reader)? as usize;
        if reader.bits_remaining() < length * 8 {
            return Err(SerdeErr::BadLength { declared: length });
        }
        let mut bytes = Vec::with_capacity(length);
        for _ in 0..length {
            bytes.push(reader.read_byte()?);
        }
        Ok(bytes)
    }

    fn bit_length(&self) -> u32 {
        32 + self.len() as u32 * 8
    }
}

impl<T: Serde> Serde for Option<T> {
    fn ser(&self, writer: &mut dyn BitWrite) {
        match self {
            Some(value) => {
                writer.write_bit(true);
                value.ser(writer);
            }
            None => writer.write_bit(false),
        }
    }

    fn de(reader: &mut BitReader) -> Result<Self, SerdeErr> {
        if reader.read_bit()? {
            Ok(Some(T::de(reader)?))
        } else {
            Ok(None)
        }
    }

    fn bit_length(&self) -> u32 {
        match self {
            Some(value) => 1 + value.bit_length(),
            None => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BitReader, BitWriter};

    fn round_trip<T: Serde + PartialEq + std::fmt::Debug>(value: T) {
        let mut writer = BitWriter::new();
        value.ser(&mut writer);
        let bytes = writer.to_bytes();
        let mut reader = BitReader::new(&bytes);
        assert_eq!(T::de(&mut reader).unwrap(), value);
    }

    #[test]
    fn primitives_round_trip() {
        round_trip(true);
        round_trip(0xDEu8);
        round_trip(0xDEADu16);
        round_trip(0xDEAD_BEEFu32);
        round_trip(-12_345i32);
        round_trip(3.25f32);
        round_trip(-0.125f64);
    }

    #[test]
    fn strings_round_trip() {
        round_trip(String::from(""));
        round_trip(String::from("platform/lift_3"));
    }

    #[test]
    fn byte_vectors_round_trip() {
        round_trip(Vec::<u8>::new());
        round_trip(vec![1u8, 2, 3, 255]);
    }

    #[test]
    fn options_round_trip() {
        round_trip(Option::<u32>::None);
        round_trip(Some(77u32));
    }

    #[test]
    fn truncated_string_fails_cleanly() {
        let mut writer = BitWriter::new();
        1000u16.ser(&mut writer);
        let bytes = writer.to_bytes();
        let mut reader = BitReader::new(&bytes);
        assert!(matches!(
            String::de(&mut reader),
            Err(SerdeErr::BadLength { declared: 1000 })
        ));
    }
}

use thiserror::Error;

/// Errors produced while reading from a bit buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerdeErr {
    /// The reader ran past the end of the underlying buffer.
    #[error("Bit buffer exhausted")]
    OutOfBits,

    /// A length-prefixed payload declared more bytes than the buffer holds.
    #[error("Declared payload length {declared} exceeds the remaining buffer")]
    BadLength { declared: usize },

    /// A byte sequence failed UTF-8 validation.
    #[error("Invalid UTF-8 in string payload")]
    BadUtf8,

    /// A decoded tag does not name any known variant.
    #[error("Unknown variant tag {tag}")]
    UnknownTag { tag: u8 },
}

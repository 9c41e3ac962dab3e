use thiserror::Error;

/// Malformed serialized term or value bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of term bytes")]
    UnexpectedEnd,
    #[error("unknown type rank {0:#04x}")]
    UnknownRank(u8),
    #[error("unsupported type in index term: {0}")]
    Unsupported(&'static str),
    #[error("malformed term: {0}")]
    Malformed(String),
}

/// A term that cannot be serialized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TermError {
    #[error("composite term has {0} elements, at most 255 are allowed")]
    TooManyElements(usize),
    #[error("index term of {0} bytes exceeds the maximum element length")]
    TooLarge(usize),
}

//! Composite (N-tuple) terms: `u8 count | (u32 BE len | term bytes)^count`.

use crate::error::{DecodeError, TermError};
use crate::term::{IndexTerm, is_serialized_metadata, is_serialized_truncated};

pub fn serialize_composite<T: AsRef<[u8]>>(terms: &[T]) -> Result<Vec<u8>, TermError> {
    let count = u8::try_from(terms.len()).map_err(|_| TermError::TooManyElements(terms.len()))?;
    let total: usize = terms.iter().map(|t| 4 + t.as_ref().len()).sum();
    let mut buf = Vec::with_capacity(1 + total);
    buf.push(count);
    for term in terms {
        let bytes = term.as_ref();
        let len = u32::try_from(bytes.len()).map_err(|_| TermError::TooLarge(bytes.len()))?;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(bytes);
    }
    Ok(buf)
}

/// Borrowed view over a serialized composite term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositeTermRef<'a> {
    bytes: &'a [u8],
}

impl<'a> CompositeTermRef<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        CompositeTermRef { bytes }
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Split into element slices without copying.
    pub fn elements(&self) -> Result<Vec<&'a [u8]>, DecodeError> {
        let (&count, mut rest) = self.bytes.split_first().ok_or(DecodeError::UnexpectedEnd)?;
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if rest.len() < 4 {
                return Err(DecodeError::UnexpectedEnd);
            }
            let (len, tail) = rest.split_at(4);
            let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
            if tail.len() < len {
                return Err(DecodeError::UnexpectedEnd);
            }
            let (element, tail) = tail.split_at(len);
            out.push(element);
            rest = tail;
        }
        if !rest.is_empty() {
            return Err(DecodeError::Malformed(format!(
                "{} trailing bytes after composite term",
                rest.len()
            )));
        }
        Ok(out)
    }

    pub fn decode(&self) -> Result<Vec<IndexTerm>, DecodeError> {
        self.elements()?
            .into_iter()
            .map(IndexTerm::deserialize)
            .collect()
    }

    pub fn any_truncated(&self) -> Result<bool, DecodeError> {
        Ok(self.elements()?.iter().any(|e| is_serialized_truncated(e)))
    }

    /// A single-element composite holding a root metadata term.
    pub fn is_root_metadata(&self) -> Result<bool, DecodeError> {
        let elements = self.elements()?;
        Ok(elements.len() == 1 && is_serialized_metadata(elements[0]))
    }
}

#[cfg(test)]
mod tests {
    use bson::Bson;

    use super::*;
    use crate::term::RootMetadata;

    #[test]
    fn splits_without_copying() {
        let a = IndexTerm::new("", Bson::Int32(1)).serialize();
        let b = IndexTerm::new("", Bson::String("z".into())).serialize();
        let composite = serialize_composite(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(composite[0], 2);

        let view = CompositeTermRef::new(&composite);
        let elements = view.elements().unwrap();
        assert_eq!(elements, vec![a.as_slice(), b.as_slice()]);
        assert!(std::ptr::eq(elements[0].as_ptr(), composite[5..].as_ptr()));
        assert!(!view.any_truncated().unwrap());
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(
            CompositeTermRef::new(&[]).elements(),
            Err(DecodeError::UnexpectedEnd)
        );
        assert_eq!(
            CompositeTermRef::new(&[1, 0, 0, 0, 9, 1]).elements(),
            Err(DecodeError::UnexpectedEnd)
        );
        let too_many: Vec<Vec<u8>> = vec![vec![]; 256];
        assert_eq!(
            serialize_composite(&too_many),
            Err(TermError::TooManyElements(256))
        );
    }

    #[test]
    fn root_metadata_composites() {
        let root = IndexTerm::root(RootMetadata::MultiKey).serialize();
        let composite = serialize_composite(&[root]).unwrap();
        assert!(CompositeTermRef::new(&composite).is_root_metadata().unwrap());
    }
}

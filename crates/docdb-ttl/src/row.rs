//! Shard table rows hold one BSON document each.

use bson::Document;
use bson::raw::{RawDocument, RawDocumentBuf};

use crate::error::TtlError;

pub fn encode(doc: &Document) -> Result<Vec<u8>, TtlError> {
    let raw = RawDocumentBuf::try_from(doc).map_err(|e| TtlError::Encode(e.to_string()))?;
    Ok(raw.into_bytes())
}

pub fn decode(key: &[u8], bytes: &[u8]) -> Result<Document, TtlError> {
    let corrupt = |message: String| TtlError::Decode {
        key: key.to_vec(),
        message,
    };
    let raw = RawDocument::from_bytes(bytes).map_err(|e| corrupt(e.to_string()))?;
    Document::try_from(raw).map_err(|e| corrupt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[test]
    fn rows_hold_documents() {
        let doc = doc! { "_id": 1, "at": bson::DateTime::from_millis(5) };
        let bytes = encode(&doc).unwrap();
        assert_eq!(decode(b"k", &bytes).unwrap(), doc);
    }

    #[test]
    fn garbage_names_its_key() {
        let err = decode(b"k1", b"\x01\x02").unwrap_err();
        assert!(matches!(err, TtlError::Decode { ref key, .. } if key == b"k1"));
    }
}

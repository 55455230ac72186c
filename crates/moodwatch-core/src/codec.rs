//! Fixed-width binary encoding for embeddings.
//!
//! Layout: `[format: u8][dim: u32 LE][dim values]`. The only format
//! currently written is [`FORMAT_F32_LE`].

use crate::types::Embedding;
use thiserror::Error;

/// Little-endian IEEE-754 single precision values.
pub const FORMAT_F32_LE: u8 = 0x01;

const HEADER_LEN: usize = 5;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("embedding blob too short: {0} bytes")]
    Truncated(usize),
    #[error("unsupported embedding format tag: {0:#04x}")]
    UnsupportedFormat(u8),
    #[error("embedding blob length mismatch: header says {dim} values, payload has {actual} bytes")]
    LengthMismatch { dim: usize, actual: usize },
}

/// Serialize an embedding.
pub fn encode(embedding: &Embedding) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + embedding.values.len() * 4);
    out.push(FORMAT_F32_LE);
    out.extend_from_slice(&(embedding.values.len() as u32).to_le_bytes());
    for v in &embedding.values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Deserialize an embedding produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<Embedding, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated(bytes.len()));
    }
    if bytes[0] != FORMAT_F32_LE {
        return Err(CodecError::UnsupportedFormat(bytes[0]));
    }

    let dim = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    let payload = &bytes[HEADER_LEN..];
    if payload.len() != dim * 4 {
        return Err(CodecError::LengthMismatch {
            dim,
            actual: payload.len(),
        });
    }

    let values = payload
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(Embedding { values })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let bytes = encode(&Embedding::new(vec![1.0, -2.5]));
        assert_eq!(bytes.len(), 5 + 8);
        assert_eq!(bytes[0], FORMAT_F32_LE);
        assert_eq!(&bytes[1..5], &2u32.to_le_bytes());
        assert_eq!(&bytes[5..9], &1.0f32.to_le_bytes());
        assert_eq!(decode(&bytes).unwrap().values, vec![1.0, -2.5]);
    }

    #[test]
    fn test_empty_embedding() {
        let bytes = encode(&Embedding::new(vec![]));
        assert_eq!(bytes, vec![FORMAT_F32_LE, 0, 0, 0, 0]);
        assert!(decode(&bytes).unwrap().values.is_empty());
    }

    #[test]
    fn test_rejects_bad_input() {
        assert_eq!(decode(&[1, 0]), Err(CodecError::Truncated(2)));
        assert_eq!(decode(&[9, 0, 0, 0, 0]), Err(CodecError::UnsupportedFormat(9)));
        let mut bytes = encode(&Embedding::new(vec![1.0, 2.0]));
        bytes.pop();
        assert_eq!(
            decode(&bytes),
            Err(CodecError::LengthMismatch { dim: 2, actual: 7 })
        );
    }
}

//! Face descriptor type and its text codec.
//!
//! A descriptor is the 128-dimensional identity vector the recognition model
//! produces for one face. For storage and transport it is serialized as the
//! raw little-endian f32 bytes, base64-encoded — byte-exact on round-trip,
//! unlike a decimal rendering of the floats.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dimension of a descriptor as produced by the recognition model.
pub const DESCRIPTOR_LEN: usize = 128;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("descriptor is empty")]
    Empty,
    #[error("descriptor contains no finite values")]
    NoFiniteValues,
    #[error("invalid descriptor encoding: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),
    #[error("decoded descriptor payload is {0} bytes, not a multiple of 4")]
    TruncatedPayload(usize),
    #[error("descriptor dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
}

/// A face's identity signature. Immutable once produced — re-enrollment
/// replaces the stored encoding wholesale, never edits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDescriptor {
    values: Vec<f32>,
}

impl FaceDescriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Copy with every non-finite element replaced by 0.0. Applied before
    /// any comparison or persistence.
    pub fn sanitized(&self) -> Self {
        Self {
            values: self
                .values
                .iter()
                .map(|v| if v.is_finite() { *v } else { 0.0 })
                .collect(),
        }
    }

    /// True when the descriptor carries no signal at all: empty, or every
    /// element sanitizes to zero. Blank descriptors are treated as absent
    /// and skipped, never matched against.
    pub fn is_blank(&self) -> bool {
        self.values.is_empty() || self.values.iter().all(|v| !v.is_finite() || *v == 0.0)
    }
}

/// Serialize a descriptor to its transportable text form.
///
/// Fails on an empty descriptor and on one with no finite elements; callers
/// at the enrollment boundary must treat either as a failed capture rather
/// than persisting a zeroed gallery entry.
pub fn encode(descriptor: &FaceDescriptor) -> Result<String, CodecError> {
    if descriptor.is_empty() {
        return Err(CodecError::Empty);
    }
    if !descriptor.values.iter().any(|v| v.is_finite()) {
        return Err(CodecError::NoFiniteValues);
    }

    let sane = descriptor.sanitized();
    let mut bytes = Vec::with_capacity(sane.values.len() * 4);
    for v in &sane.values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    Ok(BASE64.encode(bytes))
}

/// Exact inverse of [`encode`].
pub fn decode(text: &str) -> Result<FaceDescriptor, CodecError> {
    let bytes = BASE64.decode(text)?;
    if bytes.len() % 4 != 0 {
        return Err(CodecError::TruncatedPayload(bytes.len()));
    }

    let values = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(FaceDescriptor { values })
}

/// Euclidean distance between two descriptors of equal dimension.
pub fn distance(a: &FaceDescriptor, b: &FaceDescriptor) -> Result<f32, CodecError> {
    if a.len() != b.len() {
        return Err(CodecError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    let sum: f32 = a
        .values
        .iter()
        .zip(b.values.iter())
        .map(|(x, y)| {
            let x = if x.is_finite() { *x } else { 0.0 };
            let y = if y.is_finite() { *y } else { 0.0 };
            (x - y).powi(2)
        })
        .sum();
    Ok(sum.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor_of(values: Vec<f32>) -> FaceDescriptor {
        FaceDescriptor::new(values)
    }

    #[test]
    fn test_round_trip_exact() {
        let values: Vec<f32> = (0..DESCRIPTOR_LEN)
            .map(|i| (i as f32 - 64.0) * 0.037)
            .collect();
        let d = descriptor_of(values.clone());
        let decoded = decode(&encode(&d).unwrap()).unwrap();
        // Byte-exact, not approximately equal
        assert_eq!(decoded.values(), values.as_slice());
    }

    #[test]
    fn test_round_trip_awkward_floats() {
        let d = descriptor_of(vec![0.1, -0.3, 1e-30, f32::MIN_POSITIVE, -0.0, 1234.5678]);
        let decoded = decode(&encode(&d).unwrap()).unwrap();
        for (a, b) in decoded.values().iter().zip(d.values()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_encode_empty_fails() {
        let d = descriptor_of(vec![]);
        assert!(matches!(encode(&d), Err(CodecError::Empty)));
    }

    #[test]
    fn test_encode_all_nonfinite_fails() {
        let d = descriptor_of(vec![f32::NAN, f32::INFINITY, f32::NEG_INFINITY]);
        assert!(matches!(encode(&d), Err(CodecError::NoFiniteValues)));
    }

    #[test]
    fn test_encode_sanitizes_mixed_nonfinite() {
        let d = descriptor_of(vec![1.0, f32::NAN, 3.0]);
        let decoded = decode(&encode(&d).unwrap()).unwrap();
        assert_eq!(decoded.values(), &[1.0, 0.0, 3.0]);
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        assert!(matches!(
            decode("not!!valid@@base64"),
            Err(CodecError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        // 6 raw bytes — valid base64, not a whole number of f32s
        let text = BASE64.encode([1u8, 2, 3, 4, 5, 6]);
        assert!(matches!(decode(&text), Err(CodecError::TruncatedPayload(6))));
    }

    #[test]
    fn test_encoded_size_fixed() {
        let d = descriptor_of(vec![0.5; DESCRIPTOR_LEN]);
        // 512 payload bytes → 684 base64 characters, deterministic
        assert_eq!(encode(&d).unwrap().len(), 684);
    }

    #[test]
    fn test_distance_symmetry_and_zero() {
        let a = descriptor_of(vec![1.0, 2.0, 3.0]);
        let b = descriptor_of(vec![4.0, 6.0, 3.0]);
        assert_eq!(distance(&a, &b).unwrap(), distance(&b, &a).unwrap());
        assert_eq!(distance(&a, &a).unwrap(), 0.0);
        assert!((distance(&a, &b).unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_dimension_mismatch() {
        let a = descriptor_of(vec![1.0, 2.0]);
        let b = descriptor_of(vec![1.0, 2.0, 3.0]);
        assert!(matches!(
            distance(&a, &b),
            Err(CodecError::DimensionMismatch { left: 2, right: 3 })
        ));
    }

    #[test]
    fn test_is_blank() {
        assert!(descriptor_of(vec![]).is_blank());
        assert!(descriptor_of(vec![0.0; 4]).is_blank());
        assert!(descriptor_of(vec![f32::NAN, 0.0]).is_blank());
        assert!(!descriptor_of(vec![0.0, 0.01]).is_blank());
    }
}

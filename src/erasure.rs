//! Erasure Coding Module
//!
//! This module provides the fragment parameter policy and the systematic
//! Reed-Solomon encode/decode paths. A file is split into `m` fragments such
//! that any `k` of them reconstruct the original; `(k, m)` is derived from
//! the size of the eligible target pool, not chosen per call.

use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on total fragments imposed by the GF(256) code.
pub const MAX_TOTAL_FRAGMENTS: usize = 255;

/// Errors that can occur during erasure coding operations
#[derive(Error, Debug)]
pub enum ErasureError {
    #[error("invalid erasure parameters: k={k}, m={m}")]
    InvalidParameters { k: usize, m: usize },

    #[error("cannot derive parameters from an empty target pool")]
    EmptyTargetPool,

    #[error("insufficient fragments: need {needed}, have {available}")]
    InsufficientFragments { needed: usize, available: usize },

    #[error("fragment index {index} out of range for m={total}")]
    FragmentIndexOutOfRange { index: usize, total: usize },

    #[error("fragment size mismatch: expected {expected} bytes, found {found}")]
    FragmentSizeMismatch { expected: usize, found: usize },

    #[error("malformed reconstruction metadata: {reason}")]
    Padding { reason: String },

    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    #[error("Reed-Solomon error: {0}")]
    ReedSolomon(#[from] reed_solomon_erasure::Error),
}

/// Erasure parameters for one file: any `k` of `m` fragments reconstruct it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureParams {
    pub k: usize,
    pub m: usize,
}

impl ErasureParams {
    pub fn new(k: usize, m: usize) -> Result<Self, ErasureError> {
        if k == 0 || k > m || m > MAX_TOTAL_FRAGMENTS {
            return Err(ErasureError::InvalidParameters { k, m });
        }
        Ok(ErasureParams { k, m })
    }

    /// Number of parity fragments.
    pub fn parity(&self) -> usize {
        self.m - self.k
    }
}

/// Reconstruction metadata persisted once per file alongside the mapping.
///
/// This record is not erasure-coded itself; losing it is fatal to the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureMeta {
    pub original_size: u64,
    pub padding_size: u64,
    pub k: usize,
    pub m: usize,
}

impl ErasureMeta {
    pub fn params(&self) -> Result<ErasureParams, ErasureError> {
        ErasureParams::new(self.k, self.m)
    }

    /// Size of every fragment, derived from the padded length.
    fn fragment_size(&self) -> Result<usize, ErasureError> {
        let params = self.params()?;
        if params.k == 1 && self.padding_size != 0 {
            return Err(ErasureError::Padding {
                reason: format!("full-copy metadata declares padding {}", self.padding_size),
            });
        }
        if params.k > 1 && self.padding_size >= params.k as u64 {
            return Err(ErasureError::Padding {
                reason: format!("padding {} is not below k={}", self.padding_size, params.k),
            });
        }
        let padded = self.original_size + self.padding_size;
        if padded % params.k as u64 != 0 {
            return Err(ErasureError::Padding {
                reason: format!(
                    "padded length {} is not a multiple of k={}",
                    padded, params.k
                ),
            });
        }
        Ok((padded / params.k as u64) as usize)
    }
}

/// Derive `(k, m)` from the eligible target pool size.
///
/// `n = connected_peers + extra_cloud_targets`. Pools of up to three targets
/// get full copies (`k = 1`); larger pools get `k = n` data fragments plus
/// `n/2` parity below ten targets and `ceil(sqrt(n)) + 1` parity from ten up.
pub fn choose_parameters(
    connected_peers: usize,
    extra_cloud_targets: usize,
) -> Result<ErasureParams, ErasureError> {
    let n = connected_peers + extra_cloud_targets;
    if n == 0 {
        return Err(ErasureError::EmptyTargetPool);
    }
    if n <= 3 {
        return ErasureParams::new(1, n);
    }
    let parity = if n < 10 {
        n / 2
    } else {
        (n as f64).sqrt().ceil() as usize + 1
    };
    ErasureParams::new(n, n + parity)
}

/// Encode a blob into `m` fragments.
///
/// The blob is zero-padded to a multiple of `k`, split into `k` data
/// fragments, and extended with `m - k` parity fragments. `k = 1` is the
/// full-copy path: every fragment is a complete copy of the blob.
pub fn encode(
    blob: &[u8],
    params: ErasureParams,
) -> Result<(Vec<Vec<u8>>, ErasureMeta), ErasureError> {
    let ErasureParams { k, m } = params;

    if k == 1 {
        let meta = ErasureMeta {
            original_size: blob.len() as u64,
            padding_size: 0,
            k,
            m,
        };
        return Ok((vec![blob.to_vec(); m], meta));
    }

    let padding = (k - blob.len() % k) % k;
    let fragment_size = (blob.len() + padding) / k;
    let meta = ErasureMeta {
        original_size: blob.len() as u64,
        padding_size: padding as u64,
        k,
        m,
    };

    // A zero-length blob has nothing to spread; every fragment is empty.
    if fragment_size == 0 {
        return Ok((vec![Vec::new(); m], meta));
    }

    let mut padded = blob.to_vec();
    padded.resize(blob.len() + padding, 0);

    let mut fragments: Vec<Vec<u8>> = Vec::with_capacity(m);
    for i in 0..k {
        fragments.push(padded[i * fragment_size..(i + 1) * fragment_size].to_vec());
    }
    for _ in k..m {
        fragments.push(vec![0u8; fragment_size]);
    }

    let rs = ReedSolomon::new(k, m - k)?;
    rs.encode(&mut fragments)?;

    Ok((fragments, meta))
}

/// Reconstruct the original blob from at least `k` distinct fragments.
///
/// Fragments may arrive in any order; exactly the first `k` distinct indices
/// are used and the rest are ignored. The result is trimmed back to
/// `original_size`.
pub fn decode(
    fragments: Vec<(usize, Vec<u8>)>,
    meta: &ErasureMeta,
) -> Result<Vec<u8>, ErasureError> {
    let params = meta.params()?;
    let ErasureParams { k, m } = params;
    let fragment_size = meta.fragment_size()?;

    let mut slots: Vec<Option<Vec<u8>>> = vec![None; m];
    let mut distinct = 0;
    for (index, bytes) in fragments {
        if index >= m {
            return Err(ErasureError::FragmentIndexOutOfRange { index, total: m });
        }
        if slots[index].is_none() {
            slots[index] = Some(bytes);
            distinct += 1;
            if distinct == k {
                break;
            }
        }
    }
    if distinct < k {
        return Err(ErasureError::InsufficientFragments {
            needed: k,
            available: distinct,
        });
    }

    if k == 1 {
        let blob = slots
            .into_iter()
            .flatten()
            .next()
            .ok_or_else(|| ErasureError::DataCorruption("no fragment selected".to_string()))?;
        if blob.len() as u64 != meta.original_size {
            return Err(ErasureError::FragmentSizeMismatch {
                expected: meta.original_size as usize,
                found: blob.len(),
            });
        }
        return Ok(blob);
    }

    if fragment_size == 0 {
        return Ok(Vec::new());
    }

    for slot in slots.iter().flatten() {
        if slot.len() != fragment_size {
            return Err(ErasureError::FragmentSizeMismatch {
                expected: fragment_size,
                found: slot.len(),
            });
        }
    }

    let rs = ReedSolomon::new(k, m - k)?;
    rs.reconstruct(&mut slots)?;

    let mut blob = Vec::with_capacity(k * fragment_size);
    for slot in slots.iter().take(k) {
        match slot {
            Some(bytes) => blob.extend_from_slice(bytes),
            None => {
                return Err(ErasureError::DataCorruption(
                    "reconstruction left a data fragment empty".to_string(),
                ))
            }
        }
    }
    blob.truncate(meta.original_size as usize);
    Ok(blob)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// All index subsets of size `k` drawn from `0..m`.
    fn k_subsets(k: usize, m: usize) -> Vec<Vec<usize>> {
        let mut subsets = Vec::new();
        for mask in 0u32..(1 << m) {
            if mask.count_ones() as usize == k {
                subsets.push((0..m).filter(|i| mask & (1 << i) != 0).collect());
            }
        }
        subsets
    }

    fn roundtrip_all_subsets(blob: &[u8], k: usize, m: usize) {
        let params = ErasureParams::new(k, m).unwrap();
        let (fragments, meta) = encode(blob, params).unwrap();
        assert_eq!(fragments.len(), m);

        for subset in k_subsets(k, m) {
            let supplied: Vec<(usize, Vec<u8>)> =
                subset.iter().map(|&i| (i, fragments[i].clone())).collect();
            let decoded = decode(supplied, &meta).unwrap();
            assert_eq!(decoded, blob, "subset {:?} failed", subset);
        }
    }

    #[test]
    fn test_parameter_policy_bands() {
        assert_eq!(choose_parameters(1, 0).unwrap(), ErasureParams { k: 1, m: 1 });
        assert_eq!(choose_parameters(2, 0).unwrap(), ErasureParams { k: 1, m: 2 });
        assert_eq!(choose_parameters(3, 0).unwrap(), ErasureParams { k: 1, m: 3 });
        assert_eq!(choose_parameters(4, 0).unwrap(), ErasureParams { k: 4, m: 6 });
        assert_eq!(choose_parameters(5, 0).unwrap(), ErasureParams { k: 5, m: 7 });
        assert_eq!(choose_parameters(9, 0).unwrap(), ErasureParams { k: 9, m: 13 });
        assert_eq!(
            choose_parameters(10, 0).unwrap(),
            ErasureParams { k: 10, m: 15 }
        );
        assert_eq!(
            choose_parameters(16, 0).unwrap(),
            ErasureParams { k: 16, m: 21 }
        );
    }

    #[test]
    fn test_parameter_policy_counts_cloud_targets() {
        // One peer plus two cloud targets still lands in full-copy mode.
        assert_eq!(choose_parameters(1, 2).unwrap(), ErasureParams { k: 1, m: 3 });
        // Three peers plus two clouds crosses into coded mode.
        assert_eq!(choose_parameters(3, 2).unwrap(), ErasureParams { k: 5, m: 7 });
    }

    #[test]
    fn test_parameter_policy_edge_cases() {
        assert!(matches!(
            choose_parameters(0, 0),
            Err(ErasureError::EmptyTargetPool)
        ));
        // Pools large enough to exceed the shard bound are rejected.
        assert!(choose_parameters(240, 0).is_err());
    }

    #[test]
    fn test_params_validation() {
        assert!(ErasureParams::new(0, 3).is_err());
        assert!(ErasureParams::new(4, 3).is_err());
        assert!(ErasureParams::new(1, MAX_TOTAL_FRAGMENTS + 1).is_err());
        assert!(ErasureParams::new(1, 1).is_ok());
    }

    #[test]
    fn test_full_copy_roundtrip() {
        roundtrip_all_subsets(b"full copy payload", 1, 3);
    }

    #[test]
    fn test_coded_roundtrip_every_subset() {
        let blob: Vec<u8> = (0u16..1000).map(|i| (i % 251) as u8).collect();
        roundtrip_all_subsets(&blob, 4, 6);
    }

    #[test]
    fn test_roundtrip_non_multiple_of_k() {
        // 1003 bytes across k=4 forces a non-zero padding.
        let blob: Vec<u8> = (0u16..1003).map(|i| (i % 7) as u8).collect();
        let params = ErasureParams::new(4, 6).unwrap();
        let (_, meta) = encode(&blob, params).unwrap();
        assert_eq!(meta.padding_size, 1);
        roundtrip_all_subsets(&blob, 4, 6);
    }

    #[test]
    fn test_roundtrip_zero_length() {
        roundtrip_all_subsets(b"", 1, 2);
        roundtrip_all_subsets(b"", 4, 6);
    }

    #[test]
    fn test_decode_tolerates_arrival_order_and_excess() {
        let blob = b"order independence".to_vec();
        let params = ErasureParams::new(4, 6).unwrap();
        let (fragments, meta) = encode(&blob, params).unwrap();

        // Reverse order, all six supplied; only the first four distinct are used.
        let supplied: Vec<(usize, Vec<u8>)> =
            (0..6).rev().map(|i| (i, fragments[i].clone())).collect();
        assert_eq!(decode(supplied, &meta).unwrap(), blob);
    }

    #[test]
    fn test_decode_duplicate_indices_do_not_count() {
        let blob = b"duplicates".to_vec();
        let params = ErasureParams::new(4, 6).unwrap();
        let (fragments, meta) = encode(&blob, params).unwrap();

        let supplied = vec![
            (0, fragments[0].clone()),
            (0, fragments[0].clone()),
            (1, fragments[1].clone()),
            (2, fragments[2].clone()),
        ];
        let result = decode(supplied, &meta);
        assert!(matches!(
            result,
            Err(ErasureError::InsufficientFragments {
                needed: 4,
                available: 3
            })
        ));
    }

    #[test]
    fn test_decode_insufficient_fragments() {
        let params = ErasureParams::new(4, 6).unwrap();
        let (fragments, meta) = encode(b"not enough", params).unwrap();

        let supplied: Vec<(usize, Vec<u8>)> =
            (0..3).map(|i| (i, fragments[i].clone())).collect();
        assert!(matches!(
            decode(supplied, &meta),
            Err(ErasureError::InsufficientFragments { .. })
        ));
    }

    #[test]
    fn test_decode_index_out_of_range() {
        let params = ErasureParams::new(1, 2).unwrap();
        let (fragments, meta) = encode(b"range", params).unwrap();

        let supplied = vec![(5, fragments[0].clone())];
        assert!(matches!(
            decode(supplied, &meta),
            Err(ErasureError::FragmentIndexOutOfRange { index: 5, total: 2 })
        ));
    }

    #[test]
    fn test_decode_fragment_size_mismatch() {
        let params = ErasureParams::new(4, 6).unwrap();
        let (mut fragments, meta) = encode(&vec![9u8; 400], params).unwrap();
        fragments[1].pop();

        let supplied: Vec<(usize, Vec<u8>)> =
            (0..4).map(|i| (i, fragments[i].clone())).collect();
        assert!(matches!(
            decode(supplied, &meta),
            Err(ErasureError::FragmentSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_malformed_metadata() {
        let params = ErasureParams::new(4, 6).unwrap();
        let (fragments, meta) = encode(&vec![1u8; 64], params).unwrap();
        let supplied: Vec<(usize, Vec<u8>)> =
            (0..4).map(|i| (i, fragments[i].clone())).collect();

        let bad_padding = ErasureMeta {
            padding_size: 7,
            ..meta
        };
        assert!(matches!(
            decode(supplied.clone(), &bad_padding),
            Err(ErasureError::Padding { .. })
        ));

        let bad_params = ErasureMeta { k: 0, ..meta };
        assert!(matches!(
            decode(supplied, &bad_params),
            Err(ErasureError::InvalidParameters { .. })
        ));
    }

    #[test]
    fn test_full_copy_decode_checks_size() {
        let params = ErasureParams::new(1, 2).unwrap();
        let (fragments, meta) = encode(b"sized", params).unwrap();

        let mut truncated = fragments[0].clone();
        truncated.pop();
        assert!(matches!(
            decode(vec![(0, truncated)], &meta),
            Err(ErasureError::FragmentSizeMismatch { .. })
        ));
    }
}

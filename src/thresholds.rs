//! Per-run scoring thresholds
//!
//! Consumed read-only by the scorer and the threshold checks. Two presets
//! exist: [`ScoreThresholds::default`] for binning reads against
//! references, and [`ScoreThresholds::read_vs_read`] for comparing reads to
//! a best read or a consensus.

use crate::error::{ClusterError, Result};

/// Slot in the four-entry homopolymer tables. T and U share a slot.
pub fn base_index(base: u8) -> Option<usize> {
    match base.to_ascii_uppercase() {
        b'A' => Some(0),
        b'C' => Some(1),
        b'G' => Some(2),
        b'T' | b'U' => Some(3),
        _ => None,
    }
}

/// True when two bases have the same identity (case-insensitive, T == U)
#[inline]
pub fn same_base(a: u8, b: u8) -> bool {
    match (base_index(a), base_index(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a.eq_ignore_ascii_case(&b),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreThresholds {
    /// Minimum mapping quality
    pub min_mapq: u8,
    /// Minimum read length (bases, soft clips included)
    pub min_read_len: usize,
    /// Maximum read length
    pub max_read_len: usize,
    /// Minimum median Q over the whole read
    pub min_median_q: f32,
    /// Minimum mean Q over the whole read
    pub min_mean_q: f32,
    /// Minimum median Q over the aligned region
    pub min_aligned_median_q: f32,
    /// Minimum mean Q over the aligned region
    pub min_aligned_mean_q: f32,
    /// Minimum base quality to keep a match or SNP
    pub min_snp_q: u8,
    /// Minimum base quality to keep an insertion
    pub min_ins_q: u8,
    /// Longest homopolymer (A, C, G, T/U) an insertion may extend and still be kept
    pub max_homo_ins: [u8; 4],
    /// Longest flanking homopolymer (A, C, G, T/U) a deletion may sit in and still be kept
    pub max_homo_del: [u8; 4],
    /// Minimum kept matches / kept events
    pub min_identity: f32,
    /// Maximum kept SNPs / aligned length
    pub max_snp_rate: f32,
    /// Maximum kept insertions / aligned length
    pub max_ins_rate: f32,
    /// Maximum kept deletions / aligned length
    pub max_del_rate: f32,
    /// Discard reverse-strand records instead of scoring and flagging them
    pub reject_reverse_strand: bool,
}

impl Default for ScoreThresholds {
    fn default() -> Self {
        Self {
            min_mapq: 15,
            min_read_len: 200,
            max_read_len: 100_000,
            min_median_q: 7.0,
            min_mean_q: 7.0,
            min_aligned_median_q: 7.0,
            min_aligned_mean_q: 7.0,
            min_snp_q: 7,
            min_ins_q: 7,
            max_homo_ins: [1, 1, 1, 1],
            max_homo_del: [1, 1, 1, 1],
            min_identity: 0.0,
            max_snp_rate: 1.0,
            max_ins_rate: 1.0,
            max_del_rate: 1.0,
            reject_reverse_strand: false,
        }
    }
}

impl ScoreThresholds {
    /// Thresholds for a read aligned to another read or to a consensus.
    ///
    /// Mapping quality is left to the composite score, identity carries the
    /// decision.
    pub fn read_vs_read() -> Self {
        Self {
            min_mapq: 0,
            min_identity: 0.9,
            max_snp_rate: 0.07,
            max_ins_rate: 0.05,
            max_del_rate: 0.05,
            ..Self::default()
        }
    }

    /// Insertion homopolymer limit for `base`, `None` for non-ACGTU bases
    #[inline]
    pub fn max_homo_ins_for(&self, base: u8) -> Option<usize> {
        base_index(base).map(|i| self.max_homo_ins[i] as usize)
    }

    /// Deletion homopolymer limit for `base`, `None` for non-ACGTU bases
    #[inline]
    pub fn max_homo_del_for(&self, base: u8) -> Option<usize> {
        base_index(base).map(|i| self.max_homo_del[i] as usize)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_read_len > self.max_read_len {
            return Err(ClusterError::InvalidThresholds(format!(
                "min read length {} exceeds max read length {}",
                self.min_read_len, self.max_read_len
            )));
        }

        let rates = [
            ("min identity", self.min_identity),
            ("max SNP rate", self.max_snp_rate),
            ("max insertion rate", self.max_ins_rate),
            ("max deletion rate", self.max_del_rate),
        ];
        for (name, value) in rates {
            if !(0.0..=1.0).contains(&value) {
                return Err(ClusterError::InvalidThresholds(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }

        let q_floors = [
            self.min_median_q,
            self.min_mean_q,
            self.min_aligned_median_q,
            self.min_aligned_mean_q,
        ];
        if q_floors.iter().any(|q| *q < 0.0 || q.is_nan()) {
            return Err(ClusterError::InvalidThresholds(
                "Q-score floors must be non-negative".to_string(),
            ));
        }

        Ok(())
    }
}

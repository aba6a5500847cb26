//! CIGAR-walking alignment scorer
//!
//! Walks one record's CIGAR left to right and fills its [`ReadStats`]:
//! total/kept tallies for matches, SNPs, insertions and deletions, plus
//! mean/median Q over the whole read and over the aligned region.
//!
//! ## Keep rules
//! - `=`/`X`: kept when the base quality is at least `min_snp_q` and, when a
//!   reference with qualities is in use, the reference base also is.
//! - `I`: bases under `min_ins_q` are dropped without homopolymer
//!   evaluation. Otherwise the homopolymer containing the inserted base is
//!   measured on the query; the insertion is dropped when the run minus the
//!   inserted base is longer than `max_homo_ins`.
//! - `D` with a reference: the deleted reference base goes through the
//!   insertion rule on the reference sequence (a deletion in the read is an
//!   insertion in the reference), limited by `max_homo_del`.
//! - `D` without a reference: the homopolymers flanking the deletion point
//!   on the query are measured; the longer side counts, or both sides when
//!   the two flanking bases match. Dropped when that run exceeds `max_homo_del`.
//! - `S`: skipped.
//!
//! Without a quality string every quality-dependent test passes.
//!
//! Quality characters are converted by truncation (`char - 33`); the
//! histogram is indexed by that integer.

use crate::alignment::{AlignmentRecord, CigarOp, ReadStats, PHRED_OFFSET};
use crate::error::{ClusterError, Result};
use crate::thresholds::{same_base, ScoreThresholds};

/// Histogram width: Phred 0 ('!') through 93 ('~')
pub const Q_BINS: usize = 94;

/// Truncating Phred+33 conversion, clamped into the histogram
#[inline]
pub fn phred(c: u8) -> u8 {
    c.saturating_sub(PHRED_OFFSET).min((Q_BINS - 1) as u8)
}

/// Fixed-width Q-score histogram with a running sum
#[derive(Debug, Clone)]
pub struct QHistogram {
    counts: [u32; Q_BINS],
    sum: u64,
    n: usize,
}

impl Default for QHistogram {
    fn default() -> Self {
        Self {
            counts: [0; Q_BINS],
            sum: 0,
            n: 0,
        }
    }
}

impl QHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&mut self, q: u8) {
        let q = (q as usize).min(Q_BINS - 1);
        self.counts[q] += 1;
        self.sum += q as u64;
        self.n += 1;
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn mean(&self) -> f32 {
        if self.n == 0 {
            return 0.0;
        }
        self.sum as f32 / self.n as f32
    }

    /// Q value at 0-based `rank` in sorted order
    fn value_at(&self, rank: usize) -> usize {
        let mut seen = 0usize;
        for (q, &count) in self.counts.iter().enumerate() {
            seen += count as usize;
            if seen > rank {
                return q;
            }
        }
        Q_BINS - 1
    }

    /// Median by a linear scan to the midpoint rank; for an even count the
    /// two middle values are averaged.
    pub fn median(&self) -> f32 {
        if self.n == 0 {
            return 0.0;
        }
        let mid = self.n / 2;
        if self.n % 2 == 1 {
            self.value_at(mid) as f32
        } else {
            (self.value_at(mid - 1) + self.value_at(mid)) as f32 / 2.0
        }
    }
}

/// Sequence a read is scored against when it was aligned to another read
/// or a consensus rather than to a plain reference.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceView<'a> {
    pub seq: &'a [u8],
    /// Phred+33 qualities; `None` when the reference has none
    pub qual: Option<&'a [u8]>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreOptions<'a> {
    pub reference: Option<ReferenceView<'a>>,
    /// Only consult the reference for deletions; matches ignore its qualities
    pub deletions_only: bool,
}

impl<'a> ScoreOptions<'a> {
    pub fn against(reference: ReferenceView<'a>) -> Self {
        Self {
            reference: Some(reference),
            deletions_only: false,
        }
    }
}

/// Why a read was routed to discard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscardReason {
    Unmapped,
    Secondary,
    Supplementary,
    ReverseStrand,
    MissingSequence,
    LowMapq,
    ReadLength,
    MedianQ,
    MeanQ,
    AlignedMedianQ,
    AlignedMeanQ,
    Identity,
    SnpRate,
    InsertionRate,
    DeletionRate,
    DuplicateQuery,
}

impl DiscardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unmapped => "unmapped",
            Self::Secondary => "secondary",
            Self::Supplementary => "supplementary",
            Self::ReverseStrand => "reverse_strand",
            Self::MissingSequence => "missing_sequence",
            Self::LowMapq => "low_mapq",
            Self::ReadLength => "read_length",
            Self::MedianQ => "median_q",
            Self::MeanQ => "mean_q",
            Self::AlignedMedianQ => "aligned_median_q",
            Self::AlignedMeanQ => "aligned_mean_q",
            Self::Identity => "identity",
            Self::SnpRate => "snp_rate",
            Self::InsertionRate => "insertion_rate",
            Self::DeletionRate => "deletion_rate",
            Self::DuplicateQuery => "duplicate_query",
        }
    }
}

/// Classification result. Not an error: discarded reads are routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreOutcome {
    Keep,
    Discard(DiscardReason),
}

impl ScoreOutcome {
    pub fn is_keep(&self) -> bool {
        matches!(self, Self::Keep)
    }
}

/// Length of the homopolymer containing `pos`, case-insensitive, T == U
fn homopolymer_run(seq: &[u8], pos: usize) -> usize {
    let base = seq[pos];
    let back = seq[..pos]
        .iter()
        .rev()
        .take_while(|&&b| same_base(b, base))
        .count();
    let forward = seq[pos + 1..]
        .iter()
        .take_while(|&&b| same_base(b, base))
        .count();
    1 + back + forward
}

/// Insertion rule, shared by query insertions and reference-side deletions
fn insertion_kept(
    seq: &[u8],
    qual: Option<&[u8]>,
    pos: usize,
    min_q: u8,
    max_homo: impl Fn(u8) -> Option<usize>,
) -> bool {
    if let Some(qual) = qual {
        if phred(qual[pos]) < min_q {
            return false;
        }
    }
    match max_homo(seq[pos]) {
        Some(limit) => homopolymer_run(seq, pos) - 1 <= limit,
        None => false,
    }
}

/// Deletion rule without a reference: measure the query homopolymers on
/// either side of the deletion point.
fn flanking_deletion_kept(seq: &[u8], qpos: usize, thresholds: &ScoreThresholds) -> bool {
    let left = (qpos > 0).then(|| qpos - 1);
    let right = (qpos < seq.len()).then_some(qpos);

    let left_run = |i: usize| {
        seq[..=i]
            .iter()
            .rev()
            .take_while(|&&b| same_base(b, seq[i]))
            .count()
    };
    let right_run = |i: usize| {
        seq[i..]
            .iter()
            .take_while(|&&b| same_base(b, seq[i]))
            .count()
    };

    let (run, base) = match (left, right) {
        (Some(l), Some(r)) if same_base(seq[l], seq[r]) => (left_run(l) + right_run(r), seq[r]),
        (Some(l), Some(r)) => {
            let (lr, rr) = (left_run(l), right_run(r));
            if lr >= rr {
                (lr, seq[l])
            } else {
                (rr, seq[r])
            }
        }
        (Some(l), None) => (left_run(l), seq[l]),
        (None, Some(r)) => (right_run(r), seq[r]),
        (None, None) => return true,
    };

    match thresholds.max_homo_del_for(base) {
        Some(limit) => run <= limit,
        None => false,
    }
}

fn check_span(record: &AlignmentRecord, what: &str, pos: usize, len: usize, bound: usize) -> Result<()> {
    if pos + len > bound {
        return Err(ClusterError::malformed(
            record.line_no(),
            format!(
                "CIGAR walks past the {} ({} + {} > {}) for `{}`",
                what,
                pos,
                len,
                bound,
                record.query_id()
            ),
        ));
    }
    Ok(())
}

/// Walk the record's CIGAR and replace its derived statistics.
///
/// Scoring the same record twice with the same thresholds yields the same
/// statistics. Callers reject unmapped, secondary and supplementary records
/// first (see [`screen`]).
pub fn score(
    record: &mut AlignmentRecord,
    thresholds: &ScoreThresholds,
    options: ScoreOptions<'_>,
) -> Result<()> {
    let stats = walk(record, thresholds, options)?;
    record.stats = stats;
    Ok(())
}

fn walk(
    record: &AlignmentRecord,
    thresholds: &ScoreThresholds,
    options: ScoreOptions<'_>,
) -> Result<ReadStats> {
    let seq = record.seq();
    let qual = record.quality();
    let reference = options.reference;
    let match_reference = if options.deletions_only { None } else { reference };

    let mut stats = ReadStats {
        read_len: seq.len(),
        ..ReadStats::default()
    };

    if let Some(qual) = qual {
        let mut whole = QHistogram::new();
        for &c in qual {
            whole.add(phred(c));
        }
        stats.mean_q = whole.mean();
        stats.median_q = whole.median();
    }

    let mut aligned = QHistogram::new();
    let mut qpos = 0usize;
    let mut rpos = record.ref_start().saturating_sub(1) as usize;

    for run in record.cigar() {
        let len = run.len;
        match run.op {
            CigarOp::SoftClip => {
                check_span(record, "query", qpos, len, seq.len())?;
                qpos += len;
            }
            CigarOp::Match | CigarOp::Mismatch => {
                check_span(record, "query", qpos, len, seq.len())?;
                if let Some(r) = match_reference {
                    check_span(record, "reference", rpos, len, r.seq.len())?;
                    if let Some(ref_qual) = r.qual {
                        check_span(record, "reference quality", rpos, len, ref_qual.len())?;
                    }
                }
                let counts = if run.op == CigarOp::Match {
                    &mut stats.matches
                } else {
                    &mut stats.snps
                };
                for _ in 0..len {
                    let mut kept = true;
                    if let Some(qual) = qual {
                        let q = phred(qual[qpos]);
                        aligned.add(q);
                        kept = q >= thresholds.min_snp_q;
                    }
                    if let Some(ref_qual) = match_reference.and_then(|r| r.qual) {
                        kept = kept && phred(ref_qual[rpos]) >= thresholds.min_snp_q;
                    }
                    counts.record(kept);
                    qpos += 1;
                    rpos += 1;
                }
                stats.aligned_len += len;
            }
            CigarOp::Insertion => {
                check_span(record, "query", qpos, len, seq.len())?;
                for _ in 0..len {
                    if let Some(qual) = qual {
                        aligned.add(phred(qual[qpos]));
                    }
                    let kept = insertion_kept(seq, qual, qpos, thresholds.min_ins_q, |b| {
                        thresholds.max_homo_ins_for(b)
                    });
                    stats.insertions.record(kept);
                    qpos += 1;
                }
                stats.aligned_len += len;
            }
            CigarOp::Deletion => match reference {
                Some(r) => {
                    check_span(record, "reference", rpos, len, r.seq.len())?;
                    if let Some(ref_qual) = r.qual {
                        check_span(record, "reference quality", rpos, len, ref_qual.len())?;
                    }
                    for _ in 0..len {
                        let kept = insertion_kept(r.seq, r.qual, rpos, thresholds.min_ins_q, |b| {
                            thresholds.max_homo_del_for(b)
                        });
                        stats.deletions.record(kept);
                        rpos += 1;
                    }
                }
                None => {
                    let kept = flanking_deletion_kept(seq, qpos, thresholds);
                    for _ in 0..len {
                        stats.deletions.record(kept);
                    }
                    rpos += len;
                }
            },
        }
    }

    if !aligned.is_empty() {
        stats.aligned_mean_q = aligned.mean();
        stats.aligned_median_q = aligned.median();
    }
    Ok(stats)
}

/// Cheap rejections made before scoring: flags, mapping quality, length.
pub fn screen(record: &AlignmentRecord, thresholds: &ScoreThresholds) -> Option<DiscardReason> {
    if record.is_unmapped() {
        return Some(DiscardReason::Unmapped);
    }
    if record.is_secondary() {
        return Some(DiscardReason::Secondary);
    }
    if record.is_supplementary() {
        return Some(DiscardReason::Supplementary);
    }
    if thresholds.reject_reverse_strand && record.is_reverse() {
        return Some(DiscardReason::ReverseStrand);
    }
    if record.seq().is_empty() {
        return Some(DiscardReason::MissingSequence);
    }
    if record.mapq() < thresholds.min_mapq {
        return Some(DiscardReason::LowMapq);
    }
    let len = record.seq().len();
    if len < thresholds.min_read_len || len > thresholds.max_read_len {
        return Some(DiscardReason::ReadLength);
    }
    None
}

/// Apply the post-scoring thresholds to a scored record
pub fn check(record: &AlignmentRecord, thresholds: &ScoreThresholds) -> ScoreOutcome {
    let s = &record.stats;

    if record.quality().is_some() {
        if s.median_q < thresholds.min_median_q {
            return ScoreOutcome::Discard(DiscardReason::MedianQ);
        }
        if s.mean_q < thresholds.min_mean_q {
            return ScoreOutcome::Discard(DiscardReason::MeanQ);
        }
        if s.aligned_median_q < thresholds.min_aligned_median_q {
            return ScoreOutcome::Discard(DiscardReason::AlignedMedianQ);
        }
        if s.aligned_mean_q < thresholds.min_aligned_mean_q {
            return ScoreOutcome::Discard(DiscardReason::AlignedMeanQ);
        }
    }

    if s.identity() < thresholds.min_identity {
        return ScoreOutcome::Discard(DiscardReason::Identity);
    }
    if s.snp_rate() > thresholds.max_snp_rate {
        return ScoreOutcome::Discard(DiscardReason::SnpRate);
    }
    if s.ins_rate() > thresholds.max_ins_rate {
        return ScoreOutcome::Discard(DiscardReason::InsertionRate);
    }
    if s.del_rate() > thresholds.max_del_rate {
        return ScoreOutcome::Discard(DiscardReason::DeletionRate);
    }
    ScoreOutcome::Keep
}

/// Screen, score and check one record
pub fn score_and_check(
    record: &mut AlignmentRecord,
    thresholds: &ScoreThresholds,
    options: ScoreOptions<'_>,
) -> Result<ScoreOutcome> {
    if let Some(reason) = screen(record, thresholds) {
        return Ok(ScoreOutcome::Discard(reason));
    }
    score(record, thresholds, options)?;
    Ok(check(record, thresholds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::sam_line;

    fn permissive() -> ScoreThresholds {
        ScoreThresholds {
            min_mapq: 0,
            min_read_len: 0,
            ..ScoreThresholds::default()
        }
    }

    fn record(cigar: &str, seq: &str, qual: &str) -> AlignmentRecord {
        let mut rec = AlignmentRecord::new();
        rec.parse_line(&sam_line("q", 0, "ref", 1, 60, cigar, seq, qual), 1)
            .unwrap();
        rec
    }

    fn max_quality(len: usize) -> String {
        "~".repeat(len)
    }

    #[test]
    fn test_histogram_median_odd_and_even() {
        let mut h = QHistogram::new();
        for q in [5, 9, 7] {
            h.add(q);
        }
        assert_eq!(h.median(), 7.0);

        let mut h = QHistogram::new();
        for q in [10, 40, 20, 30] {
            h.add(q);
        }
        assert_eq!(h.median(), 25.0);
        assert_eq!(h.mean(), 25.0);
    }

    #[test]
    fn test_phred_truncates() {
        assert_eq!(phred(b'!'), 0);
        assert_eq!(phred(b'+'), 10);
        assert_eq!(phred(b' '), 0);
        assert_eq!(phred(b'~'), 93);
    }

    #[test]
    fn test_non_homopolymer_insertions_kept() {
        let seq = "ACGTACGTACGACTGCA";
        let mut rec = record("10=2I5=", seq, &max_quality(seq.len()));
        let thresholds = ScoreThresholds {
            max_homo_ins: [1, 1, 1, 1],
            ..permissive()
        };
        score(&mut rec, &thresholds, ScoreOptions::default()).unwrap();

        assert_eq!(rec.stats.insertions.kept, 2);
        assert_eq!(rec.stats.insertions.total, 2);
        assert_eq!(rec.stats.matches.kept, 15);
        assert_eq!(rec.stats.aligned_len, 17);
    }

    #[test]
    fn test_insertion_into_homopolymer() {
        // Inserted A after three A's
        let seq = "CGAAAAGC";
        let qual = max_quality(seq.len());

        let strict = ScoreThresholds {
            max_homo_ins: [1, 1, 1, 1],
            ..permissive()
        };
        let mut rec = record("5=1I2=", seq, &qual);
        score(&mut rec, &strict, ScoreOptions::default()).unwrap();
        assert_eq!(rec.stats.insertions.total, 1);
        assert_eq!(rec.stats.insertions.kept, 0);

        let loose = ScoreThresholds {
            max_homo_ins: [5, 1, 1, 1],
            ..permissive()
        };
        score(&mut rec, &loose, ScoreOptions::default()).unwrap();
        assert_eq!(rec.stats.insertions.kept, 1);
    }

    #[test]
    fn test_low_quality_insertion_dropped() {
        let seq = "ACGTACGT";
        // Base 4 is the insertion, quality '#' = Q2
        let mut rec = record("4=1I3=", seq, "IIII#III");
        score(&mut rec, &permissive(), ScoreOptions::default()).unwrap();
        assert_eq!(rec.stats.insertions.total, 1);
        assert_eq!(rec.stats.insertions.kept, 0);
    }

    #[test]
    fn test_homopolymer_case_and_uracil() {
        let seq = "CGuuUTGC";
        let mut rec = record("5=1I2=", seq, &max_quality(seq.len()));
        let thresholds = ScoreThresholds {
            max_homo_ins: [1, 1, 1, 2],
            ..permissive()
        };
        score(&mut rec, &thresholds, ScoreOptions::default()).unwrap();
        // Run of four T/U including the inserted base: 3 > 2
        assert_eq!(rec.stats.insertions.kept, 0);
    }

    #[test]
    fn test_deletion_between_distinct_bases_kept() {
        let seq = "ACGTACGT";
        let mut rec = record("4=1D4=", seq, &max_quality(seq.len()));
        score(&mut rec, &permissive(), ScoreOptions::default()).unwrap();
        assert_eq!(rec.stats.deletions.total, 1);
        assert_eq!(rec.stats.deletions.kept, 1);
        assert_eq!(rec.stats.aligned_len, 8);
    }

    #[test]
    fn test_deletion_inside_homopolymer_sums_flanks() {
        let seq = "ACGTTGCA";
        let mut rec = record("4=1D4=", seq, &max_quality(seq.len()));
        score(&mut rec, &permissive(), ScoreOptions::default()).unwrap();
        // T | T flanks: run of 2 > 1
        assert_eq!(rec.stats.deletions.kept, 0);

        let loose = ScoreThresholds {
            max_homo_del: [1, 1, 1, 2],
            ..permissive()
        };
        score(&mut rec, &loose, ScoreOptions::default()).unwrap();
        assert_eq!(rec.stats.deletions.kept, 1);
    }

    #[test]
    fn test_deletion_scored_against_reference() {
        let reference = b"ACGTTTACGT";
        let seq = "ACGTACGT";
        let mut rec = record("4=2D4=", seq, &max_quality(seq.len()));
        let view = ReferenceView {
            seq: reference,
            qual: None,
        };
        score(&mut rec, &permissive(), ScoreOptions::against(view)).unwrap();
        // Deleted T's sit in a TTT run on the reference
        assert_eq!(rec.stats.deletions.total, 2);
        assert_eq!(rec.stats.deletions.kept, 0);

        let loose = ScoreThresholds {
            max_homo_del: [1, 1, 1, 2],
            ..permissive()
        };
        score(&mut rec, &loose, ScoreOptions::against(view)).unwrap();
        assert_eq!(rec.stats.deletions.kept, 2);
    }

    #[test]
    fn test_reference_quality_gates_matches() {
        let seq = "ACGT";
        let mut rec = record("4=", seq, &max_quality(4));
        let reference = ReferenceView {
            seq: b"ACGT",
            qual: Some(b"II#I"),
        };
        score(&mut rec, &permissive(), ScoreOptions::against(reference)).unwrap();
        assert_eq!(rec.stats.matches.total, 4);
        assert_eq!(rec.stats.matches.kept, 3);

        let deletions_only = ScoreOptions {
            reference: Some(reference),
            deletions_only: true,
        };
        score(&mut rec, &permissive(), deletions_only).unwrap();
        assert_eq!(rec.stats.matches.kept, 4);
    }

    #[test]
    fn test_missing_quality_passes_quality_filters() {
        let mut rec = record("3=1X", "ACGT", "*");
        let thresholds = ScoreThresholds {
            min_snp_q: 60,
            min_median_q: 50.0,
            ..permissive()
        };
        score(&mut rec, &thresholds, ScoreOptions::default()).unwrap();
        assert_eq!(rec.stats.matches.kept, 3);
        assert_eq!(rec.stats.snps.kept, 1);
        assert_eq!(check(&rec, &thresholds), ScoreOutcome::Keep);
    }

    #[test]
    fn test_cigar_longer_than_query_is_malformed() {
        let mut rec = record("10=", "ACGTA", "IIIII");
        let err = score(&mut rec, &permissive(), ScoreOptions::default()).unwrap_err();
        assert!(matches!(err, ClusterError::MalformedRecord { .. }));
    }

    #[test]
    fn test_reference_shorter_than_alignment_is_malformed() {
        let mut rec = record("4=", "ACGT", "IIII");
        let reference = ReferenceView {
            seq: b"AC",
            qual: None,
        };
        assert!(score(&mut rec, &permissive(), ScoreOptions::against(reference)).is_err());
    }

    #[test]
    fn test_short_reference_quality_is_malformed() {
        let mut rec = record("4=", "ACGT", "IIII");
        let reference = ReferenceView {
            seq: b"ACGT",
            qual: Some(b"II"),
        };
        let err = score(&mut rec, &permissive(), ScoreOptions::against(reference)).unwrap_err();
        assert!(matches!(err, ClusterError::MalformedRecord { .. }));

        let mut rec = record("2=2D2=", "ACGT", "IIII");
        let reference = ReferenceView {
            seq: b"ACTTGT",
            qual: Some(b"III"),
        };
        let options = ScoreOptions {
            reference: Some(reference),
            deletions_only: true,
        };
        let err = score(&mut rec, &permissive(), options).unwrap_err();
        assert!(matches!(err, ClusterError::MalformedRecord { .. }));
    }

    #[test]
    fn test_reference_offset_follows_start_position() {
        // POS 3: the read lines up with reference bases 2..6, the third of
        // which has quality '#'
        let mut rec = AlignmentRecord::new();
        rec.parse_line(&sam_line("q", 0, "ref", 3, 60, "4=", "ACGT", "IIII"), 1)
            .unwrap();
        let reference = ReferenceView {
            seq: b"TTACGT",
            qual: Some(b"IIII#I"),
        };
        score(&mut rec, &permissive(), ScoreOptions::against(reference)).unwrap();
        assert_eq!(rec.stats.matches.total, 4);
        assert_eq!(rec.stats.matches.kept, 3);

        // One base further and the alignment runs off the reference
        rec.parse_line(&sam_line("q", 0, "ref", 4, 60, "4=", "ACGT", "IIII"), 2)
            .unwrap();
        assert!(score(&mut rec, &permissive(), ScoreOptions::against(reference)).is_err());
    }

    #[test]
    fn test_deletion_with_unequal_flanks_uses_longer_side() {
        // AAA | C: the A run (3) is longer than the C run (1)
        let mut rec = record("3=1D1=", "AAAC", &max_quality(4));
        let strict = ScoreThresholds {
            max_homo_del: [2, 3, 3, 3],
            ..permissive()
        };
        score(&mut rec, &strict, ScoreOptions::default()).unwrap();
        assert_eq!(rec.stats.deletions.total, 1);
        assert_eq!(rec.stats.deletions.kept, 0);

        let loose = ScoreThresholds {
            max_homo_del: [3, 1, 1, 1],
            ..permissive()
        };
        score(&mut rec, &loose, ScoreOptions::default()).unwrap();
        assert_eq!(rec.stats.deletions.kept, 1);
    }

    #[test]
    fn test_scoring_is_idempotent() {
        let seq = "AACGTTTGCAACGTAGGA";
        let qual = "II#IIII+IIII5IIII!";
        let mut rec = record("2S5=1X2I1D8=", seq, qual);
        score(&mut rec, &ScoreThresholds::default(), ScoreOptions::default()).unwrap();
        let first = rec.stats.clone();
        score(&mut rec, &ScoreThresholds::default(), ScoreOptions::default()).unwrap();
        assert_eq!(rec.stats, first);
    }

    #[test]
    fn test_aligned_region_excludes_soft_clips() {
        // Soft-clipped bases are Q0, aligned bases Q40
        let mut rec = record("2S4=", "GGACGT", "!!IIII");
        score(&mut rec, &permissive(), ScoreOptions::default()).unwrap();
        assert_eq!(rec.stats.aligned_median_q, 40.0);
        assert_eq!(rec.stats.aligned_mean_q, 40.0);
        assert!(rec.stats.mean_q < 40.0);
    }

    #[test]
    fn test_screen_rejects_flags_before_scoring() {
        let mut rec = AlignmentRecord::new();
        rec.parse_line(&sam_line("q", 256, "ref", 1, 60, "4=", "ACGT", "IIII"), 1)
            .unwrap();
        assert_eq!(
            score_and_check(&mut rec, &permissive(), ScoreOptions::default()).unwrap(),
            ScoreOutcome::Discard(DiscardReason::Secondary)
        );

        rec.parse_line(&sam_line("q", 4, "*", 0, 0, "*", "ACGT", "IIII"), 2)
            .unwrap();
        assert_eq!(screen(&rec, &permissive()), Some(DiscardReason::Unmapped));
    }

    #[test]
    fn test_reverse_strand_policy() {
        let mut rec = AlignmentRecord::new();
        rec.parse_line(&sam_line("q", 16, "ref", 1, 60, "4=", "ACGT", "IIII"), 1)
            .unwrap();
        assert_eq!(screen(&rec, &permissive()), None);

        let strict = ScoreThresholds {
            reject_reverse_strand: true,
            ..permissive()
        };
        assert_eq!(screen(&rec, &strict), Some(DiscardReason::ReverseStrand));
    }

    #[test]
    fn test_check_identity_threshold() {
        let mut rec = record("6=4X", "ACGTACGTAC", &max_quality(10));
        let thresholds = ScoreThresholds {
            min_identity: 0.9,
            ..permissive()
        };
        score(&mut rec, &thresholds, ScoreOptions::default()).unwrap();
        assert_eq!(
            check(&rec, &thresholds),
            ScoreOutcome::Discard(DiscardReason::Identity)
        );
    }

    #[test]
    fn test_check_low_median_q() {
        let mut rec = record("4=", "ACGT", "++++");
        let thresholds = ScoreThresholds {
            min_median_q: 20.0,
            ..permissive()
        };
        score(&mut rec, &thresholds, ScoreOptions::default()).unwrap();
        assert_eq!(
            check(&rec, &thresholds),
            ScoreOutcome::Discard(DiscardReason::MedianQ)
        );
    }
}

//! Bounded top-K best-read selection
//!
//! Candidates are scored against a bin's best read and held in a table of
//! buckets indexed by an integer composite score. A low-water mark tracks
//! the lowest occupied bucket so admission at capacity is O(1); only an
//! eviction that empties that bucket scans forward.
//!
//! The retained ids are then used for one streaming pass over the
//! candidate FASTQ (see [`crate::fastq::extract_by_ids`]).

use std::collections::VecDeque;
use std::path::Path;
use std::time::Instant;

use log::{debug, trace};

use crate::aligner::{Aligner, HeaderGate};
use crate::alignment::AlignmentRecord;
use crate::cigar_scorer::{score_and_check, ReferenceView, ScoreOptions, ScoreOutcome};
use crate::error::{ClusterError, Result};
use crate::fastq::{extract_by_ids, read_first_record, IdSet};
use crate::thresholds::ScoreThresholds;

/// Number of score buckets; composite scores are clamped below this
pub const SCORE_BUCKETS: usize = 2151;

/// `(mapq << 2, or 0 when mapq is not used) + floor(median Q)`, clamped
pub fn composite_score(mapq: u8, median_q: f32, use_mapq: bool) -> usize {
    let mapq_part = if use_mapq { (mapq as usize) << 2 } else { 0 };
    let q_part = if median_q > 0.0 { median_q.floor() as usize } else { 0 };
    (mapq_part + q_part).min(SCORE_BUCKETS - 1)
}

/// What happened to an offered item
#[derive(Debug, PartialEq, Eq)]
pub enum Offer<T> {
    Inserted,
    /// Admitted by evicting the returned item
    Replaced(T),
    /// Not admitted; the item is handed back
    Rejected(T),
}

/// Score-indexed bucket table holding at most `capacity` items
#[derive(Debug)]
pub struct ScoreBuckets<T> {
    buckets: Vec<VecDeque<T>>,
    low: usize,
    len: usize,
    capacity: usize,
}

impl<T> ScoreBuckets<T> {
    pub fn new(capacity: usize) -> Result<Self> {
        let mut buckets = Vec::new();
        buckets
            .try_reserve_exact(SCORE_BUCKETS)
            .map_err(|_| ClusterError::Allocation {
                what: "score buckets",
            })?;
        buckets.resize_with(SCORE_BUCKETS, VecDeque::new);
        Ok(Self {
            buckets,
            low: SCORE_BUCKETS,
            len: 0,
            capacity,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lowest occupied score, if any
    pub fn low_water_mark(&self) -> Option<usize> {
        (self.len > 0).then_some(self.low)
    }

    /// Offer an item. Below capacity it is always admitted; at capacity it
    /// must score strictly above the water mark and then evicts the oldest
    /// item in the water-mark bucket.
    pub fn offer(&mut self, score: usize, item: T) -> Offer<T> {
        let score = score.min(SCORE_BUCKETS - 1);

        if self.len < self.capacity {
            self.buckets[score].push_back(item);
            self.len += 1;
            self.low = self.low.min(score);
            return Offer::Inserted;
        }
        if self.len == 0 || score <= self.low {
            return Offer::Rejected(item);
        }

        let Some(evicted) = self.buckets[self.low].pop_front() else {
            return Offer::Rejected(item);
        };
        self.buckets[score].push_back(item);
        if self.buckets[self.low].is_empty() {
            self.low = (self.low + 1..SCORE_BUCKETS)
                .find(|&s| !self.buckets[s].is_empty())
                .unwrap_or(SCORE_BUCKETS);
        }
        Offer::Replaced(evicted)
    }

    /// Retained items from the highest score down, oldest first within a score
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        self.buckets
            .iter()
            .enumerate()
            .rev()
            .flat_map(|(score, bucket)| bucket.iter().map(move |item| (score, item)))
    }

    pub fn into_items(self) -> impl Iterator<Item = T> {
        self.buckets.into_iter().flatten()
    }
}

impl<T: AsRef<[u8]>> ScoreBuckets<T> {
    /// Collect the retained identifiers into a hash set
    pub fn to_id_set(&self) -> Result<IdSet> {
        let mut ids = IdSet::default();
        ids.try_reserve(self.len)
            .map_err(|_| ClusterError::Allocation { what: "read id set" })?;
        for (_, id) in self.iter() {
            ids.insert(id.as_ref().to_vec());
        }
        Ok(ids)
    }
}

/// Outcome of one selection pass
#[derive(Debug, Default)]
pub struct TopKSelection {
    pub ids: IdSet,
    /// Alignment records read from the aligner
    pub scanned: usize,
    /// Records that passed the thresholds
    pub passed: usize,
}

impl TopKSelection {
    pub fn retained(&self) -> usize {
        self.ids.len()
    }
}

/// Picks the K reads of a bin that best agree with its best read
pub struct TopKSelector<'a, A> {
    aligner: &'a A,
    thresholds: &'a ScoreThresholds,
    use_mapq: bool,
}

impl<'a, A: Aligner> TopKSelector<'a, A> {
    pub fn new(aligner: &'a A, thresholds: &'a ScoreThresholds, use_mapq: bool) -> Self {
        Self {
            aligner,
            thresholds,
            use_mapq,
        }
    }

    /// Align `candidates` to `best_read` and keep the ids of the `k`
    /// highest-scoring reads that pass the thresholds.
    pub fn select(&self, candidates: &Path, best_read: &Path, k: usize) -> Result<TopKSelection> {
        let start = Instant::now();
        let Some(reference) = read_first_record(best_read)? else {
            return Err(ClusterError::MalformedFastq {
                path: best_read.to_path_buf(),
                reason: "best-read file holds no record".to_string(),
            });
        };
        let options = ScoreOptions::against(ReferenceView {
            seq: reference.sequence(),
            qual: Some(reference.quality()),
        });

        let mut buckets: ScoreBuckets<String> = ScoreBuckets::new(k)?;
        let mut gate = HeaderGate::new(self.aligner.align(best_read, candidates)?);
        let mut record = AlignmentRecord::new();
        let mut selection = TopKSelection::default();

        while gate.read_record(&mut record)? {
            selection.scanned += 1;
            match score_and_check(&mut record, self.thresholds, options)? {
                ScoreOutcome::Keep => {}
                ScoreOutcome::Discard(reason) => {
                    trace!("top-k: {} discarded ({})", record.query_id(), reason.as_str());
                    continue;
                }
            }
            selection.passed += 1;
            let score = composite_score(
                record.mapq(),
                record.stats.aligned_median_q,
                self.use_mapq,
            );
            buckets.offer(score, record.query_id().to_string());
        }
        gate.finish()?;

        selection.ids = buckets.to_id_set()?;
        debug!(
            "top-k: {} of {} passing reads retained ({} scanned, k={}) in {}ms",
            selection.retained(),
            selection.passed,
            selection.scanned,
            k,
            start.elapsed().as_millis()
        );
        Ok(selection)
    }

    /// [`select`](Self::select) followed by the extraction pass into `out`.
    /// Returns the number of records written.
    pub fn select_into(
        &self,
        candidates: &Path,
        best_read: &Path,
        k: usize,
        out: &Path,
    ) -> Result<usize> {
        let selection = self.select(candidates, best_read, k)?;
        extract_by_ids(candidates, &selection.ids, out, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aligner::SamText;
    use crate::alignment::sam_line;
    use std::io::Cursor;
    use tempfile::tempdir;

    #[test]
    fn test_composite_score() {
        assert_eq!(composite_score(60, 20.7, true), 260);
        assert_eq!(composite_score(60, 20.7, false), 20);
        assert_eq!(composite_score(0, -1.0, true), 0);
        assert_eq!(composite_score(255, 93.0, true), 1113);
    }

    #[test]
    fn test_301_candidates_keep_highest_300() {
        let mut buckets = ScoreBuckets::new(300).unwrap();
        // scores 1..=301 in a scrambled order
        for i in 0..301usize {
            let score = (i * 97) % 301 + 1;
            buckets.offer(score, score);
        }
        assert_eq!(buckets.len(), 300);
        assert_eq!(buckets.low_water_mark(), Some(2));
        let mut kept: Vec<usize> = buckets.into_items().collect();
        kept.sort_unstable();
        assert_eq!(kept, (2..=301).collect::<Vec<_>>());
    }

    #[test]
    fn test_ties_never_evict() {
        let mut buckets = ScoreBuckets::new(2).unwrap();
        assert_eq!(buckets.offer(10, "a"), Offer::Inserted);
        assert_eq!(buckets.offer(10, "b"), Offer::Inserted);
        assert_eq!(buckets.offer(10, "c"), Offer::Rejected("c"));
        assert_eq!(buckets.offer(9, "d"), Offer::Rejected("d"));

        let kept: Vec<_> = buckets.iter().map(|(_, id)| *id).collect();
        assert_eq!(kept, vec!["a", "b"]);
    }

    #[test]
    fn test_eviction_takes_oldest_and_rescans() {
        let mut buckets = ScoreBuckets::new(3).unwrap();
        buckets.offer(5, "old");
        buckets.offer(5, "new");
        buckets.offer(8, "mid");
        assert_eq!(buckets.low_water_mark(), Some(5));

        assert_eq!(buckets.offer(6, "x"), Offer::Replaced("old"));
        assert_eq!(buckets.low_water_mark(), Some(5));
        assert_eq!(buckets.offer(7, "y"), Offer::Replaced("new"));
        // bucket 5 emptied; next occupied is 6
        assert_eq!(buckets.low_water_mark(), Some(6));

        let kept: Vec<_> = buckets.iter().collect();
        assert_eq!(kept, vec![(8, &"mid"), (7, &"y"), (6, &"x")]);
    }

    #[test]
    fn test_zero_capacity_rejects_everything() {
        let mut buckets = ScoreBuckets::new(0).unwrap();
        assert_eq!(buckets.offer(100, 1), Offer::Rejected(1));
        assert!(buckets.is_empty());
        assert_eq!(buckets.low_water_mark(), None);
    }

    #[test]
    fn test_scores_are_clamped() {
        let mut buckets = ScoreBuckets::new(1).unwrap();
        buckets.offer(usize::MAX, "top");
        assert_eq!(buckets.low_water_mark(), Some(SCORE_BUCKETS - 1));
    }

    struct CannedAligner(String);

    impl Aligner for CannedAligner {
        type Stream = SamText<Cursor<Vec<u8>>>;

        fn align(&self, _reference: &Path, _reads: &Path) -> Result<Self::Stream> {
            Ok(SamText::new(Cursor::new(self.0.clone().into_bytes()), "canned"))
        }
    }

    const BEST: &str = "ACGTACGTAC";

    fn candidate(name: &str, mapq: u8, q: char) -> String {
        let qual: String = std::iter::repeat(q).take(BEST.len()).collect();
        sam_line(name, 0, "best", 1, mapq, "10=", BEST, &qual)
    }

    fn lenient() -> ScoreThresholds {
        ScoreThresholds {
            min_read_len: 0,
            ..ScoreThresholds::read_vs_read()
        }
    }

    #[test]
    fn test_select_and_extract() {
        let dir = tempdir().unwrap();
        let best = dir.path().join("best.fq");
        std::fs::write(&best, format!("@best\n{}\n+\nIIIIIIIIII\n", BEST)).unwrap();
        let reads = dir.path().join("reads.fq");
        std::fs::write(
            &reads,
            format!(
                "@r1\n{0}\n+\n++++++++++\n@r2\n{0}\n+\n5555555555\n@r3\n{0}\n+\n??????????\n",
                BEST
            ),
        )
        .unwrap();

        let sam = format!(
            "@HD\tVN:1.6\n{}\n{}\n{}\n{}\n",
            candidate("r1", 60, '+'),
            candidate("r2", 60, '5'),
            candidate("r3", 60, '?'),
            sam_line("r4", 4, "*", 0, 0, "*", BEST, "IIIIIIIIII"),
        );
        let aligner = CannedAligner(sam);
        let thresholds = lenient();
        let selector = TopKSelector::new(&aligner, &thresholds, false);

        let selection = selector.select(&reads, &best, 2).unwrap();
        assert_eq!(selection.scanned, 4);
        assert_eq!(selection.passed, 3);
        assert_eq!(selection.retained(), 2);
        assert!(selection.ids.contains(b"r2".as_slice()));
        assert!(selection.ids.contains(b"r3".as_slice()));

        let out = dir.path().join("top.fq");
        let written = selector.select_into(&reads, &best, 2, &out).unwrap();
        assert_eq!(written, 2);
        let text = std::fs::read_to_string(&out).unwrap();
        assert!(text.starts_with("@r2\n"));
        assert!(!text.contains("@r1"));
    }

    #[test]
    fn test_mapq_decides_ranking_when_enabled() {
        let dir = tempdir().unwrap();
        let best = dir.path().join("best.fq");
        std::fs::write(&best, format!("@best\n{}\n+\nIIIIIIIIII\n", BEST)).unwrap();

        // placed: MAPQ 60, Q10 -> 250 with MAPQ, 10 without
        // sharp:  MAPQ 10, Q40 ->  80 with MAPQ, 40 without
        let sam = format!(
            "@HD\tVN:1.6\n{}\n{}\n",
            candidate("placed", 60, '+'),
            candidate("sharp", 10, 'I'),
        );
        let aligner = CannedAligner(sam);
        let thresholds = lenient();
        let reads = dir.path().join("reads.fq");

        let with_mapq = TopKSelector::new(&aligner, &thresholds, true)
            .select(&reads, &best, 1)
            .unwrap();
        assert_eq!(with_mapq.passed, 2);
        assert!(with_mapq.ids.contains(b"placed".as_slice()));

        let without_mapq = TopKSelector::new(&aligner, &thresholds, false)
            .select(&reads, &best, 1)
            .unwrap();
        assert!(without_mapq.ids.contains(b"sharp".as_slice()));
    }

    #[test]
    fn test_nothing_passing_is_success() {
        let dir = tempdir().unwrap();
        let best = dir.path().join("best.fq");
        std::fs::write(&best, format!("@best\n{}\n+\nIIIIIIIIII\n", BEST)).unwrap();
        let aligner = CannedAligner("@HD\tVN:1.6\n".to_string());
        let thresholds = lenient();
        let selection = TopKSelector::new(&aligner, &thresholds, true)
            .select(&dir.path().join("reads.fq"), &best, 300)
            .unwrap();
        assert_eq!(selection.retained(), 0);
    }

    #[test]
    fn test_headerless_output_fails() {
        let dir = tempdir().unwrap();
        let best = dir.path().join("best.fq");
        std::fs::write(&best, format!("@best\n{}\n+\nIIIIIIIIII\n", BEST)).unwrap();
        let aligner = CannedAligner(String::new());
        let thresholds = lenient();
        let err = TopKSelector::new(&aligner, &thresholds, true)
            .select(&dir.path().join("reads.fq"), &best, 300)
            .unwrap_err();
        assert!(matches!(err, ClusterError::AlignerFailed { .. }));
    }
}

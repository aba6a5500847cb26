//! Orchestration: binning, per-bin clustering and bin merging
//!
//! Phases of a run:
//! 1. Align all reads to the references and stream the records; kept reads
//!    are appended to their reference's bin files (tree phase).
//! 2. Convert the registry to a list and drop bins that are too small.
//! 3. Per bin: best read, top-K reads, consensus, then split the reads that
//!    disagree with the consensus into a new cluster bin; repeat.
//! 4. Optionally merge bins whose consensuses agree.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;

use log::{debug, info, trace, warn};
use rustc_hash::FxHashMap;

use crate::aligner::{Aligner, AlignmentSource, HeaderGate};
use crate::alignment::AlignmentRecord;
use crate::bin_registry::{remove_file_if_exists, Bin, BinId, BinList, BinTree};
use crate::cigar_scorer::{score_and_check, DiscardReason, ScoreOptions, ScoreOutcome};
use crate::error::{ClusterError, Result};
use crate::fastq::{extract_by_ids, select_best_read, IdSet};
use crate::thresholds::ScoreThresholds;
use crate::top_k::TopKSelector;

// ============================================================================
// Configuration and statistics
// ============================================================================

/// Run configuration
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Bin files are written as `<prefix>-<key>.<ext>`
    pub out_prefix: PathBuf,
    /// Read-vs-reference thresholds used while binning
    pub binning: ScoreThresholds,
    /// Read-vs-read thresholds for top-K selection, splitting and merging
    pub clustering: ScoreThresholds,
    /// Bins and split-off clusters with fewer reads are dropped
    pub min_bin_reads: u64,
    pub top_k: usize,
    pub use_mapq_in_score: bool,
    /// Consensus rounds per bin
    pub max_clusters: usize,
    pub merge_bins: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            out_prefix: PathBuf::from("strain_bins"),
            binning: ScoreThresholds::default(),
            clustering: ScoreThresholds::read_vs_read(),
            min_bin_reads: 100,
            top_k: 300,
            use_mapq_in_score: true,
            max_clusters: 10,
            merge_bins: false,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        self.binning.validate()?;
        self.clustering.validate()?;
        if self.top_k == 0 {
            return Err(ClusterError::InvalidThresholds(
                "top-K must keep at least one read".to_string(),
            ));
        }
        if self.max_clusters == 0 {
            return Err(ClusterError::InvalidThresholds(
                "at least one clustering round is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Counters from the binning pass
#[derive(Debug, Clone, Default)]
pub struct BinningStats {
    /// Alignment records read
    pub records: u64,
    pub kept: u64,
    /// Kept records on the reverse strand
    pub reverse_strand: u64,
    pub discarded: FxHashMap<DiscardReason, u64>,
    pub bins: usize,
    pub elapsed_ms: u64,
}

impl BinningStats {
    pub fn discarded_for(&self, reason: DiscardReason) -> u64 {
        self.discarded.get(&reason).copied().unwrap_or(0)
    }

    pub fn discarded_total(&self) -> u64 {
        self.discarded.values().sum()
    }

    fn discard(&mut self, reason: DiscardReason) {
        *self.discarded.entry(reason).or_insert(0) += 1;
    }
}

/// Counters from clustering every bin
#[derive(Debug, Clone, Default)]
pub struct ClusteringStats {
    pub bins_clustered: usize,
    /// Bins dropped after a bin-local failure
    pub bins_dropped: usize,
    /// Cluster bins split off parents
    pub clusters: usize,
    pub elapsed_ms: u64,
}

/// Everything a finished run produced
#[derive(Debug)]
pub struct RunOutcome {
    pub bins: BinList,
    pub binning: BinningStats,
    pub pruned: usize,
    pub clustering: ClusteringStats,
    pub merged: usize,
}

// ============================================================================
// Consensus collaborator
// ============================================================================

/// Builds a consensus from a bin's best read and its top reads
pub trait ConsensusBuilder {
    /// Write a consensus to `out` and return its path
    fn build(&self, best_read: &Path, top_reads: &Path, out: &Path) -> Result<PathBuf>;
}

/// External consensus program run as `program args.. <best> <top> <out>`
#[derive(Debug, Clone)]
pub struct ConsensusCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ConsensusCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn failed(&self, reason: impl Into<String>) -> ClusterError {
        ClusterError::ConsensusFailed {
            program: self.program.clone(),
            reason: reason.into(),
        }
    }
}

impl ConsensusBuilder for ConsensusCommand {
    fn build(&self, best_read: &Path, top_reads: &Path, out: &Path) -> Result<PathBuf> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(best_read)
            .arg(top_reads)
            .arg(out)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| self.failed(format!("could not start: {}", e)))?;

        if !status.success() {
            return Err(self.failed(format!("exited with {}", status)));
        }
        match fs::metadata(out) {
            Ok(meta) if meta.len() > 0 => Ok(out.to_path_buf()),
            _ => Err(self.failed(format!("no consensus written to {}", out.display()))),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Keys become file name components; anything outside `[A-Za-z0-9._-]` is `_`
fn file_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Append one kept read to a bin's FASTQ and stats files.
/// Each file is opened in append mode for this write only.
fn append_kept(record: &AlignmentRecord, fastq: &Path, stats: &Path) -> Result<()> {
    let open = |path: &Path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map(BufWriter::new)
            .map_err(|e| ClusterError::file(path, e))
    };

    let mut out = open(fastq)?;
    record
        .to_fastq(&mut out)
        .and_then(|_| out.flush())
        .map_err(|e| ClusterError::file(fastq, e))?;

    let mut out = open(stats)?;
    writeln!(out, "{}", record.stats_line())
        .and_then(|_| out.flush())
        .map_err(|e| ClusterError::file(stats, e))?;
    Ok(())
}

/// Start a bin file empty so reruns do not append to stale output
fn reset_file(path: &Path) -> Result<()> {
    fs::File::create(path)
        .map(drop)
        .map_err(|e| ClusterError::file(path, e))
}

/// Split a bin's stats rows by query id (first column): member rows go to
/// `kept`, the rest to `rest` when given and are dropped otherwise.
fn split_stats(stats: &Path, members: &IdSet, kept: &Path, rest: Option<&Path>) -> Result<()> {
    let input = match fs::File::open(stats) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            reset_file(kept)?;
            return rest.map_or(Ok(()), reset_file);
        }
        Err(e) => return Err(ClusterError::file(stats, e)),
    };
    let create = |path: &Path| {
        fs::File::create(path)
            .map(BufWriter::new)
            .map_err(|e| ClusterError::file(path, e))
    };
    let mut kept_out = create(kept)?;
    let mut rest_out = rest.map(create).transpose()?;

    let mut reader = BufReader::new(input);
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader
            .read_until(b'\n', &mut line)
            .map_err(|e| ClusterError::file(stats, e))?
            == 0
        {
            break;
        }
        let id = line.split(|&b| b == b'\t').next().unwrap_or(&[]);
        let (out, path) = if members.contains(id) {
            (Some(&mut kept_out), kept)
        } else {
            (rest_out.as_mut(), rest.unwrap_or(kept))
        };
        if let Some(out) = out {
            out.write_all(&line).map_err(|e| ClusterError::file(path, e))?;
        }
    }

    kept_out.flush().map_err(|e| ClusterError::file(kept, e))?;
    if let (Some(out), Some(path)) = (rest_out.as_mut(), rest) {
        out.flush().map_err(|e| ClusterError::file(path, e))?;
    }
    Ok(())
}

// ============================================================================
// Engine
// ============================================================================

/// Drives binning and clustering with one aligner
pub struct ClusterEngine<A> {
    aligner: A,
    config: ClusterConfig,
}

impl<A: Aligner> ClusterEngine<A> {
    pub fn new(aligner: A, config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { aligner, config })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Path of a bin file: `<prefix>-<key>.<ext>`
    pub fn bin_file(&self, key: &str, ext: &str) -> PathBuf {
        let mut name = self.config.out_prefix.clone().into_os_string();
        name.push(format!("-{}.{}", file_key(key), ext));
        PathBuf::from(name)
    }

    // ------------------------------------------------------------------------
    // Phase 1: binning
    // ------------------------------------------------------------------------

    /// Stream alignment records into `tree`.
    ///
    /// Two records are kept in rotation so a record repeating the previous
    /// record's query id is skipped as a duplicate.
    pub fn bin_stream<S: AlignmentSource>(&self, source: S, tree: &mut BinTree) -> Result<BinningStats> {
        let t0 = Instant::now();
        let thresholds = &self.config.binning;
        let mut stats = BinningStats::default();
        let mut gate = HeaderGate::new(source);
        let mut records = [AlignmentRecord::new(), AlignmentRecord::new()];
        let mut cur = 0usize;
        let mut have_prev = false;

        loop {
            let [first, second] = &mut records;
            let (record, previous) = if cur == 0 {
                (first, &*second)
            } else {
                (second, &*first)
            };
            if !gate.read_record(record)? {
                break;
            }
            stats.records += 1;

            if have_prev && record.query_id() == previous.query_id() {
                stats.discard(DiscardReason::DuplicateQuery);
                continue;
            }
            have_prev = true;
            cur = 1 - cur;

            match score_and_check(record, thresholds, ScoreOptions::default())? {
                ScoreOutcome::Keep => {}
                ScoreOutcome::Discard(reason) => {
                    trace!("{} discarded ({})", record.query_id(), reason.as_str());
                    stats.discard(reason);
                    continue;
                }
            }

            if record.is_reverse() {
                if stats.reverse_strand == 0 {
                    warn!(
                        "{} is reverse-strand; its CIGAR is scored as forward-strand",
                        record.query_id()
                    );
                }
                stats.reverse_strand += 1;
            }

            let id = tree.find_or_insert(record.reference_id());
            let fastq = self.bin_file(record.reference_id(), "fastq");
            let tsv = self.bin_file(record.reference_id(), "tsv");
            let bin = tree.get_mut(id).ok_or(ClusterError::StaleBin(id))?;
            if bin.files.fastq.is_none() {
                reset_file(&fastq)?;
                reset_file(&tsv)?;
                bin.files.fastq = Some(fastq.clone());
                bin.files.stats = Some(tsv.clone());
            }
            append_kept(record, &fastq, &tsv)?;
            stats.kept += 1;
        }
        gate.finish()?;

        stats.bins = tree.len();
        stats.elapsed_ms = t0.elapsed().as_millis() as u64;
        if stats.reverse_strand > 0 {
            warn!(
                "{} kept records were reverse-strand and scored as forward-strand",
                stats.reverse_strand
            );
        }
        info!(
            "  {} records, {} kept into {} bins, {} discarded ({}ms)",
            stats.records,
            stats.kept,
            stats.bins,
            stats.discarded_total(),
            stats.elapsed_ms
        );
        Ok(stats)
    }

    /// Align `reads` against `references` and bin the output
    pub fn bin_reads(&self, references: &Path, reads: &Path) -> Result<(BinTree, BinningStats)> {
        info!(
            "Phase 1: Binning {} against {}...",
            reads.display(),
            references.display()
        );
        let stream = self.aligner.align(references, reads)?;
        let mut tree = BinTree::new();
        let stats = self.bin_stream(stream, &mut tree)?;
        Ok((tree, stats))
    }

    // ------------------------------------------------------------------------
    // Phase 2: list conversion
    // ------------------------------------------------------------------------

    /// Convert to the list phase and drop bins under `min_bin_reads`.
    /// Returns the list and the number of bins dropped.
    pub fn finish_binning(&self, tree: BinTree) -> Result<(BinList, usize)> {
        info!("Phase 2: Dropping bins under {} reads...", self.config.min_bin_reads);
        let mut list = tree.into_list();
        let pruned = list.prune(self.config.min_bin_reads)?;
        info!("  {} bins kept, {} dropped", list.len(), pruned);
        Ok((list, pruned))
    }

    // ------------------------------------------------------------------------
    // Phase 3: clustering
    // ------------------------------------------------------------------------

    /// Ids of the reads in `reads` that pass the clustering thresholds
    /// against `consensus`
    fn consensus_members(&self, consensus: &Path, reads: &Path) -> Result<IdSet> {
        let mut gate = HeaderGate::new(self.aligner.align(consensus, reads)?);
        let mut record = AlignmentRecord::new();
        let mut members = IdSet::default();

        while gate.read_record(&mut record)? {
            let outcome = score_and_check(&mut record, &self.config.clustering, ScoreOptions::default())?;
            if outcome.is_keep() {
                members.insert(record.query_id().as_bytes().to_vec());
            }
        }
        gate.finish()?;
        Ok(members)
    }

    /// One consensus round on `current`. Returns the cluster split off
    /// `parent`, if the leftover reads were enough to form one.
    fn cluster_round<C: ConsensusBuilder>(
        &self,
        list: &mut BinList,
        parent: BinId,
        current: BinId,
        rest_key: String,
        selector: &TopKSelector<'_, A>,
        builder: &C,
    ) -> Result<Option<BinId>> {
        let bin = list.get(current).ok_or(ClusterError::StaleBin(current))?;
        let key = bin.key().to_string();
        let reads = match &bin.files.fastq {
            Some(path) => path.clone(),
            None => self.bin_file(&key, "fastq"),
        };
        let stats = bin.files.stats.clone();

        let best = self.bin_file(&key, "best.fastq");
        let Some(best_read) = select_best_read(&reads, &best)? else {
            debug!("{}: no reads left", key);
            return Ok(None);
        };
        if let Some(bin) = list.get_mut(current) {
            bin.files.best_read = Some(best.clone());
        }

        let top = self.bin_file(&key, "top.fastq");
        let retained = selector.select_into(&reads, &best, self.config.top_k, &top)?;
        if let Some(bin) = list.get_mut(current) {
            bin.files.top_reads = Some(top.clone());
        }

        let consensus = builder.build(&best, &top, &self.bin_file(&key, "consensus.fasta"))?;
        if let Some(bin) = list.get_mut(current) {
            bin.files.consensus = Some(consensus.clone());
        }

        let members = self.consensus_members(&consensus, &reads)?;
        if members.is_empty() {
            return Err(ClusterError::ConsensusFailed {
                program: consensus.display().to_string(),
                reason: format!("no read of bin {} agrees with the consensus", key),
            });
        }

        let rest = self.bin_file(&rest_key, "fastq");
        let rest_count = extract_by_ids(&reads, &members, &rest, false)?;

        let kept_path = self.bin_file(&key, "members.fastq");
        let kept = extract_by_ids(&reads, &members, &kept_path, true)?;
        fs::rename(&kept_path, &reads).map_err(|e| ClusterError::file(&reads, e))?;

        let split = (rest_count as u64) >= self.config.min_bin_reads.max(1);
        let rest_stats = self.bin_file(&rest_key, "tsv");
        if let Some(stats) = &stats {
            let kept_stats = self.bin_file(&key, "members.tsv");
            split_stats(stats, &members, &kept_stats, split.then_some(rest_stats.as_path()))?;
            fs::rename(&kept_stats, stats).map_err(|e| ClusterError::file(stats, e))?;
        }
        if let Some(bin) = list.get_mut(current) {
            bin.files.fastq = Some(reads.clone());
            bin.set_read_count(kept as u64);
        }

        debug!(
            "{}: best read {} (Q{}), {} top reads, {} members, {} left over",
            key,
            String::from_utf8_lossy(&best_read.id),
            best_read.median_q,
            retained,
            kept,
            rest_count
        );

        if !split {
            remove_file_if_exists(&rest)?;
            return Ok(None);
        }

        let mut cluster = Bin::with_reads(rest_key, rest_count as u64);
        cluster.files.fastq = Some(rest);
        cluster.files.stats = stats.is_some().then_some(rest_stats);
        Ok(Some(list.push_cluster(parent, cluster)?))
    }

    /// Build consensuses for one bin, splitting off reads that disagree
    /// into cluster bins on its chain. Returns the clusters created.
    ///
    /// Only a failure on the bin itself is returned. A split-off cluster
    /// whose round fails with a bin-local error is removed from the chain
    /// and clustering of the bin stops there.
    pub fn cluster_bin<C: ConsensusBuilder>(
        &self,
        list: &mut BinList,
        id: BinId,
        builder: &C,
    ) -> Result<usize> {
        let parent_key = list.get(id).ok_or(ClusterError::StaleBin(id))?.key().to_string();
        let mut current = id;
        let mut created = 0usize;
        let selector = TopKSelector::new(
            &self.aligner,
            &self.config.clustering,
            self.config.use_mapq_in_score,
        );

        for _ in 0..self.config.max_clusters {
            let rest_key = format!("{}-c{}", parent_key, created + 1);
            match self.cluster_round(list, id, current, rest_key, &selector, builder) {
                Ok(Some(cluster)) => {
                    current = cluster;
                    created += 1;
                }
                Ok(None) => break,
                Err(e) if current != id && e.is_bin_local() => {
                    let key = list.get(current).map(|b| b.key().to_string()).unwrap_or_default();
                    warn!("dropping cluster {}: {}", key, e);
                    list.remove(current)?;
                    created -= 1;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(created)
    }

    /// Cluster every bin. Bins failing with a bin-local error are removed
    /// with a warning; any other error aborts.
    pub fn cluster_all<C: ConsensusBuilder>(&self, list: &mut BinList, builder: &C) -> Result<ClusteringStats> {
        let t0 = Instant::now();
        info!("Phase 3: Clustering {} bins...", list.len());
        let mut stats = ClusteringStats::default();

        for id in list.ids() {
            match self.cluster_bin(list, id, builder) {
                Ok(created) => {
                    stats.bins_clustered += 1;
                    stats.clusters += created;
                }
                Err(e) if e.is_bin_local() => {
                    let key = list.get(id).map(|b| b.key().to_string()).unwrap_or_default();
                    warn!("dropping bin {}: {}", key, e);
                    list.remove(id)?;
                    stats.bins_dropped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        stats.elapsed_ms = t0.elapsed().as_millis() as u64;
        info!(
            "  {} bins clustered, {} clusters split off, {} bins dropped ({}ms)",
            stats.bins_clustered, stats.clusters, stats.bins_dropped, stats.elapsed_ms
        );
        Ok(stats)
    }

    // ------------------------------------------------------------------------
    // Phase 4: merging
    // ------------------------------------------------------------------------

    fn consensuses_agree(&self, reference: &Path, query: &Path) -> Result<bool> {
        let mut gate = HeaderGate::new(self.aligner.align(reference, query)?);
        let mut record = AlignmentRecord::new();
        let mut agree = false;

        while gate.read_record(&mut record)? {
            let outcome = score_and_check(&mut record, &self.config.clustering, ScoreOptions::default())?;
            agree |= outcome.is_keep();
        }
        gate.finish()?;
        Ok(agree)
    }

    /// Merge each bin into the first earlier bin whose consensus agrees
    /// with its own. Bins without a consensus are left alone.
    /// Returns the number of merges.
    pub fn merge_similar_bins(&self, list: &mut BinList) -> Result<usize> {
        info!("Phase 4: Merging bins with matching consensuses...");
        let mut survivors: Vec<(BinId, PathBuf)> = Vec::new();
        let mut merged = 0usize;

        let candidates: Vec<(BinId, PathBuf)> = list
            .iter()
            .filter_map(|(id, bin)| bin.files.consensus.clone().map(|c| (id, c)))
            .collect();

        for (id, consensus) in candidates {
            let mut target = None;
            for (survivor, survivor_consensus) in &survivors {
                if self.consensuses_agree(survivor_consensus, &consensus)? {
                    target = Some(*survivor);
                    break;
                }
            }
            match target {
                Some(keep) => {
                    debug!("merging {:?} into {:?}", id, keep);
                    list.merge(keep, id)?;
                    merged += 1;
                }
                None => survivors.push((id, consensus)),
            }
        }

        info!("  {} bins merged, {} remain", merged, list.len());
        Ok(merged)
    }

    // ------------------------------------------------------------------------
    // Whole run
    // ------------------------------------------------------------------------

    pub fn run<C: ConsensusBuilder>(&self, references: &Path, reads: &Path, builder: &C) -> Result<RunOutcome> {
        let t0 = Instant::now();

        let (tree, binning) = self.bin_reads(references, reads)?;
        let (mut bins, pruned) = self.finish_binning(tree)?;
        let clustering = self.cluster_all(&mut bins, builder)?;
        let merged = if self.config.merge_bins {
            self.merge_similar_bins(&mut bins)?
        } else {
            0
        };

        info!(
            "Done: {} bins from {} kept reads in {}ms",
            bins.len(),
            binning.kept,
            t0.elapsed().as_millis()
        );
        Ok(RunOutcome {
            bins,
            binning,
            pruned,
            clustering,
            merged,
        })
    }
}

//! End-to-end runs with an in-process aligner and consensus builder.
//!
//! Read ids look like `<strain><n>_<reference>`. The fake aligner maps a
//! read to `<reference>` when aligning against the reference FASTA, and to
//! a read-based reference (best read or consensus, both FASTQ here) only
//! when the strain letters match.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use strain_bins::alignment::sam_line;
use strain_bins::{
    Aligner, ClusterConfig, ClusterEngine, ClusterError, ConsensusBuilder, FastqReader,
    FastqRecord, Result, SamText, ScoreThresholds,
};
use tempfile::{tempdir, TempDir};

const SEQ: &str = "ACGTTGCAAGCTTACGGATC";

struct StrainAligner;

impl Aligner for StrainAligner {
    type Stream = SamText<Cursor<Vec<u8>>>;

    fn align(&self, reference: &Path, reads: &Path) -> Result<Self::Stream> {
        let head = fs::read_to_string(reference).map_err(|e| ClusterError::file(reference, e))?;
        // FASTQ reference: a read-derived sequence named after its first record
        let read_ref = head
            .strip_prefix('@')
            .and_then(|rest| rest.lines().next())
            .map(|id| id.to_string());

        let mut sam = String::from("@HD\tVN:1.6\n");
        let mut reader = FastqReader::from_path(reads)?;
        let mut rec = FastqRecord::new();
        while reader.read_record(&mut rec)? {
            let id = String::from_utf8_lossy(rec.read_id()).into_owned();
            let seq = String::from_utf8_lossy(rec.sequence()).into_owned();
            let qual = String::from_utf8_lossy(rec.quality()).into_owned();

            let target = match &read_ref {
                Some(ref_id) if ref_id[..1] == id[..1] => Some(ref_id.clone()),
                Some(_) => None,
                None => id.split('_').nth(1).map(str::to_string),
            };
            let line = match target {
                Some(name) => sam_line(&id, 0, &name, 1, 60, &format!("{}=", seq.len()), &seq, &qual),
                None => sam_line(&id, 4, "*", 0, 0, "*", &seq, &qual),
            };
            sam.push_str(&line);
            sam.push('\n');
        }
        Ok(SamText::new(Cursor::new(sam.into_bytes()), "strain-aligner"))
    }
}

/// Uses the best read as the consensus
struct CopyBest;

impl ConsensusBuilder for CopyBest {
    fn build(&self, best_read: &Path, _top_reads: &Path, out: &Path) -> Result<PathBuf> {
        fs::copy(best_read, out).map_err(|e| ClusterError::file(out, e))?;
        Ok(out.to_path_buf())
    }
}

/// Like [`CopyBest`], but fails for the first split-off cluster
struct FailsOnCluster;

impl ConsensusBuilder for FailsOnCluster {
    fn build(&self, best_read: &Path, top_reads: &Path, out: &Path) -> Result<PathBuf> {
        let name = out.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        if name.contains("-c1.") {
            return Err(ClusterError::ConsensusFailed {
                program: "fails-on-cluster".to_string(),
                reason: name,
            });
        }
        CopyBest.build(best_read, top_reads, out)
    }
}

struct Broken;

impl ConsensusBuilder for Broken {
    fn build(&self, _best_read: &Path, _top_reads: &Path, _out: &Path) -> Result<PathBuf> {
        Err(ClusterError::ConsensusFailed {
            program: "broken".to_string(),
            reason: "always fails".to_string(),
        })
    }
}

fn write_reads(dir: &Path, reads: &[(&str, char)]) -> PathBuf {
    let path = dir.join("reads.fq");
    let mut text = String::new();
    for (id, q) in reads {
        let qual: String = std::iter::repeat(*q).take(SEQ.len()).collect();
        text.push_str(&format!("@{} ch=1\n{}\n+\n{}\n", id, SEQ, qual));
    }
    fs::write(&path, text).unwrap();
    path
}

fn setup(reads: &[(&str, char)], merge: bool) -> (TempDir, PathBuf, PathBuf, ClusterEngine<StrainAligner>) {
    let dir = tempdir().unwrap();
    let refs = dir.path().join("refs.fa");
    fs::write(&refs, ">r1\nACGT\n>r2\nACGT\n").unwrap();
    let reads = write_reads(dir.path(), reads);

    let config = ClusterConfig {
        out_prefix: dir.path().join("run"),
        binning: ScoreThresholds {
            min_read_len: 0,
            ..ScoreThresholds::default()
        },
        clustering: ScoreThresholds {
            min_read_len: 0,
            ..ScoreThresholds::read_vs_read()
        },
        min_bin_reads: 2,
        top_k: 3,
        merge_bins: merge,
        ..ClusterConfig::default()
    };
    let engine = ClusterEngine::new(StrainAligner, config).unwrap();
    (dir, refs, reads, engine)
}

fn ids_in(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter(|l| l.starts_with('@'))
        .map(|l| l[1..].split_whitespace().next().unwrap_or("").to_string())
        .collect()
}

#[test]
fn test_bin_and_split_strains() {
    let (_dir, refs, reads, engine) = setup(
        &[
            ("a1_r1", 'I'),
            ("b1_r1", '5'),
            ("a2_r1", 'I'),
            ("b2_r1", '5'),
            ("a3_r1", 'I'),
            ("b3_r1", '5'),
            ("a4_r1", 'I'),
            ("c1_r2", 'I'),
        ],
        false,
    );

    let outcome = engine.run(&refs, &reads, &CopyBest).unwrap();
    assert_eq!(outcome.binning.kept, 8);
    assert_eq!(outcome.pruned, 1);
    assert_eq!(outcome.clustering.bins_clustered, 1);
    assert_eq!(outcome.clustering.clusters, 1);

    let top: Vec<_> = outcome.bins.iter().collect();
    assert_eq!(top.len(), 1);
    let (id, bin) = top[0];
    assert_eq!(bin.key(), "r1");
    assert_eq!(bin.read_count(), 4);
    assert_eq!(ids_in(&engine.bin_file("r1", "fastq")), vec!["a1_r1", "a2_r1", "a3_r1", "a4_r1"]);
    assert_eq!(ids_in(&engine.bin_file("r1", "best.fastq")), vec!["a1_r1"]);
    assert_eq!(ids_in(&engine.bin_file("r1", "top.fastq")), vec!["a1_r1", "a2_r1", "a3_r1"]);

    let clusters: Vec<_> = outcome.bins.clusters(id).collect();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].1.key(), "r1-c1");
    assert_eq!(clusters[0].1.read_count(), 3);
    assert_eq!(ids_in(&engine.bin_file("r1-c1", "fastq")), vec!["b1_r1", "b2_r1", "b3_r1"]);
    assert_eq!(ids_in(&engine.bin_file("r1-c1", "best.fastq")), vec!["b1_r1"]);

    // stats rows follow their reads
    let rows = |key: &str| -> Vec<String> {
        fs::read_to_string(engine.bin_file(key, "tsv"))
            .unwrap()
            .lines()
            .map(|l| l.split('\t').next().unwrap_or("").to_string())
            .collect()
    };
    assert_eq!(rows("r1"), vec!["a1_r1", "a2_r1", "a3_r1", "a4_r1"]);
    assert_eq!(rows("r1-c1"), vec!["b1_r1", "b2_r1", "b3_r1"]);

    // the small bin and its files are gone
    assert!(!engine.bin_file("r2", "fastq").exists());
    assert!(!engine.bin_file("r2", "tsv").exists());
}

#[test]
fn test_small_remainder_is_not_split() {
    let (_dir, refs, reads, engine) = setup(
        &[("a1_r1", 'I'), ("a2_r1", 'I'), ("b1_r1", '5')],
        false,
    );

    let outcome = engine.run(&refs, &reads, &CopyBest).unwrap();
    assert_eq!(outcome.clustering.clusters, 0);
    let (id, bin) = outcome.bins.iter().next().unwrap();
    assert_eq!(bin.read_count(), 2);
    assert_eq!(outcome.bins.clusters(id).count(), 0);
    assert!(!engine.bin_file("r1-c1", "fastq").exists());
}

#[test]
fn test_failed_cluster_round_keeps_parent() {
    let (_dir, refs, reads, engine) = setup(
        &[
            ("a1_r1", 'I'),
            ("a2_r1", 'I'),
            ("a3_r1", 'I'),
            ("b1_r1", '5'),
            ("b2_r1", '5'),
            ("b3_r1", '5'),
        ],
        false,
    );

    let outcome = engine.run(&refs, &reads, &FailsOnCluster).unwrap();
    assert_eq!(outcome.clustering.bins_dropped, 0);
    assert_eq!(outcome.clustering.bins_clustered, 1);
    assert_eq!(outcome.clustering.clusters, 0);

    let (id, bin) = outcome.bins.iter().next().unwrap();
    assert_eq!(bin.key(), "r1");
    assert_eq!(bin.read_count(), 3);
    assert_eq!(outcome.bins.clusters(id).count(), 0);
    assert_eq!(ids_in(&engine.bin_file("r1", "fastq")), vec!["a1_r1", "a2_r1", "a3_r1"]);
    assert!(engine.bin_file("r1", "consensus.fasta").exists());

    // the failed cluster took its files with it
    assert!(!engine.bin_file("r1-c1", "fastq").exists());
    assert!(!engine.bin_file("r1-c1", "tsv").exists());
    assert!(!engine.bin_file("r1-c1", "best.fastq").exists());
}

#[test]
fn test_merge_bins_with_matching_consensus() {
    let (_dir, refs, reads, engine) = setup(
        &[
            ("a1_r1", 'I'),
            ("a2_r1", 'I'),
            ("a3_r1", 'I'),
            ("a4_r2", '5'),
            ("a5_r2", '5'),
        ],
        true,
    );

    let outcome = engine.run(&refs, &reads, &CopyBest).unwrap();
    assert_eq!(outcome.merged, 1);
    let bins: Vec<_> = outcome.bins.iter().map(|(_, b)| (b.key().to_string(), b.read_count())).collect();
    assert_eq!(bins, vec![("r1".to_string(), 5)]);
    assert_eq!(
        ids_in(&engine.bin_file("r1", "fastq")),
        vec!["a1_r1", "a2_r1", "a3_r1", "a4_r2", "a5_r2"]
    );
    assert!(!engine.bin_file("r2", "fastq").exists());
    assert!(!engine.bin_file("r2", "consensus.fasta").exists());
}

#[test]
fn test_different_strains_are_not_merged() {
    let (_dir, refs, reads, engine) = setup(
        &[("a1_r1", 'I'), ("a2_r1", 'I'), ("b1_r2", 'I'), ("b2_r2", 'I')],
        true,
    );

    let outcome = engine.run(&refs, &reads, &CopyBest).unwrap();
    assert_eq!(outcome.merged, 0);
    assert_eq!(outcome.bins.len(), 2);
}

#[test]
fn test_consensus_failure_drops_bin() {
    let (_dir, refs, reads, engine) = setup(
        &[("a1_r1", 'I'), ("a2_r1", 'I'), ("a3_r1", 'I')],
        false,
    );

    let outcome = engine.run(&refs, &reads, &Broken).unwrap();
    assert_eq!(outcome.clustering.bins_dropped, 1);
    assert!(outcome.bins.is_empty());
    assert!(!engine.bin_file("r1", "fastq").exists());
    assert!(!engine.bin_file("r1", "best.fastq").exists());
}

#[test]
fn test_missing_reads_file_aborts() {
    let (dir, refs, _reads, engine) = setup(&[("a1_r1", 'I')], false);
    let err = engine
        .run(&refs, &dir.path().join("absent.fq"), &CopyBest)
        .unwrap_err();
    assert!(matches!(err, ClusterError::File { .. }));
}

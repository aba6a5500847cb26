use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use strain_bins::{
    AlignerCommand, ClusterConfig, ClusterEngine, ConsensusCommand, ScoreThresholds,
};

#[derive(Parser)]
#[command(name = "strain_bins")]
#[command(about = "Bin long reads by reference and split each bin into strain clusters", long_about = None)]
#[command(version)]
struct Cli {
    /// References to bin against (FASTA)
    #[arg(value_name = "REFS.FA")]
    references: PathBuf,

    /// Reads to bin (FASTQ, optionally gzipped)
    #[arg(value_name = "READS.FQ")]
    reads: PathBuf,

    /// Output prefix; bin files are written as <PREFIX>-<bin>.<ext>
    #[arg(short = 'o', long, value_name = "PREFIX", default_value = "strain_bins")]
    out_prefix: PathBuf,

    /// Aligner program, run as `<PROGRAM> <ARGS..> <reference> <reads>`
    #[arg(long, default_value = "minimap2")]
    aligner: String,

    /// Aligner argument (repeatable); defaults to minimap2's `-a --eqx -x map-ont`
    #[arg(long = "aligner-arg", value_name = "ARG", allow_hyphen_values = true)]
    aligner_args: Vec<String>,

    /// Consensus program, run as `<PROGRAM> <ARGS..> <best> <top> <out>`
    #[arg(long, value_name = "PROGRAM")]
    consensus: String,

    /// Consensus argument (repeatable)
    #[arg(long = "consensus-arg", value_name = "ARG", allow_hyphen_values = true)]
    consensus_args: Vec<String>,

    /// Minimum mapping quality while binning
    #[arg(long, default_value_t = 15)]
    min_mapq: u8,

    /// Minimum read length
    #[arg(long, default_value_t = 200)]
    min_len: usize,

    /// Maximum read length
    #[arg(long, default_value_t = 100_000)]
    max_len: usize,

    /// Minimum whole-read and aligned median/mean Q
    #[arg(long, default_value_t = 7.0)]
    min_q: f32,

    /// Minimum base quality for keeping a SNP or indel
    #[arg(long, default_value_t = 7)]
    min_base_q: u8,

    /// Discard reverse-strand alignments instead of scoring them
    #[arg(long)]
    reject_reverse: bool,

    /// Minimum read-vs-consensus identity for cluster membership
    #[arg(long, default_value_t = 0.9)]
    min_identity: f32,

    /// Bins and clusters with fewer reads are dropped
    #[arg(long, default_value_t = 100)]
    min_bin_reads: u64,

    /// Reads kept for building each consensus
    #[arg(short = 'k', long, default_value_t = 300)]
    top_k: usize,

    /// Rank top reads by median Q only, ignoring mapping quality
    #[arg(long)]
    no_mapq_score: bool,

    /// Consensus rounds per bin
    #[arg(long, default_value_t = 10)]
    max_clusters: usize,

    /// Merge bins whose consensuses agree
    #[arg(long)]
    merge: bool,

    /// Log per-bin details
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn config(&self) -> ClusterConfig {
        let binning = ScoreThresholds {
            min_mapq: self.min_mapq,
            min_read_len: self.min_len,
            max_read_len: self.max_len,
            min_median_q: self.min_q,
            min_mean_q: self.min_q,
            min_aligned_median_q: self.min_q,
            min_aligned_mean_q: self.min_q,
            min_snp_q: self.min_base_q,
            min_ins_q: self.min_base_q,
            reject_reverse_strand: self.reject_reverse,
            ..ScoreThresholds::default()
        };
        let clustering = ScoreThresholds {
            min_read_len: self.min_len,
            max_read_len: self.max_len,
            min_identity: self.min_identity,
            ..ScoreThresholds::read_vs_read()
        };

        ClusterConfig {
            out_prefix: self.out_prefix.clone(),
            binning,
            clustering,
            min_bin_reads: self.min_bin_reads,
            top_k: self.top_k,
            use_mapq_in_score: !self.no_mapq_score,
            max_clusters: self.max_clusters,
            merge_bins: self.merge,
        }
    }

    fn aligner(&self) -> AlignerCommand {
        if self.aligner_args.is_empty() && self.aligner == "minimap2" {
            AlignerCommand::minimap2()
        } else {
            AlignerCommand::new(self.aligner.clone(), self.aligner_args.clone())
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .format_timestamp(None)
        .format_target(false)
        .init();

    if let Some(dir) = cli.out_prefix.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
    }

    let engine = ClusterEngine::new(cli.aligner(), cli.config()).context("Invalid configuration")?;
    let builder = ConsensusCommand::new(cli.consensus.clone(), cli.consensus_args.clone());

    let outcome = engine
        .run(&cli.references, &cli.reads, &builder)
        .context("Binning failed")?;

    for (id, bin) in outcome.bins.iter() {
        println!("{}\t{}", bin.key(), bin.read_count());
        for (_, cluster) in outcome.bins.clusters(id) {
            println!("{}\t{}", cluster.key(), cluster.read_count());
        }
    }
    log::info!(
        "{} reads binned, {} bins pruned, {} clusters, {} bins dropped, {} merged",
        outcome.binning.kept,
        outcome.pruned,
        outcome.clustering.clusters,
        outcome.clustering.bins_dropped,
        outcome.merged
    );
    Ok(())
}

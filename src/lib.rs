//! Strain binning core for long-read co-infection detection.
//!
//! Reads are aligned to a set of references, scored by walking their CIGARs
//! ([`cigar_scorer`]), and routed into per-reference bins held in an AVL
//! registry ([`bin_registry`]). Each bin is then clustered around consensus
//! sequences built from its best read and top-K reads ([`top_k`]), with
//! [`cluster_engine`] driving the phases.
//!
//! Aligner and consensus builder are external programs behind the
//! [`aligner::Aligner`] and [`cluster_engine::ConsensusBuilder`] traits.

// Modules
pub mod aligner;
pub mod alignment;
pub mod bin_registry;
pub mod cigar_scorer;
pub mod cluster_engine;
pub mod error;
pub mod fastq;
pub mod thresholds;
pub mod top_k;

pub use aligner::{Aligner, AlignerCommand, AlignmentSource, HeaderGate, SamStream, SamText};
pub use alignment::{AlignmentRecord, CigarOp, CigarRun, ReadStats};
pub use bin_registry::{Bin, BinFiles, BinId, BinList, BinTree, NodeRole};
pub use cigar_scorer::{
    check, score, score_and_check, screen, DiscardReason, ReferenceView, ScoreOptions,
    ScoreOutcome,
};
pub use cluster_engine::{
    BinningStats, ClusterConfig, ClusterEngine, ClusteringStats, ConsensusBuilder,
    ConsensusCommand, RunOutcome,
};
pub use error::{ClusterError, Result};
pub use fastq::{extract_by_ids, select_best_read, FastqReader, FastqRecord, IdSet};
pub use thresholds::ScoreThresholds;
pub use top_k::{composite_score, ScoreBuckets, TopKSelection, TopKSelector};

//! In-memory alignment records parsed from aligner text output
//!
//! One [`AlignmentRecord`] is parsed per data line and reused across lines:
//! `parse_line` clears the buffers but keeps their capacity, so the hot
//! loop in the engine only allocates when a read is longer than any seen
//! before.
//!
//! # Line layout
//! ```text
//! QNAME FLAG RNAME POS MAPQ CIGAR RNEXT PNEXT TLEN SEQ QUAL [tags...]
//! ```
//! Only the extended CIGAR operations `=`, `X`, `I`, `D`, `S` are scored.
//! Hard clips are accepted and skipped (they consume nothing); `M`, `N`
//! and `P` are rejected because they hide the match/mismatch distinction.

use std::io::Write;

use rust_htslib::bam::record::{Cigar, CigarString};

use crate::error::{ClusterError, Result};

pub const FLAG_UNMAPPED: u16 = 0x4;
pub const FLAG_REVERSE: u16 = 0x10;
pub const FLAG_SECONDARY: u16 = 0x100;
pub const FLAG_SUPPLEMENTARY: u16 = 0x800;

/// Offset of the Phred+33 quality encoding
pub const PHRED_OFFSET: u8 = 33;

/// Scored CIGAR operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CigarOp {
    Match,
    Mismatch,
    Insertion,
    Deletion,
    SoftClip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CigarRun {
    pub len: usize,
    pub op: CigarOp,
}

/// Total and kept tallies for one event category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventCounts {
    pub total: usize,
    pub kept: usize,
}

impl EventCounts {
    #[inline]
    pub(crate) fn record(&mut self, kept: bool) {
        self.total += 1;
        if kept {
            self.kept += 1;
        }
    }
}

/// Statistics derived by the scorer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadStats {
    pub matches: EventCounts,
    pub snps: EventCounts,
    pub insertions: EventCounts,
    pub deletions: EventCounts,
    /// Bases in the read, soft clips included
    pub read_len: usize,
    /// Query bases consumed by `=`, `X` and `I`
    pub aligned_len: usize,
    pub mean_q: f32,
    pub median_q: f32,
    pub aligned_mean_q: f32,
    pub aligned_median_q: f32,
}

impl ReadStats {
    /// kept matches / (kept matches + kept SNPs + kept insertions + kept deletions)
    pub fn identity(&self) -> f32 {
        let events =
            self.matches.kept + self.snps.kept + self.insertions.kept + self.deletions.kept;
        if events == 0 {
            return 0.0;
        }
        self.matches.kept as f32 / events as f32
    }

    fn rate(&self, kept: usize) -> f32 {
        if self.aligned_len == 0 {
            return 0.0;
        }
        kept as f32 / self.aligned_len as f32
    }

    pub fn snp_rate(&self) -> f32 {
        self.rate(self.snps.kept)
    }

    pub fn ins_rate(&self) -> f32 {
        self.rate(self.insertions.kept)
    }

    pub fn del_rate(&self) -> f32 {
        self.rate(self.deletions.kept)
    }
}

/// One parsed alignment line plus the statistics the scorer derives from it
#[derive(Debug, Clone, Default)]
pub struct AlignmentRecord {
    query_id: String,
    flags: u16,
    reference_id: String,
    /// 1-based leftmost reference position, 0 when unmapped
    ref_start: u64,
    mapq: u8,
    cigar: Vec<CigarRun>,
    seq: Vec<u8>,
    qual: Vec<u8>,
    has_qual: bool,
    /// Line the record was parsed from, for error reports
    line_no: usize,
    pub stats: ReadStats,
}

fn next_field<'a>(
    fields: &mut impl Iterator<Item = &'a str>,
    name: &str,
    line_no: usize,
) -> Result<&'a str> {
    fields
        .next()
        .ok_or_else(|| ClusterError::malformed(line_no, format!("missing {} field", name)))
}

fn parse_cigar(text: &str, line_no: usize, out: &mut Vec<CigarRun>) -> Result<()> {
    out.clear();
    if text == "*" {
        return Ok(());
    }

    let cigar = CigarString::try_from(text)
        .map_err(|e| ClusterError::malformed(line_no, format!("bad CIGAR `{}`: {}", text, e)))?;

    for op in cigar.iter() {
        let (len, op) = match *op {
            Cigar::Equal(len) => (len, CigarOp::Match),
            Cigar::Diff(len) => (len, CigarOp::Mismatch),
            Cigar::Ins(len) => (len, CigarOp::Insertion),
            Cigar::Del(len) => (len, CigarOp::Deletion),
            Cigar::SoftClip(len) => (len, CigarOp::SoftClip),
            Cigar::HardClip(_) => continue,
            Cigar::Match(_) | Cigar::RefSkip(_) | Cigar::Pad(_) => {
                return Err(ClusterError::malformed(
                    line_no,
                    format!(
                        "CIGAR `{}` uses `{}`; only extended =/X/I/D/S operations are scored",
                        text,
                        op.char()
                    ),
                ));
            }
        };
        if len > 0 {
            out.push(CigarRun {
                len: len as usize,
                op,
            });
        }
    }
    Ok(())
}

impl AlignmentRecord {
    pub fn new() -> Self {
        Self::default()
    }

    fn clear(&mut self) {
        self.query_id.clear();
        self.reference_id.clear();
        self.flags = 0;
        self.ref_start = 0;
        self.mapq = 0;
        self.cigar.clear();
        self.seq.clear();
        self.qual.clear();
        self.has_qual = false;
        self.line_no = 0;
        self.stats = ReadStats::default();
    }

    /// Parse one data line into this record, reusing its buffers.
    ///
    /// The CIGAR is only parsed for primary mapped records; unmapped,
    /// secondary and supplementary records are rejected before scoring and
    /// keep an empty CIGAR.
    pub fn parse_line(&mut self, line: &str, line_no: usize) -> Result<()> {
        self.clear();
        self.line_no = line_no;
        let line = line.trim_end_matches(['\n', '\r']);
        let mut fields = line.split('\t');

        let qname = next_field(&mut fields, "QNAME", line_no)?;
        let flag = next_field(&mut fields, "FLAG", line_no)?;
        let rname = next_field(&mut fields, "RNAME", line_no)?;
        let pos = next_field(&mut fields, "POS", line_no)?;
        let mapq = next_field(&mut fields, "MAPQ", line_no)?;
        let cigar = next_field(&mut fields, "CIGAR", line_no)?;
        for name in ["RNEXT", "PNEXT", "TLEN"] {
            next_field(&mut fields, name, line_no)?;
        }
        let seq = next_field(&mut fields, "SEQ", line_no)?;
        let qual = next_field(&mut fields, "QUAL", line_no)?;

        self.query_id.push_str(qname);
        self.reference_id.push_str(rname);
        self.flags = flag
            .parse::<u16>()
            .map_err(|_| ClusterError::malformed(line_no, format!("bad FLAG `{}`", flag)))?;
        self.ref_start = pos
            .parse::<u64>()
            .map_err(|_| ClusterError::malformed(line_no, format!("bad POS `{}`", pos)))?;
        self.mapq = mapq
            .parse::<u8>()
            .map_err(|_| ClusterError::malformed(line_no, format!("bad MAPQ `{}`", mapq)))?;

        if seq != "*" {
            self.seq.extend_from_slice(seq.as_bytes());
        }
        if qual != "*" {
            if qual.len() != self.seq.len() {
                return Err(ClusterError::malformed(
                    line_no,
                    format!(
                        "quality length {} does not match sequence length {}",
                        qual.len(),
                        self.seq.len()
                    ),
                ));
            }
            self.qual.extend_from_slice(qual.as_bytes());
            self.has_qual = true;
        }

        if self.is_primary_mapped() {
            parse_cigar(cigar, line_no, &mut self.cigar)?;
        }
        self.stats.read_len = self.seq.len();
        Ok(())
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn reference_id(&self) -> &str {
        &self.reference_id
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn mapq(&self) -> u8 {
        self.mapq
    }

    /// 1-based reference start
    pub fn ref_start(&self) -> u64 {
        self.ref_start
    }

    pub fn line_no(&self) -> usize {
        self.line_no
    }

    pub fn cigar(&self) -> &[CigarRun] {
        &self.cigar
    }

    pub fn seq(&self) -> &[u8] {
        &self.seq
    }

    /// Raw Phred+33 qualities, `None` when the line carried `*`
    pub fn quality(&self) -> Option<&[u8]> {
        self.has_qual.then_some(self.qual.as_slice())
    }

    pub fn is_unmapped(&self) -> bool {
        self.flags & FLAG_UNMAPPED != 0
    }

    pub fn is_reverse(&self) -> bool {
        self.flags & FLAG_REVERSE != 0
    }

    pub fn is_secondary(&self) -> bool {
        self.flags & FLAG_SECONDARY != 0
    }

    pub fn is_supplementary(&self) -> bool {
        self.flags & FLAG_SUPPLEMENTARY != 0
    }

    fn is_primary_mapped(&self) -> bool {
        self.flags & (FLAG_UNMAPPED | FLAG_SECONDARY | FLAG_SUPPLEMENTARY) == 0
    }

    /// Write the read as a 4-line FASTQ record.
    ///
    /// FASTQ has no "no quality" state, so reads without qualities get `!`
    /// (Q0) for every base.
    pub fn to_fastq<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        out.write_all(b"@")?;
        out.write_all(self.query_id.as_bytes())?;
        out.write_all(b"\n")?;
        out.write_all(&self.seq)?;
        out.write_all(b"\n+\n")?;
        if self.has_qual {
            out.write_all(&self.qual)?;
        } else {
            for _ in 0..self.seq.len() {
                out.write_all(b"!")?;
            }
        }
        out.write_all(b"\n")
    }

    /// One tab-separated stats row (no trailing newline).
    ///
    /// Columns: query, reference, mapq, read length, aligned length, median Q,
    /// mean Q, aligned median Q, aligned mean Q, kept matches/SNPs/ins/dels,
    /// total SNPs/ins/dels.
    pub fn stats_line(&self) -> String {
        let s = &self.stats;
        format!(
            "{}\t{}\t{}\t{}\t{}\t{:.2}\t{:.2}\t{:.2}\t{:.2}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.query_id,
            self.reference_id,
            self.mapq,
            s.read_len,
            s.aligned_len,
            s.median_q,
            s.mean_q,
            s.aligned_median_q,
            s.aligned_mean_q,
            s.matches.kept,
            s.snps.kept,
            s.insertions.kept,
            s.deletions.kept,
            s.snps.total,
            s.insertions.total,
            s.deletions.total,
        )
    }
}

/// Build the tab-separated line for a record, used by tests and benches
pub fn sam_line(
    qname: &str,
    flag: u16,
    rname: &str,
    pos: u64,
    mapq: u8,
    cigar: &str,
    seq: &str,
    qual: &str,
) -> String {
    format!(
        "{}\t{}\t{}\t{}\t{}\t{}\t*\t0\t0\t{}\t{}",
        qname, flag, rname, pos, mapq, cigar, seq, qual
    )
}

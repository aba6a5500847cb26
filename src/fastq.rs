//! Streaming 4-line FASTQ access
//!
//! Records are kept as their raw lines (terminators included) so filtered
//! output is byte-for-byte the input minus the dropped records. Gzip input
//! is detected by magic bytes and inflated on the fly.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use rustc_hash::FxHashSet;

use crate::cigar_scorer::{phred, QHistogram};
use crate::error::{ClusterError, Result};

/// Read identifiers, stored as bytes to skip UTF-8 validation
pub type IdSet = FxHashSet<Vec<u8>>;

const READ_BUFFER: usize = 1024 * 1024;

/// Open a read source, inflating gzip transparently
pub fn open_reads(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).map_err(|e| ClusterError::file(path, e))?;
    let mut reader = BufReader::with_capacity(READ_BUFFER, file);
    let is_gzip = {
        let head = reader.fill_buf().map_err(|e| ClusterError::file(path, e))?;
        head.len() >= 2 && head[0] == 0x1f && head[1] == 0x8b
    };

    if is_gzip {
        Ok(Box::new(BufReader::with_capacity(
            READ_BUFFER,
            MultiGzDecoder::new(reader),
        )))
    } else {
        Ok(Box::new(reader))
    }
}

/// Create (truncate) an output file behind a buffer
pub fn create_output(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).map_err(|e| ClusterError::file(path, e))?;
    Ok(BufWriter::new(file))
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &line[..end]
}

/// One FASTQ record as its four raw lines
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FastqRecord {
    header: Vec<u8>,
    seq: Vec<u8>,
    plus: Vec<u8>,
    qual: Vec<u8>,
}

impl FastqRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Header text after `@` up to the first whitespace
    pub fn read_id(&self) -> &[u8] {
        let header = trim_line(&self.header);
        let header = header.strip_prefix(b"@").unwrap_or(header);
        let end = header
            .iter()
            .position(|b| b.is_ascii_whitespace())
            .unwrap_or(header.len());
        &header[..end]
    }

    pub fn sequence(&self) -> &[u8] {
        trim_line(&self.seq)
    }

    /// Raw Phred+33 qualities
    pub fn quality(&self) -> &[u8] {
        trim_line(&self.qual)
    }

    /// Truncated median Q over the whole read
    pub fn median_q(&self) -> u8 {
        let mut hist = QHistogram::new();
        for &c in self.quality() {
            hist.add(phred(c));
        }
        hist.median() as u8
    }

    /// Re-emit the record verbatim; a missing final newline is added
    pub fn write_to<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        out.write_all(&self.header)?;
        out.write_all(&self.seq)?;
        out.write_all(&self.plus)?;
        out.write_all(&self.qual)?;
        if !self.qual.ends_with(b"\n") {
            out.write_all(b"\n")?;
        }
        Ok(())
    }
}

/// Record-at-a-time FASTQ reader
pub struct FastqReader<R> {
    reader: R,
    path: PathBuf,
}

impl FastqReader<Box<dyn BufRead>> {
    pub fn from_path(path: &Path) -> Result<Self> {
        Ok(Self {
            reader: open_reads(path)?,
            path: path.to_path_buf(),
        })
    }
}

impl<R: BufRead> FastqReader<R> {
    /// Wrap an already-open reader; `path` is only used in error messages
    pub fn new(reader: R, path: impl Into<PathBuf>) -> Self {
        Self {
            reader,
            path: path.into(),
        }
    }

    fn malformed(&self, reason: impl Into<String>) -> ClusterError {
        ClusterError::MalformedFastq {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    fn read_line(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        buf.clear();
        self.reader
            .read_until(b'\n', buf)
            .map_err(|e| ClusterError::file(&self.path, e))
    }

    /// Read the next record into `rec`. Returns `false` at end of input.
    pub fn read_record(&mut self, rec: &mut FastqRecord) -> Result<bool> {
        loop {
            if self.read_line(&mut rec.header)? == 0 {
                return Ok(false);
            }
            if !trim_line(&rec.header).is_empty() {
                break;
            }
        }
        if !rec.header.starts_with(b"@") {
            return Err(self.malformed(format!(
                "header line does not start with '@': {}",
                String::from_utf8_lossy(trim_line(&rec.header))
            )));
        }

        let id = String::from_utf8_lossy(rec.read_id()).into_owned();
        if self.read_line(&mut rec.seq)? == 0
            || self.read_line(&mut rec.plus)? == 0
            || self.read_line(&mut rec.qual)? == 0
        {
            return Err(self.malformed(format!("record `{}` is truncated", id)));
        }
        if !rec.plus.starts_with(b"+") {
            return Err(self.malformed(format!("record `{}` lacks its '+' line", id)));
        }
        if rec.sequence().len() != rec.quality().len() {
            return Err(self.malformed(format!(
                "record `{}` has {} bases but {} qualities",
                id,
                rec.sequence().len(),
                rec.quality().len()
            )));
        }
        Ok(true)
    }
}

/// Stream `source` once, copying each record whose id is (or, with
/// `keep_matching = false`, is not) in `ids`. Returns the records written.
pub fn extract_by_ids(source: &Path, ids: &IdSet, out: &Path, keep_matching: bool) -> Result<usize> {
    let mut reader = FastqReader::from_path(source)?;
    let mut writer = create_output(out)?;
    let mut rec = FastqRecord::new();
    let mut written = 0usize;

    while reader.read_record(&mut rec)? {
        if ids.contains(rec.read_id()) == keep_matching {
            rec.write_to(&mut writer)
                .map_err(|e| ClusterError::file(out, e))?;
            written += 1;
        }
    }
    writer.flush().map_err(|e| ClusterError::file(out, e))?;
    Ok(written)
}

/// The read chosen to anchor a bin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BestRead {
    pub id: Vec<u8>,
    pub median_q: u8,
    pub len: usize,
}

/// Pick the read with the highest truncated median Q (ties: longer read,
/// then first seen) and write it alone to `out`.
///
/// Returns `None`, without creating `out`, when the source has no reads.
pub fn select_best_read(source: &Path, out: &Path) -> Result<Option<BestRead>> {
    let mut reader = FastqReader::from_path(source)?;
    let mut rec = FastqRecord::new();
    let mut best: Option<(FastqRecord, BestRead)> = None;

    while reader.read_record(&mut rec)? {
        let candidate = (rec.median_q(), rec.sequence().len());
        let better = match &best {
            Some((_, b)) => candidate > (b.median_q, b.len),
            None => true,
        };
        if better {
            let summary = BestRead {
                id: rec.read_id().to_vec(),
                median_q: candidate.0,
                len: candidate.1,
            };
            best = Some((rec.clone(), summary));
        }
    }

    let Some((record, summary)) = best else {
        return Ok(None);
    };
    let mut writer = create_output(out)?;
    record
        .write_to(&mut writer)
        .and_then(|_| writer.flush())
        .map_err(|e| ClusterError::file(out, e))?;
    Ok(Some(summary))
}

/// First record of a FASTQ file, if any
pub fn read_first_record(path: &Path) -> Result<Option<FastqRecord>> {
    let mut reader = FastqReader::from_path(path)?;
    let mut rec = FastqRecord::new();
    Ok(reader.read_record(&mut rec)?.then_some(rec))
}

//! Aligner collaborator: line-at-a-time access to SAM text
//!
//! The aligner runs as a child process whose stdout is consumed while it is
//! still being produced. Nothing buffers the whole output.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

use log::debug;

use crate::alignment::AlignmentRecord;
use crate::error::{ClusterError, Result};

/// A stream of SAM lines
pub trait AlignmentSource {
    /// Next line without its terminator, `None` at end of stream
    fn next_line(&mut self) -> Result<Option<&str>>;

    /// 1-based number of the line last returned
    fn line_no(&self) -> usize;

    /// Name used in error reports
    fn program(&self) -> &str;

    /// Release the source once fully read
    fn finish(self) -> Result<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

fn read_trimmed<R: BufRead>(reader: &mut R, buf: &mut String) -> io::Result<bool> {
    buf.clear();
    if reader.read_line(buf)? == 0 {
        return Ok(false);
    }
    let trimmed = buf.trim_end_matches(['\n', '\r']).len();
    buf.truncate(trimmed);
    Ok(true)
}

/// SAM text from any buffered reader
pub struct SamText<R> {
    reader: R,
    buf: String,
    line_no: usize,
    name: String,
}

impl<R: BufRead> SamText<R> {
    pub fn new(reader: R, name: impl Into<String>) -> Self {
        Self {
            reader,
            buf: String::new(),
            line_no: 0,
            name: name.into(),
        }
    }
}

impl SamText<BufReader<File>> {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| ClusterError::file(path, e))?;
        Ok(Self::new(BufReader::new(file), path.display().to_string()))
    }
}

impl<R: BufRead> AlignmentSource for SamText<R> {
    fn next_line(&mut self) -> Result<Option<&str>> {
        if !read_trimmed(&mut self.reader, &mut self.buf)? {
            return Ok(None);
        }
        self.line_no += 1;
        Ok(Some(&self.buf))
    }

    fn line_no(&self) -> usize {
        self.line_no
    }

    fn program(&self) -> &str {
        &self.name
    }
}

/// Stdout of a running aligner. The child is killed and reaped if the
/// stream is dropped before [`AlignmentSource::finish`].
pub struct SamStream {
    child: Option<Child>,
    reader: BufReader<ChildStdout>,
    buf: String,
    line_no: usize,
    program: String,
}

impl SamStream {
    fn failed(&self, reason: impl Into<String>) -> ClusterError {
        ClusterError::AlignerFailed {
            program: self.program.clone(),
            reason: reason.into(),
        }
    }
}

impl AlignmentSource for SamStream {
    fn next_line(&mut self) -> Result<Option<&str>> {
        if !read_trimmed(&mut self.reader, &mut self.buf)? {
            return Ok(None);
        }
        self.line_no += 1;
        Ok(Some(&self.buf))
    }

    fn line_no(&self) -> usize {
        self.line_no
    }

    fn program(&self) -> &str {
        &self.program
    }

    /// Drain what is left and reap the child; a failing exit is an error
    fn finish(mut self) -> Result<()> {
        io::copy(&mut self.reader, &mut io::sink())?;
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait()?;
        if !status.success() {
            return Err(self.failed(format!("exited with {}", status)));
        }
        debug!("{} finished after {} lines", self.program, self.line_no);
        Ok(())
    }
}

impl Drop for SamStream {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Something that aligns a read file against a reference file
pub trait Aligner {
    type Stream: AlignmentSource;

    fn align(&self, reference: &Path, reads: &Path) -> Result<Self::Stream>;
}

/// External aligner run as `program args.. <reference> <reads>`
#[derive(Debug, Clone)]
pub struct AlignerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl AlignerCommand {
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

    /// minimap2 in nanopore mode with extended (`=`/`X`) CIGARs
    pub fn minimap2() -> Self {
        Self::new("minimap2", ["-a", "--eqx", "-x", "map-ont"])
    }

    fn failed(&self, reason: impl Into<String>) -> ClusterError {
        ClusterError::AlignerFailed {
            program: self.program.clone(),
            reason: reason.into(),
        }
    }
}

impl Aligner for AlignerCommand {
    type Stream = SamStream;

    fn align(&self, reference: &Path, reads: &Path) -> Result<SamStream> {
        debug!(
            "running {} {} {} {}",
            self.program,
            self.args.join(" "),
            reference.display(),
            reads.display()
        );
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(reference)
            .arg(reads)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| self.failed(format!("could not start: {}", e)))?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(self.failed("stdout was not captured"));
        };

        Ok(SamStream {
            child: Some(child),
            reader: BufReader::with_capacity(1 << 16, stdout),
            buf: String::new(),
            line_no: 0,
            program: self.program.clone(),
        })
    }
}

/// Record reader that enforces "some output, header first".
///
/// Header lines are skipped. A data line arriving before any header, or a
/// stream that ends without a header, is reported as [`ClusterError::AlignerFailed`].
pub struct HeaderGate<S> {
    source: S,
    saw_line: bool,
    saw_header: bool,
}

impl<S: AlignmentSource> HeaderGate<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            saw_line: false,
            saw_header: false,
        }
    }

    fn failed(&self, reason: &str) -> ClusterError {
        ClusterError::AlignerFailed {
            program: self.source.program().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Parse the next data line into `record`. Returns `false` at end.
    pub fn read_record(&mut self, record: &mut AlignmentRecord) -> Result<bool> {
        loop {
            let line_no = self.source.line_no() + 1;
            let Some(line) = self.source.next_line()? else {
                if !self.saw_line {
                    return Err(self.failed("produced no output"));
                }
                if !self.saw_header {
                    return Err(self.failed("produced no header line"));
                }
                return Ok(false);
            };
            self.saw_line = true;

            if line.starts_with('@') {
                self.saw_header = true;
                continue;
            }
            if line.is_empty() {
                continue;
            }
            if !self.saw_header {
                return Err(self.failed("alignment records arrived before any header line"));
            }
            record.parse_line(line, line_no)?;
            return Ok(true);
        }
    }

    /// Hand back the source, e.g. to call [`AlignmentSource::finish`]
    pub fn into_inner(self) -> S {
        self.source
    }

    pub fn finish(self) -> Result<()> {
        self.source.finish()
    }
}

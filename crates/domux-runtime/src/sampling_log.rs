use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use domux_core::types::{DomainName, ProbabilityVector};

/// Append-only record of how the sampling distribution evolved.
///
/// Line 1 is the comma-separated domain names; every later line is one probability
/// vector in domain order. The file is truncated when the log is created and flushed
/// after every line. A log created without a path accepts writes and discards them.
#[derive(Debug)]
pub struct SamplingLog {
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    lines_written: u64,
}

impl SamplingLog {
    pub fn create(path: Option<&Path>) -> io::Result<Self> {
        let writer = match path {
            Some(p) => {
                if let Some(parent) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                Some(BufWriter::new(File::create(p)?))
            }
            None => None,
        };
        Ok(Self {
            path: path.map(Path::to_path_buf),
            writer,
            lines_written: 0,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }

    pub fn append_header(&mut self, names: &[DomainName]) -> io::Result<()> {
        let line = names
            .iter()
            .map(|n| n.0.as_str())
            .collect::<Vec<_>>()
            .join(",");
        self.append_line(&line)
    }

    pub fn append_snapshot(&mut self, probabilities: &ProbabilityVector) -> io::Result<()> {
        self.append_line(&format_snapshot(probabilities))
    }

    fn append_line(&mut self, line: &str) -> io::Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
            writer.flush()?;
            self.lines_written += 1;
        }
        Ok(())
    }

    /// Flushes and releases the file.
    pub fn close(&mut self) -> io::Result<()> {
        match self.writer.take() {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for SamplingLog {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// `0.1,0.4,0.5` (shortest round-trip decimal per entry).
pub fn format_snapshot(probabilities: &ProbabilityVector) -> String {
    probabilities
        .as_slice()
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

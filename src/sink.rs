//! Append-only CSV output. Every row is flushed before `write_row` returns.

use crate::errors::{SinkError, SinkResult};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

/// One sweep of the register map
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Seconds since the Unix epoch at the start of the sweep
    pub timestamp: f64,
    /// One value per map entry, in map order
    pub values: Vec<u16>,
}

/// Destination for logged samples
pub trait Sink {
    fn write_header(&mut self, columns: &[String]) -> SinkResult<()>;
    fn write_row(&mut self, sample: &Sample) -> SinkResult<()>;
    fn flush(&mut self) -> SinkResult<()>;
}

pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
    columns: Option<usize>,
}

impl CsvSink<BufWriter<File>> {
    /// Create (truncate) the file at `path`
    pub fn create(path: &Path) -> SinkResult<Self> {
        let file = File::create(path).map_err(|source| SinkError::CreateError {
            path: path.display().to_string(),
            source,
        })?;
        debug!("[sink] writing to {}", path.display());
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> CsvSink<W> {
    pub fn new(inner: W) -> Self {
        let writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(inner);
        Self {
            writer,
            columns: None,
        }
    }

    pub fn into_inner(self) -> SinkResult<W> {
        self.writer
            .into_inner()
            .map_err(|e| SinkError::FlushError(e.into_error()))
    }
}

impl<W: Write> Sink for CsvSink<W> {
    fn write_header(&mut self, columns: &[String]) -> SinkResult<()> {
        self.writer
            .write_record(std::iter::once("timestamp").chain(columns.iter().map(String::as_str)))?;
        self.columns = Some(columns.len());
        self.flush()
    }

    fn write_row(&mut self, sample: &Sample) -> SinkResult<()> {
        if let Some(expected) = self.columns {
            if sample.values.len() != expected {
                return Err(SinkError::RowWidth {
                    expected,
                    actual: sample.values.len(),
                });
            }
        }
        let mut record = Vec::with_capacity(sample.values.len() + 1);
        record.push(format!("{:.3}", sample.timestamp));
        record.extend(sample.values.iter().map(|v| format!("{:04X}", v)));
        self.writer.write_record(&record)?;
        self.flush()
    }

    fn flush(&mut self) -> SinkResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

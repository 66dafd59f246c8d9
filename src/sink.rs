use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::error::Result;
use crate::flow::FeatureVector;

/// Destination for finished feature records, handed one at a time.
pub trait FeatureSink {
    fn write(&mut self, record: &FeatureVector) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// Tabular output. The header goes out once, before any record, so an empty
/// capture still produces a valid table.
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
}

impl CsvSink<File> {
    pub fn create(path: &Path) -> Result<Self> {
        Self::new(File::create(path)?)
    }
}

impl<W: Write> CsvSink<W> {
    pub fn new(inner: W) -> Result<Self> {
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(inner);
        writer.write_record(FeatureVector::HEADERS)?;
        Ok(Self { writer })
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| crate::error::FlowError::IoError(e.to_string()))
    }
}

impl<W: Write> FeatureSink for CsvSink<W> {
    fn write(&mut self, record: &FeatureVector) -> Result<()> {
        self.writer.serialize(record)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub records: Vec<FeatureVector>,
    pub flushes: usize,
}

impl FeatureSink for CollectingSink {
    fn write(&mut self, record: &FeatureVector) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

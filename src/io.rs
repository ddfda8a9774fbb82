use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use ahash::AHashMap;
use noodles::bam;
use noodles::sam::alignment::io::Write as _;
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::RecordBuf;
use noodles::sam::header::record::value::map::program::tag as program_tag;
use noodles::sam::header::record::value::map::{Map, Program};
use noodles::sam;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::fragment::{Fragment, FragmentStatus};
use crate::record::AlignmentRecord;
use crate::worker::OutputRecord;

/// Contig names of the input header, resolvable both ways.
#[derive(Debug)]
pub struct ReferenceDict {
    names: Vec<Arc<str>>,
    index: AHashMap<String, u32>,
}

impl ReferenceDict {
    pub fn from_header(header: &sam::Header) -> ReferenceDict {
        let mut names = Vec::new();
        let mut index = AHashMap::new();
        for (name, _) in header.reference_sequences() {
            let name: Arc<str> = Arc::from(String::from_utf8_lossy(name).into_owned().as_str());
            index.insert(name.to_string(), names.len() as u32);
            names.push(name);
        }
        ReferenceDict { names, index }
    }

    pub fn name(&self, id: usize) -> Option<Arc<str>> {
        self.names.get(id).cloned()
    }

    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.index.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// A genomic restriction: a contig, optionally with a 1-based inclusive range.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Region {
    pub chrom: String,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl Region {
    pub fn contains(&self, chrom: &str, pos: i64) -> bool {
        if self.chrom != chrom {
            return false;
        }
        self.start.map_or(true, |s| pos >= s) && self.end.map_or(true, |e| pos <= e)
    }
}

/// Decodes the input BAM into [`AlignmentRecord`]s and feeds the engine.
/// Reads from a file or stdin; the header and reference dictionary are read
/// at construction.
pub struct BamReader {
    inner: bam::io::Reader<noodles::bgzf::io::Reader<Box<dyn Read + Send>>>,
    header: sam::Header,
    dict: Arc<ReferenceDict>,
}

impl BamReader {
    pub fn open(path: Option<&Path>) -> Result<BamReader, BamIoError> {
        let read: Box<dyn Read + Send> = match path {
            Some(p) => Box::new(std::fs::File::open(p)?),
            None => Box::new(std::io::stdin()),
        };
        let mut inner = bam::io::Reader::new(read);
        let header = inner.read_header()?;
        let dict = Arc::new(ReferenceDict::from_header(&header));

        Ok(BamReader {
            inner,
            header,
            dict,
        })
    }

    pub fn header(&self) -> &sam::Header {
        &self.header
    }

    pub fn dict(&self) -> Arc<ReferenceDict> {
        Arc::clone(&self.dict)
    }

    /// Blocking read loop: in-scope records go to the engine, records outside
    /// the region restriction are copied to the sink unchanged.
    pub fn pump(
        mut self,
        regions: Vec<Region>,
        records: mpsc::Sender<AlignmentRecord>,
        bypass: mpsc::Sender<OutputRecord>,
    ) -> Result<(), BamIoError> {
        let mut record = bam::Record::default();
        loop {
            if self.inner.read_record(&mut record)? == 0 {
                break;
            }
            let decoded = self.decode(&record)?;

            let in_scope = regions.is_empty()
                || match (decoded.chrom(), decoded.start()) {
                    (Some(chrom), Some(pos)) => regions.iter().any(|r| r.contains(chrom, pos)),
                    _ => false,
                };

            if in_scope {
                records
                    .blocking_send(decoded)
                    .map_err(|_| BamIoError::ChannelClosed)?;
            } else {
                bypass
                    .blocking_send(OutputRecord::Fragment(Fragment::passthrough(decoded)))
                    .map_err(|_| BamIoError::ChannelClosed)?;
            }
        }
        Ok(())
    }

    fn decode(&self, record: &bam::Record) -> Result<AlignmentRecord, BamIoError> {
        let buf = RecordBuf::try_from_alignment_record(&self.header, record)?;

        let chrom = buf
            .reference_sequence_id()
            .and_then(|id| self.dict.name(id).map(|name| (name, id as u32)));
        let mate_chrom = buf
            .mate_reference_sequence_id()
            .and_then(|id| self.dict.name(id).map(|name| (name, Some(id as u32))));
        let umi = AlignmentRecord::resolve_umi(&buf);

        Ok(AlignmentRecord::from_parts(buf, chrom, mate_chrom, umi))
    }
}

/// Writes resolved fragments back out as BAM, flipping the duplicate flag per
/// the final classification and encoding consensus records as new alignments.
pub struct BamWriter {
    inner: bam::io::Writer<noodles::bgzf::io::Writer<Box<dyn Write + Send>>>,
    header: sam::Header,
}

impl BamWriter {
    pub fn create(path: Option<&Path>, mut header: sam::Header) -> Result<BamWriter, BamIoError> {
        let program = Map::<Program>::builder()
            .insert(program_tag::NAME, b"fragmark")
            .insert(program_tag::VERSION, env!("CARGO_PKG_VERSION").as_bytes())
            .build()
            .map_err(|e| BamIoError::Header(e.to_string()))?;
        header
            .programs_mut()
            .add("fragmark", program)
            .map_err(|e| BamIoError::Header(e.to_string()))?;

        let write: Box<dyn Write + Send> = match path {
            Some(p) => Box::new(std::fs::File::create(p)?),
            None => Box::new(std::io::stdout()),
        };
        let mut inner = bam::io::Writer::new(write);
        inner.write_header(&header)?;

        Ok(BamWriter { inner, header })
    }

    /// Blocking write loop, ends when every producer has hung up.
    pub fn drain(mut self, mut outputs: mpsc::Receiver<OutputRecord>) -> Result<(), BamIoError> {
        while let Some(output) = outputs.blocking_recv() {
            match output {
                OutputRecord::Fragment(fragment) => self.write_fragment(fragment)?,
                OutputRecord::Consensus(group) => {
                    for record in group.consensus {
                        self.write_record(record.into())?;
                    }
                }
            }
        }
        self.inner.into_inner().finish()?;
        Ok(())
    }

    fn write_fragment(&mut self, fragment: Fragment) -> Result<(), BamIoError> {
        let status = fragment.status();
        for record in fragment.into_records() {
            let mut buf: RecordBuf = record.into();
            if status.is_terminal() && !buf.flags().is_secondary() && !buf.flags().is_supplementary()
            {
                let mut flags = buf.flags();
                flags.set(Flags::DUPLICATE, status == FragmentStatus::Duplicate);
                *buf.flags_mut() = flags;
            }
            self.write_record(buf)?;
        }
        Ok(())
    }

    fn write_record(&mut self, buf: RecordBuf) -> Result<(), BamIoError> {
        self.inner.write_alignment_record(&self.header, &buf)?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum BamIoError {
    #[error("io error reading BAM")]
    Io(#[from] std::io::Error),
    #[error("error updating BAM header: {0}")]
    Header(String),
    #[error("record channel closed")]
    ChannelClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_containment() {
        let whole = Region {
            chrom: "chr1".to_string(),
            start: None,
            end: None,
        };
        assert!(whole.contains("chr1", 1));
        assert!(!whole.contains("chr2", 1));

        let span = Region {
            chrom: "chr1".to_string(),
            start: Some(100),
            end: Some(200),
        };
        assert!(span.contains("chr1", 100));
        assert!(span.contains("chr1", 200));
        assert!(!span.contains("chr1", 99));
        assert!(!span.contains("chr1", 201));
    }
}

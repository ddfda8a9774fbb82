use std::fmt;
use std::sync::Arc;

use noodles::sam::alignment::record::cigar::op::Kind;
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record_buf::data::field::Value;
use noodles::sam::alignment::RecordBuf;
use thiserror::Error;

/// One decoded alignment record plus the fields the engine resolves once at
/// construction: template name, contig name/index, mate contig, optional UMI.
///
/// The wrapped [`RecordBuf`] stays immutable for the lifetime of processing;
/// the output sink takes it back with [`From`] when the duplicate flag is
/// written out.
#[derive(Debug, Clone)]
pub struct AlignmentRecord {
    record: RecordBuf,
    name: String,
    chrom: Option<Arc<str>>,
    chrom_index: Option<u32>,
    mate_chrom: Option<Arc<str>>,
    mate_chrom_index: Option<u32>,
    start: Option<i64>,
    cigar_text: Option<String>,
    umi: Option<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum Strand {
    Forward,
    Reverse,
}

impl fmt::Display for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strand::Forward => write!(f, "F"),
            Strand::Reverse => write!(f, "R"),
        }
    }
}

impl AlignmentRecord {
    pub fn from_parts(
        record: RecordBuf,
        chrom: Option<(Arc<str>, u32)>,
        mate_chrom: Option<(Arc<str>, Option<u32>)>,
        umi: Option<Vec<u8>>,
    ) -> AlignmentRecord {
        let name = record
            .name()
            .map(|n| String::from_utf8_lossy(n).into_owned())
            .unwrap_or_default();
        let start = record.alignment_start().map(|p| p.get() as i64);
        let (chrom, chrom_index) = match chrom {
            Some((c, i)) => (Some(c), Some(i)),
            None => (None, None),
        };
        let (mate_chrom, mate_chrom_index) = match mate_chrom {
            Some((c, i)) => (Some(c), i),
            None => (None, None),
        };

        AlignmentRecord {
            record,
            name,
            chrom,
            chrom_index,
            mate_chrom,
            mate_chrom_index,
            start,
            cigar_text: None,
            umi,
        }
    }

    /// Attach a textual CIGAR used as fallback when the structured one is absent.
    pub fn with_cigar_text<T: Into<String>>(mut self, text: T) -> AlignmentRecord {
        self.cigar_text = Some(text.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> Flags {
        self.record.flags()
    }

    pub fn start(&self) -> Option<i64> {
        self.start
    }

    pub fn chrom(&self) -> Option<&Arc<str>> {
        self.chrom.as_ref()
    }

    pub fn chrom_index(&self) -> Option<u32> {
        self.chrom_index
    }

    pub fn mate_chrom(&self) -> Option<&Arc<str>> {
        self.mate_chrom.as_ref()
    }

    /// `None` when the mate is absent or maps to a contig outside the
    /// reference dictionary.
    pub fn mate_chrom_index(&self) -> Option<u32> {
        self.mate_chrom_index
    }

    pub fn mate_start(&self) -> Option<i64> {
        self.record.mate_alignment_start().map(|p| p.get() as i64)
    }

    pub fn umi(&self) -> Option<&[u8]> {
        self.umi.as_deref()
    }

    pub fn is_paired(&self) -> bool {
        self.flags().is_segmented()
    }

    pub fn is_first_of_pair(&self) -> bool {
        self.flags().is_first_segment()
    }

    pub fn is_reverse(&self) -> bool {
        self.flags().is_reverse_complemented()
    }

    pub fn is_mate_reverse(&self) -> bool {
        self.flags().is_mate_reverse_complemented()
    }

    pub fn is_mate_unmapped(&self) -> bool {
        self.flags().is_mate_unmapped()
    }

    pub fn is_marked_duplicate(&self) -> bool {
        self.flags().is_duplicate()
    }

    pub fn strand(&self) -> Strand {
        if self.is_reverse() {
            Strand::Reverse
        } else {
            Strand::Forward
        }
    }

    pub fn mate_strand(&self) -> Strand {
        if self.is_mate_reverse() {
            Strand::Reverse
        } else {
            Strand::Forward
        }
    }

    pub fn is_supplementary(&self) -> bool {
        self.flags().is_supplementary()
    }

    pub fn is_secondary(&self) -> bool {
        self.flags().is_secondary()
    }

    /// A record that can anchor or extend a fragment. Secondary alignments
    /// never take part in deduplication.
    pub fn is_dedup_candidate(&self) -> bool {
        !self.flags().is_unmapped()
            && !self.is_secondary()
            && self.start.is_some()
            && self.chrom.is_some()
    }

    /// The primary alignment line of a template side.
    pub fn is_primary_alignment(&self) -> bool {
        !self.is_secondary() && !self.is_supplementary()
    }

    /// Sum and count of base qualities, used for primary fragment election.
    pub fn quality_total(&self) -> (u64, u64) {
        let quals = self.record.quality_scores().as_ref();
        let sum = quals.iter().map(|&q| q as u64).sum();
        (sum, quals.len() as u64)
    }

    /// The alignment boundary adjusted for leading soft clips: the position
    /// the fragment truly starts at on the forward strand.
    pub fn unclipped_start(&self) -> Result<i64, RecordError> {
        let start = self.start.ok_or(RecordError::MissingPosition)?;
        let ops = self.record.cigar().as_ref();
        if !ops.is_empty() {
            Ok(start - leading_soft_clip(ops))
        } else if let Some(text) = &self.cigar_text {
            unclipped_start_text(start, text)
        } else {
            Err(RecordError::MissingCigar)
        }
    }

    /// The alignment end adjusted for trailing soft clips: the true fragment
    /// end of a reverse strand read.
    pub fn unclipped_end(&self) -> Result<i64, RecordError> {
        let start = self.start.ok_or(RecordError::MissingPosition)?;
        let ops = self.record.cigar().as_ref();
        if !ops.is_empty() {
            Ok(start + reference_length(ops) - 1 + trailing_soft_clip(ops))
        } else if let Some(text) = &self.cigar_text {
            unclipped_end_text(start, text)
        } else {
            Err(RecordError::MissingCigar)
        }
    }

    /// Unclipped boundary in the direction away from the sequenced insert.
    pub fn unclipped_position(&self) -> Result<i64, RecordError> {
        if self.is_reverse() {
            self.unclipped_end()
        } else {
            self.unclipped_start()
        }
    }

    pub(crate) fn record(&self) -> &RecordBuf {
        &self.record
    }

    pub(crate) fn record_mut(&mut self) -> &mut RecordBuf {
        &mut self.record
    }

    pub(crate) fn set_name(&mut self, name: String) {
        *self.record.name_mut() = Some(name.as_bytes().to_vec().into());
        self.name = name;
    }

    #[cfg(test)]
    pub(crate) fn set_umi(&mut self, umi: Option<Vec<u8>>) {
        self.umi = umi;
    }

    /// UMI from the trailing read name segment, or from the RX tag.
    pub fn resolve_umi(record: &RecordBuf) -> Option<Vec<u8>> {
        if let Some(name) = record.name() {
            let maybe_umi = name.rsplit(|&b| b == b':').next();
            if let Some(umi) = maybe_umi {
                if umi.len() > 3 && umi.iter().all(|b| is_base(*b)) {
                    return Some(umi.to_vec());
                }
            }
        }

        match record.data().get(&Tag::new(b'R', b'X')) {
            Some(Value::String(s)) => Some(s.to_vec()),
            _ => None,
        }
    }
}

impl From<AlignmentRecord> for RecordBuf {
    fn from(r: AlignmentRecord) -> RecordBuf {
        r.record
    }
}

pub fn is_base(b: u8) -> bool {
    matches!(b, b'A' | b'C' | b'G' | b'T' | b'N')
}

fn leading_soft_clip(ops: &[noodles::sam::alignment::record::cigar::Op]) -> i64 {
    ops.iter()
        .take_while(|op| matches!(op.kind(), Kind::SoftClip | Kind::HardClip))
        .filter(|op| op.kind() == Kind::SoftClip)
        .map(|op| op.len() as i64)
        .sum()
}

fn trailing_soft_clip(ops: &[noodles::sam::alignment::record::cigar::Op]) -> i64 {
    ops.iter()
        .rev()
        .take_while(|op| matches!(op.kind(), Kind::SoftClip | Kind::HardClip))
        .filter(|op| op.kind() == Kind::SoftClip)
        .map(|op| op.len() as i64)
        .sum()
}

fn reference_length(ops: &[noodles::sam::alignment::record::cigar::Op]) -> i64 {
    ops.iter()
        .filter(|op| op.kind().consumes_reference())
        .map(|op| op.len() as i64)
        .sum()
}

/// Scan a run-length encoded CIGAR string. Returns
/// `(leading_soft, reference_length, trailing_soft)`.
///
/// Kept in exact parity with the structured path above for any record where
/// both are defined.
fn scan_cigar_text(text: &str) -> Result<(i64, i64, i64), RecordError> {
    let bytes = text.as_bytes();
    if bytes.is_empty() {
        return Err(RecordError::MissingCigar);
    }

    let mut i = 0;
    let mut leading = 0i64;
    let mut reference = 0i64;
    let mut trailing = 0i64;
    let mut seen_aligned = false;

    while i < bytes.len() {
        let (len, used) = lexical_core::parse_partial::<u32>(&bytes[i..])
            .map_err(|_| RecordError::UnusableCigar(text.to_string()))?;
        if used == 0 {
            return Err(RecordError::UnusableCigar(text.to_string()));
        }
        i += used;
        let op = bytes
            .get(i)
            .ok_or_else(|| RecordError::UnusableCigar(text.to_string()))?;
        i += 1;

        match op {
            b'M' | b'D' | b'N' | b'=' | b'X' => {
                reference += len as i64;
                seen_aligned = true;
                trailing = 0;
            }
            b'S' => {
                if seen_aligned {
                    trailing += len as i64;
                } else {
                    leading += len as i64;
                }
            }
            b'I' => {
                seen_aligned = true;
                trailing = 0;
            }
            b'H' | b'P' => {}
            _ => return Err(RecordError::UnusableCigar(text.to_string())),
        }
    }

    Ok((leading, reference, trailing))
}

pub fn unclipped_start_text(start: i64, text: &str) -> Result<i64, RecordError> {
    let (leading, _, _) = scan_cigar_text(text)?;
    Ok(start - leading)
}

pub fn unclipped_end_text(start: i64, text: &str) -> Result<i64, RecordError> {
    let (_, reference, trailing) = scan_cigar_text(text)?;
    Ok(start + reference - 1 + trailing)
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record has no alignment position")]
    MissingPosition,
    #[error("record has no usable CIGAR")]
    MissingCigar,
    #[error("unusable CIGAR string: {0}")]
    UnusableCigar(String),
    #[error("fragment has no primary alignment record")]
    NoPrimaryRead,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::rec;

    #[test]
    fn unclipped_forward() {
        let r = rec("t1", "chr1", 0, 1000, "5S95M", false);
        assert_eq!(r.unclipped_start().unwrap(), 995);
        assert_eq!(r.unclipped_position().unwrap(), 995);
    }

    #[test]
    fn unclipped_reverse() {
        let r = rec("t1", "chr1", 0, 1000, "90M3D10S", true);
        // end = 1000 + 93 - 1, plus the trailing clip
        assert_eq!(r.unclipped_end().unwrap(), 1102);
        assert_eq!(r.unclipped_position().unwrap(), 1102);
    }

    #[test]
    fn text_fallback_parity() {
        for (cigar, reverse) in [
            ("5S95M", false),
            ("90M3D10S", true),
            ("10S80M2I8M5S", true),
            ("100M", false),
            ("3H5S90M2S4H", true),
            ("40M1000N60M", false),
        ] {
            let structured = rec("t", "chr1", 0, 5000, cigar, reverse);
            let text_only = crate::testutil::rec_text_cigar("t", "chr1", 0, 5000, cigar, reverse);
            assert_eq!(
                unclipped_start_text(5000, cigar).unwrap(),
                structured.unclipped_start().unwrap(),
                "{cigar}"
            );
            assert_eq!(
                unclipped_end_text(5000, cigar).unwrap(),
                structured.unclipped_end().unwrap(),
                "{cigar}"
            );
            assert_eq!(
                text_only.unclipped_position().unwrap(),
                structured.unclipped_position().unwrap(),
                "{cigar}"
            );
        }
    }

    #[test]
    fn unusable_text_cigar() {
        assert!(matches!(
            unclipped_start_text(100, "12Q"),
            Err(RecordError::UnusableCigar(_))
        ));
        assert!(matches!(
            unclipped_start_text(100, "MM"),
            Err(RecordError::UnusableCigar(_))
        ));
        assert!(matches!(
            unclipped_start_text(100, ""),
            Err(RecordError::MissingCigar)
        ));
    }

    #[test]
    fn umi_from_read_name() {
        let r = rec("A00154:TTAGGACG", "chr1", 0, 100, "50M", false);
        assert_eq!(
            AlignmentRecord::resolve_umi(r.record()),
            Some(b"TTAGGACG".to_vec())
        );

        let r = rec("A00154:1203", "chr1", 0, 100, "50M", false);
        assert_eq!(AlignmentRecord::resolve_umi(r.record()), None);
    }
}

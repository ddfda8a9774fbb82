//! Shared builders for synthetic records in unit tests.

use std::sync::Arc;

use noodles::core::Position;
use noodles::sam::alignment::record::cigar::{op::Kind, Op};
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record_buf::{QualityScores, Sequence};
use noodles::sam::alignment::RecordBuf;

use crate::fragment::Fragment;
use crate::record::AlignmentRecord;

pub fn ops(text: &str) -> Vec<Op> {
    let mut ops = Vec::new();
    let mut len = 0usize;
    for b in text.bytes() {
        if b.is_ascii_digit() {
            len = len * 10 + (b - b'0') as usize;
        } else {
            let kind = match b {
                b'M' => Kind::Match,
                b'I' => Kind::Insertion,
                b'D' => Kind::Deletion,
                b'N' => Kind::Skip,
                b'S' => Kind::SoftClip,
                b'H' => Kind::HardClip,
                b'P' => Kind::Pad,
                b'=' => Kind::SequenceMatch,
                b'X' => Kind::SequenceMismatch,
                _ => panic!("bad cigar op {}", b as char),
            };
            ops.push(Op::new(kind, len));
            len = 0;
        }
    }
    ops
}

fn query_len(ops: &[Op]) -> usize {
    ops.iter()
        .filter(|op| op.kind().consumes_read())
        .map(|op| op.len())
        .sum()
}

fn base_buf(name: &str, start: i64, cigar: &str, flags: Flags) -> RecordBuf {
    let mut buf = RecordBuf::default();
    *buf.name_mut() = Some(name.as_bytes().to_vec().into());
    *buf.flags_mut() = flags;
    *buf.reference_sequence_id_mut() = Some(0);
    *buf.alignment_start_mut() = Some(Position::try_from(start as usize).unwrap());

    let ops = ops(cigar);
    let qlen = query_len(&ops);
    *buf.cigar_mut() = ops.into_iter().collect();
    *buf.sequence_mut() = Sequence::from(vec![b'A'; qlen]);
    *buf.quality_scores_mut() = QualityScores::from(vec![30u8; qlen]);

    buf
}

/// An unpaired mapped record.
pub fn rec(
    name: &str,
    chrom: &str,
    chrom_index: u32,
    start: i64,
    cigar: &str,
    reverse: bool,
) -> AlignmentRecord {
    let mut flags = Flags::empty();
    if reverse {
        flags |= Flags::REVERSE_COMPLEMENTED;
    }
    AlignmentRecord::from_parts(
        base_buf(name, start, cigar, flags),
        Some((Arc::from(chrom), chrom_index)),
        None,
        None,
    )
}

/// A mapped record carrying only a textual CIGAR, for the fallback path.
pub fn rec_text_cigar(
    name: &str,
    chrom: &str,
    chrom_index: u32,
    start: i64,
    cigar: &str,
    reverse: bool,
) -> AlignmentRecord {
    let mut flags = Flags::empty();
    if reverse {
        flags |= Flags::REVERSE_COMPLEMENTED;
    }

    let mut buf = RecordBuf::default();
    *buf.name_mut() = Some(name.as_bytes().to_vec().into());
    *buf.flags_mut() = flags;
    *buf.reference_sequence_id_mut() = Some(0);
    *buf.alignment_start_mut() = Some(Position::try_from(start as usize).unwrap());

    AlignmentRecord::from_parts(buf, Some((Arc::from(chrom), chrom_index)), None, None)
        .with_cigar_text(cigar)
}

/// One side of a mapped pair.
#[allow(clippy::too_many_arguments)]
pub fn pair_rec(
    name: &str,
    chrom: &str,
    chrom_index: u32,
    start: i64,
    cigar: &str,
    reverse: bool,
    mate_chrom: &str,
    mate_index: Option<u32>,
    mate_start: i64,
    mate_reverse: bool,
    first: bool,
) -> AlignmentRecord {
    let mut flags = Flags::SEGMENTED;
    if reverse {
        flags |= Flags::REVERSE_COMPLEMENTED;
    }
    if mate_reverse {
        flags |= Flags::MATE_REVERSE_COMPLEMENTED;
    }
    flags |= if first {
        Flags::FIRST_SEGMENT
    } else {
        Flags::LAST_SEGMENT
    };

    let mut buf = base_buf(name, start, cigar, flags);
    *buf.mate_reference_sequence_id_mut() = Some(mate_index.unwrap_or(0) as usize);
    *buf.mate_alignment_start_mut() = Some(Position::try_from(mate_start as usize).unwrap());

    AlignmentRecord::from_parts(
        buf,
        Some((Arc::from(chrom), chrom_index)),
        Some((Arc::from(mate_chrom), mate_index)),
        None,
    )
}

/// Single-end fragment on chr1.
pub fn se_fragment(name: &str, start: i64, reverse: bool) -> Fragment {
    Fragment::new(rec(name, "chr1", 0, start, "50M", reverse)).unwrap()
}

/// Complete forward/reverse pair on chr1, both reads 100M.
pub fn pair_fragment(name: &str, start: i64, mate_start: i64) -> Fragment {
    let first = pair_rec(
        name, "chr1", 0, start, "100M", false, "chr1", Some(0), mate_start, true, true,
    );
    let second = pair_rec(
        name, "chr1", 0, mate_start, "100M", true, "chr1", Some(0), start, false, false,
    );
    let mut fragment = Fragment::new(first).unwrap();
    fragment.push(second);
    fragment
}

/// Forward half of a pair whose reverse mate has not arrived.
pub fn half_fragment(name: &str, start: i64, mate_start: i64) -> Fragment {
    Fragment::new(pair_rec(
        name, "chr1", 0, start, "100M", false, "chr1", Some(0), mate_start, true, true,
    ))
    .unwrap()
}

/// Single-end fragment with explicit sequence and qualities.
pub fn se_fragment_with(
    name: &str,
    start: i64,
    cigar: &str,
    seq: &[u8],
    quals: &[u8],
) -> Fragment {
    let mut record = rec(name, "chr1", 0, start, cigar, false);
    {
        let buf = record.record_mut();
        *buf.sequence_mut() = Sequence::from(seq.to_vec());
        *buf.quality_scores_mut() = QualityScores::from(quals.to_vec());
    }
    Fragment::new(record).unwrap()
}

pub fn set_qualities(fragment: &mut Fragment, quality: u8) {
    for record in fragment.records_mut() {
        let len = record.record().quality_scores().as_ref().len();
        *record.record_mut().quality_scores_mut() = QualityScores::from(vec![quality; len]);
    }
}

pub fn set_umi(fragment: &mut Fragment, umi: &[u8]) {
    fragment.records_mut()[0].set_umi(Some(umi.to_vec()));
}

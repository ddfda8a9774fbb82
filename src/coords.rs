use std::sync::Arc;

use crate::record::{AlignmentRecord, RecordError, Strand};

/// Content key identifying the physical molecule a fragment came from.
///
/// `key` holds one or two `chrom:unclipped_pos:strand` components. With both
/// ends known the components are ordered by the lower genomic coordinate, so
/// the key is independent of which read of the pair was encountered first.
/// Two fragments from the same molecule with full mate information always
/// produce identical keys.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FragmentCoords {
    pub key: String,
    pub strand_position: i64,
    pub has_mate_info: bool,
}

struct Side {
    chrom: Arc<str>,
    chrom_index: u32,
    pos: i64,
    strand: Strand,
}

impl Side {
    fn of(record: &AlignmentRecord) -> Result<Side, RecordError> {
        let (chrom, chrom_index) = record
            .chrom()
            .cloned()
            .zip(record.chrom_index())
            .ok_or(RecordError::MissingPosition)?;
        let pos = record.unclipped_position()?;

        Ok(Side {
            chrom,
            chrom_index,
            pos,
            strand: record.strand(),
        })
    }

    fn signed_pos(&self) -> i64 {
        match self.strand {
            Strand::Forward => self.pos,
            Strand::Reverse => -self.pos,
        }
    }

    fn component(&self) -> String {
        format!("{}:{}:{}", self.chrom, self.pos, self.strand)
    }
}

impl FragmentCoords {
    /// Derive coordinates from the records gathered for one template.
    ///
    /// The first non-supplementary, non-secondary record is the anchor; a
    /// second one, if present, is its mate. Unpaired reads and reads with an
    /// unmapped mate key on the single known side and are complete as-is.
    pub fn from_records(records: &[AlignmentRecord]) -> Result<FragmentCoords, RecordError> {
        let mut primaries = records.iter().filter(|r| r.is_primary_alignment());
        let anchor = primaries.next().ok_or(RecordError::NoPrimaryRead)?;
        let mate = primaries.next();

        let side = Side::of(anchor)?;

        if !anchor.is_paired() || anchor.is_mate_unmapped() {
            return Ok(FragmentCoords {
                key: side.component(),
                strand_position: side.signed_pos(),
                has_mate_info: true,
            });
        }

        match mate {
            None => Ok(FragmentCoords {
                key: side.component(),
                strand_position: side.signed_pos(),
                has_mate_info: false,
            }),
            Some(mate) => {
                let other = Side::of(mate)?;
                let strand_position = side.signed_pos();

                let (first, second) = if (other.chrom_index, other.pos) < (side.chrom_index, side.pos)
                {
                    (&other, &side)
                } else {
                    (&side, &other)
                };

                Ok(FragmentCoords {
                    key: format!("{}_{}", first.component(), second.component()),
                    strand_position,
                    has_mate_info: true,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{pair_rec, rec};

    #[test]
    fn single_end_key() {
        let r = rec("t1", "chr1", 0, 1000, "5S95M", false);
        let coords = FragmentCoords::from_records(std::slice::from_ref(&r)).unwrap();
        assert_eq!(coords.key, "chr1:995:F");
        assert_eq!(coords.strand_position, 995);
        assert!(coords.has_mate_info);
    }

    #[test]
    fn single_end_reverse_is_negative() {
        let r = rec("t1", "chr1", 0, 1000, "100M", true);
        let coords = FragmentCoords::from_records(std::slice::from_ref(&r)).unwrap();
        assert_eq!(coords.key, "chr1:1099:R");
        assert_eq!(coords.strand_position, -1099);
    }

    #[test]
    fn missing_mate_flagged() {
        let r = pair_rec(
            "t1", "chr1", 0, 1000, "100M", false, "chr1", Some(0), 1200, true, true,
        );
        let coords = FragmentCoords::from_records(std::slice::from_ref(&r)).unwrap();
        assert!(!coords.has_mate_info);
        assert_eq!(coords.key, "chr1:1000:F");
    }

    #[test]
    fn key_symmetry() {
        let a = pair_rec(
            "t1", "chr1", 0, 1000, "100M", false, "chr1", Some(0), 1200, true, true,
        );
        let b = pair_rec(
            "t1", "chr1", 0, 1200, "100M", true, "chr1", Some(0), 1000, false, false,
        );

        let ab = FragmentCoords::from_records(&[a.clone(), b.clone()]).unwrap();
        let ba = FragmentCoords::from_records(&[b, a]).unwrap();
        assert_eq!(ab.key, ba.key);
        assert!(ab.has_mate_info && ba.has_mate_info);
        assert_eq!(ab.key, "chr1:1000:F_chr1:1299:R");
    }

    #[test]
    fn cross_chromosome_orders_by_contig_index() {
        let a = pair_rec(
            "t1", "chr2", 1, 500, "100M", false, "chr1", Some(0), 9000, true, true,
        );
        let b = pair_rec(
            "t1", "chr1", 0, 9000, "100M", true, "chr2", Some(1), 500, false, false,
        );
        let coords = FragmentCoords::from_records(&[a, b]).unwrap();
        assert_eq!(coords.key, "chr1:9099:R_chr2:500:F");
    }
}

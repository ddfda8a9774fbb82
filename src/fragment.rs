use std::sync::Arc;

use smallvec::{smallvec, SmallVec};

use crate::coords::FragmentCoords;
use crate::record::{AlignmentRecord, RecordError, Strand};

/// Classification state of a fragment. `None`, `Duplicate` and `Primary` are
/// terminal; `Unclear` is provisional and is revisited once more mate
/// information becomes available.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FragmentStatus {
    Unresolved,
    None,
    Duplicate,
    Unclear,
    Primary,
}

impl FragmentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FragmentStatus::None | FragmentStatus::Duplicate | FragmentStatus::Primary
        )
    }
}

/// The alignment records belonging to one template molecule, together with
/// the classification status and the position the fragment entered the
/// stream at.
#[derive(Clone, Debug)]
pub struct Fragment {
    records: SmallVec<[AlignmentRecord; 2]>,
    status: FragmentStatus,
    initial_position: i64,
    duplicate_count: u32,
    coords: FragmentCoords,
}

impl Fragment {
    /// Open a fragment from its first gathered record. The record comes back
    /// on failure so a malformed read can still be written out as-is.
    pub fn new(record: AlignmentRecord) -> Result<Fragment, (AlignmentRecord, RecordError)> {
        let coords = match FragmentCoords::from_records(std::slice::from_ref(&record)) {
            Ok(coords) => coords,
            Err(e) => return Err((record, e)),
        };
        let initial_position = coords.strand_position;

        Ok(Fragment {
            records: smallvec![record],
            status: FragmentStatus::Unresolved,
            initial_position,
            duplicate_count: 1,
            coords,
        })
    }

    /// Wrap a record that skips classification and is written out unchanged.
    pub fn passthrough(record: AlignmentRecord) -> Fragment {
        Fragment {
            records: smallvec![record],
            status: FragmentStatus::Unresolved,
            initial_position: 0,
            duplicate_count: 1,
            coords: FragmentCoords {
                key: String::new(),
                strand_position: 0,
                has_mate_info: true,
            },
        }
    }

    /// A late arriving mate taking over the status its fragment resolved to.
    pub fn adopted(record: AlignmentRecord, status: FragmentStatus) -> Fragment {
        let mut fragment = Fragment::passthrough(record);
        fragment.status = status;
        fragment
    }

    /// Add a record of the same template. Coordinates are refreshed; when the
    /// new record cannot contribute (no usable CIGAR) the partial coordinates
    /// are kept and the fragment resolves on those.
    pub fn push(&mut self, record: AlignmentRecord) {
        self.records.push(record);
        match FragmentCoords::from_records(&self.records) {
            Ok(coords) => self.coords = coords,
            Err(e) => log::warn!(
                "fragment {}: keeping partial coordinates: {}",
                self.name(),
                e
            ),
        }
    }

    pub fn name(&self) -> &str {
        self.records[0].name()
    }

    pub fn records(&self) -> &[AlignmentRecord] {
        &self.records
    }

    #[cfg(test)]
    pub(crate) fn records_mut(&mut self) -> &mut [AlignmentRecord] {
        &mut self.records
    }

    pub fn into_records(self) -> SmallVec<[AlignmentRecord; 2]> {
        self.records
    }

    pub fn coords(&self) -> &FragmentCoords {
        &self.coords
    }

    pub fn status(&self) -> FragmentStatus {
        self.status
    }

    /// Transition the classification status. Terminal statuses are final.
    pub fn resolve(&mut self, status: FragmentStatus) {
        debug_assert!(
            !self.status.is_terminal(),
            "fragment {} already resolved {:?}",
            self.name(),
            self.status
        );
        self.status = status;
    }

    pub fn initial_position(&self) -> i64 {
        self.initial_position
    }

    pub fn duplicate_count(&self) -> u32 {
        self.duplicate_count
    }

    pub fn set_duplicate_count(&mut self, count: u32) {
        self.duplicate_count = count;
    }

    fn anchor(&self) -> &AlignmentRecord {
        &self.records[0]
    }

    pub fn start(&self) -> i64 {
        self.anchor().start().unwrap_or(0)
    }

    pub fn chrom(&self) -> Option<&Arc<str>> {
        self.anchor().chrom()
    }

    pub fn is_paired(&self) -> bool {
        self.anchor().is_paired()
    }

    pub fn mate_chrom_index(&self) -> Option<u32> {
        self.anchor().mate_chrom_index()
    }

    pub fn mate_start(&self) -> Option<i64> {
        self.anchor().mate_start()
    }

    pub fn mate_strand(&self) -> Strand {
        self.anchor().mate_strand()
    }

    fn primary_read_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.is_primary_alignment())
            .count()
    }

    /// Whether every read that can contribute coordinates has been gathered.
    pub fn is_complete(&self) -> bool {
        let anchor = self.anchor();
        !anchor.is_paired()
            || anchor.is_mate_unmapped()
            || anchor.mate_chrom_index().is_none()
            || self.primary_read_count() >= 2
    }

    /// A mapped mate record is still expected somewhere downstream.
    pub fn awaits_mate(&self) -> bool {
        let anchor = self.anchor();
        anchor.is_paired()
            && !anchor.is_mate_unmapped()
            && anchor.mate_chrom_index().is_some()
            && self.primary_read_count() < 2
    }

    pub fn has_existing_duplicate_flag(&self) -> bool {
        self.records.iter().any(|r| r.is_marked_duplicate())
    }

    /// Total quality and base count over the non-supplementary reads.
    pub fn quality_total(&self) -> (u64, u64) {
        self.records
            .iter()
            .filter(|r| r.is_primary_alignment())
            .map(|r| r.quality_total())
            .fold((0, 0), |(s, c), (rs, rc)| (s + rs, c + rc))
    }

    /// Strand of read one of the template, the sequencing orientation of the
    /// molecule. Derived from read two when read one was not gathered.
    pub fn orientation(&self) -> Strand {
        for r in self.records.iter().filter(|r| r.is_primary_alignment()) {
            if !r.is_paired() || r.is_first_of_pair() {
                return r.strand();
            }
        }
        match self.anchor().strand() {
            Strand::Forward => Strand::Reverse,
            Strand::Reverse => Strand::Forward,
        }
    }

    /// The primary record for one side of the template, used when building
    /// per-leg consensus. Unpaired templates only carry the read-one leg.
    pub fn leg_record(&self, first: bool) -> Option<&AlignmentRecord> {
        self.records
            .iter()
            .filter(|r| r.is_primary_alignment())
            .find(|r| {
                if r.is_paired() {
                    r.is_first_of_pair() == first
                } else {
                    first
                }
            })
    }
}

/// A deferred decision group: fragments at one position whose duplicate
/// status needs mate information that has not arrived yet.
#[derive(Clone, Debug)]
pub struct CandidateDuplicates {
    pub position: i64,
    pub fragments: Vec<Fragment>,
}

impl CandidateDuplicates {
    pub fn is_complete(&self) -> bool {
        self.fragments.iter().all(|f| f.is_complete())
    }
}

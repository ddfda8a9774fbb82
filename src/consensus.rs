use noodles::sam::alignment::record::cigar::op::Kind;
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record_buf::data::field::Value;
use noodles::sam::alignment::record_buf::{QualityScores, Sequence};
use smallvec::SmallVec;

use crate::fragment::{Fragment, FragmentStatus};
use crate::record::{AlignmentRecord, Strand};
use crate::umi::UmiTree;

const VOTE_BASES: [u8; 5] = [b'A', b'C', b'G', b'T', b'N'];
const NO_CONSENSUS_QUAL: u8 = 2;

/// A UMI sub-group of one duplicate cluster, with the synthesized consensus
/// record per template leg.
#[derive(Debug)]
pub struct UmiGroup {
    pub umi: Vec<u8>,
    pub fragments: Vec<String>,
    pub consensus: SmallVec<[AlignmentRecord; 2]>,
    pub dual_strand: bool,
}

/// Sub-groups resolved duplicate clusters by UMI and collapses each sub-group
/// into one consensus record per leg by majority base vote.
#[derive(Debug)]
pub struct UmiConsensusBuilder {
    max_distance: usize,
}

impl UmiConsensusBuilder {
    pub fn new(max_distance: usize) -> UmiConsensusBuilder {
        UmiConsensusBuilder { max_distance }
    }

    /// Build the UMI groups of one duplicate cluster. Members without a UMI
    /// are skipped and reported in the second return value.
    pub fn build_groups(&self, members: &[&Fragment]) -> (Vec<UmiGroup>, usize) {
        let mut tree = UmiTree::new();
        let mut missing = 0;

        for (i, fragment) in members.iter().enumerate() {
            match fragment.records()[0].umi() {
                Some(umi) => tree.insert(umi, i),
                None => missing += 1,
            }
        }

        if tree.is_empty() {
            return (Vec::new(), missing);
        }

        let mut groups = Vec::new();
        for cluster in tree.clusters(self.max_distance) {
            let group_members: Vec<&Fragment> =
                cluster.members.iter().map(|&i| members[i]).collect();

            let forward = group_members
                .iter()
                .any(|f| f.orientation() == Strand::Forward);
            let reverse = group_members
                .iter()
                .any(|f| f.orientation() == Strand::Reverse);

            let dual_strand = forward && reverse;
            let mut consensus = SmallVec::new();
            for first in [true, false] {
                if let Some(record) =
                    self.consensus_leg(&group_members, &cluster.umi, first, dual_strand)
                {
                    consensus.push(record);
                }
            }

            groups.push(UmiGroup {
                umi: cluster.umi,
                fragments: group_members
                    .iter()
                    .map(|f| f.name().to_string())
                    .collect(),
                consensus,
                dual_strand,
            });
        }

        (groups, missing)
    }

    /// One consensus record for a template side. Members vote per position;
    /// only members matching the leg's majority alignment geometry take part.
    fn consensus_leg(
        &self,
        members: &[&Fragment],
        umi: &[u8],
        first: bool,
        dual_strand: bool,
    ) -> Option<AlignmentRecord> {
        let legs: Vec<(&Fragment, &AlignmentRecord)> = members
            .iter()
            .filter_map(|f| f.leg_record(first).map(|r| (*f, r)))
            .collect();
        if legs.is_empty() {
            return None;
        }

        let majority = majority_geometry(&legs)?;
        let voters: Vec<&AlignmentRecord> = legs
            .iter()
            .filter(|(_, r)| geometry_key(r) == majority)
            .map(|(_, r)| *r)
            .collect();

        // template record: the elected primary if it votes, else the first voter
        let template = legs
            .iter()
            .find(|(f, r)| {
                f.status() == FragmentStatus::Primary && geometry_key(r) == majority
            })
            .map(|(_, r)| *r)
            .unwrap_or(voters[0]);

        let length = template.record().sequence().as_ref().len();
        let mut bases = Vec::with_capacity(length);
        let mut quals = Vec::with_capacity(length);

        for i in 0..length {
            let mut counts = [0usize; VOTE_BASES.len()];
            let mut best_qual = [0u8; VOTE_BASES.len()];
            let mut total = 0usize;

            for voter in &voters {
                let seq = voter.record().sequence().as_ref();
                if seq.len() != length {
                    continue;
                }
                let base = seq[i].to_ascii_uppercase();
                let qual = voter
                    .record()
                    .quality_scores()
                    .as_ref()
                    .get(i)
                    .copied()
                    .unwrap_or(0);
                total += 1;
                if let Some(slot) = VOTE_BASES.iter().position(|&b| b == base) {
                    counts[slot] += 1;
                    if qual > best_qual[slot] {
                        best_qual[slot] = qual;
                    }
                }
            }

            let winner = (0..VOTE_BASES.len()).max_by_key(|&s| counts[s]).unwrap_or(4);
            if total > 0 && counts[winner] * 2 > total {
                bases.push(VOTE_BASES[winner]);
                quals.push(best_qual[winner]);
            } else {
                bases.push(b'N');
                quals.push(NO_CONSENSUS_QUAL);
            }
        }

        let mut record = template.clone();
        record.set_name(format!("{}:CNS", template.name()));
        {
            let buf = record.record_mut();
            let mut flags = buf.flags();
            flags.set(Flags::DUPLICATE, false);
            *buf.flags_mut() = flags;
            *buf.sequence_mut() = Sequence::from(bases);
            *buf.quality_scores_mut() = QualityScores::from(quals);

            let data = buf.data_mut();
            data.insert(Tag::new(b'R', b'X'), Value::String(umi.to_vec().into()));
            data.insert(Tag::new(b'D', b'P'), Value::from(voters.len() as i32));
            data.insert(Tag::new(b'D', b'S'), Value::from(dual_strand as i32));
        }

        Some(record)
    }
}

type GeometryKey = (i64, String);

fn geometry_key(record: &AlignmentRecord) -> GeometryKey {
    let cigar: String = record
        .record()
        .cigar()
        .as_ref()
        .iter()
        .map(|op| format!("{}{}", op.len(), kind_symbol(op.kind())))
        .collect();
    (record.start().unwrap_or(0), cigar)
}

fn kind_symbol(kind: Kind) -> char {
    match kind {
        Kind::Match => 'M',
        Kind::Insertion => 'I',
        Kind::Deletion => 'D',
        Kind::Skip => 'N',
        Kind::SoftClip => 'S',
        Kind::HardClip => 'H',
        Kind::Pad => 'P',
        Kind::SequenceMatch => '=',
        Kind::SequenceMismatch => 'X',
    }
}

/// Most common `(start, cigar)` combination, lowest key on ties.
fn majority_geometry(legs: &[(&Fragment, &AlignmentRecord)]) -> Option<GeometryKey> {
    let mut counts: Vec<(GeometryKey, usize)> = Vec::new();
    for (_, record) in legs {
        let key = geometry_key(record);
        match counts.iter_mut().find(|(k, _)| *k == key) {
            Some((_, n)) => *n += 1,
            None => counts.push((key, 1)),
        }
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(key, _)| key)
}

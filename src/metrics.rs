use std::fmt;

/// Deduplication counters, kept per chromosome and merged into an aggregate
/// at the end of the run.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    pub total_records: usize,
    pub passthrough_records: usize,
    pub unique_fragments: usize,
    pub duplicate_fragments: usize,
    pub primary_fragments: usize,
    pub deferred_fragments: usize,
    pub adopted_mates: usize,
    pub cross_partition_records: usize,
    pub missing_mate_info: usize,
    pub forced_unresolved: usize,
    pub integrity_failures: usize,
    pub umi_groups: usize,
    pub dual_strand_groups: usize,
    pub missing_umis: usize,
}

pub enum Status {
    Passthrough,
    UniqueFragment,
    DuplicateFragment,
    PrimaryFragment,
    DeferredFragment,
    AdoptedMate,
    CrossPartition,
    MissingMateInfo,
    ForcedUnresolved,
    IntegrityFailure,
    UmiGroup,
    DualStrandGroup,
    MissingUmi,
}

impl Metrics {
    pub fn count(&mut self, status: Status) {
        self.count_many(status, 1);
    }

    pub fn count_many(&mut self, status: Status, count: usize) {
        match status {
            Status::Passthrough => self.passthrough_records += count,
            Status::UniqueFragment => self.unique_fragments += count,
            Status::DuplicateFragment => self.duplicate_fragments += count,
            Status::PrimaryFragment => self.primary_fragments += count,
            Status::DeferredFragment => self.deferred_fragments += count,
            Status::AdoptedMate => self.adopted_mates += count,
            Status::CrossPartition => self.cross_partition_records += count,
            Status::MissingMateInfo => self.missing_mate_info += count,
            Status::ForcedUnresolved => self.forced_unresolved += count,
            Status::IntegrityFailure => self.integrity_failures += count,
            Status::UmiGroup => self.umi_groups += count,
            Status::DualStrandGroup => self.dual_strand_groups += count,
            Status::MissingUmi => self.missing_umis += count,
        }
    }

    pub fn merge(&mut self, other: &Metrics) {
        self.total_records += other.total_records;
        self.passthrough_records += other.passthrough_records;
        self.unique_fragments += other.unique_fragments;
        self.duplicate_fragments += other.duplicate_fragments;
        self.primary_fragments += other.primary_fragments;
        self.deferred_fragments += other.deferred_fragments;
        self.adopted_mates += other.adopted_mates;
        self.cross_partition_records += other.cross_partition_records;
        self.missing_mate_info += other.missing_mate_info;
        self.forced_unresolved += other.forced_unresolved;
        self.integrity_failures += other.integrity_failures;
        self.umi_groups += other.umi_groups;
        self.dual_strand_groups += other.dual_strand_groups;
        self.missing_umis += other.missing_umis;
    }

    pub fn fragments_resolved(&self) -> usize {
        self.unique_fragments + self.duplicate_fragments + self.primary_fragments
    }

    pub fn percent_duplication(&self) -> f64 {
        let resolved = self.fragments_resolved();
        if resolved == 0 {
            0.0
        } else {
            self.duplicate_fragments as f64 / resolved as f64
        }
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "TOTAL_RECORDS\tPASSTHROUGH_RECORDS\tUNIQUE_FRAGMENTS\tDUPLICATE_FRAGMENTS\tPRIMARY_FRAGMENTS\tDEFERRED_FRAGMENTS\tADOPTED_MATES\tCROSS_PARTITION_RECORDS\tMISSING_MATE_INFO\tFORCED_UNRESOLVED\tINTEGRITY_FAILURES\tUMI_GROUPS\tDUAL_STRAND_GROUPS\tPERCENT_DUPLICATION"
        )?;
        writeln!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{:.4}",
            self.total_records,
            self.passthrough_records,
            self.unique_fragments,
            self.duplicate_fragments,
            self.primary_fragments,
            self.deferred_fragments,
            self.adopted_mates,
            self.cross_partition_records,
            self.missing_mate_info,
            self.forced_unresolved,
            self.integrity_failures,
            self.umi_groups,
            self.dual_strand_groups,
            self.percent_duplication()
        )
    }
}

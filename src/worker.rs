use std::sync::Arc;

use ahash::AHashMap;

use crate::classify::{classify_fragments, ClassifyOutcome};
use crate::consensus::{UmiConsensusBuilder, UmiGroup};
use crate::engine::DedupConfig;
use crate::fragment::{CandidateDuplicates, Fragment, FragmentStatus};
use crate::metrics::{Metrics, Status};
use crate::partition::{MateOutcome, PartitionKey, PartitionStore};
use crate::record::AlignmentRecord;
use crate::window::{ReadWindowCache, WindowSlot};

/// A resolved unit handed to the output sink.
#[derive(Debug)]
pub enum OutputRecord {
    Fragment(Fragment),
    Consensus(UmiGroup),
}

/// Per-chromosome orchestrator. Drives the sliding window and the classifier
/// over one region's record stream, advances the partition cursor, and routes
/// records whose fragment state lives elsewhere through the shared
/// [`PartitionStore`].
pub struct ChromosomeWorker {
    chrom: Arc<str>,
    chrom_index: u32,
    config: Arc<DedupConfig>,
    store: Arc<PartitionStore>,
    window: ReadWindowCache,
    open: AHashMap<String, WindowSlot>,
    cursor: i64,
    outbound: AHashMap<PartitionKey, Vec<AlignmentRecord>>,
    consensus: Option<UmiConsensusBuilder>,
    metrics: Metrics,
}

impl ChromosomeWorker {
    pub fn new(
        chrom: Arc<str>,
        chrom_index: u32,
        config: Arc<DedupConfig>,
        store: Arc<PartitionStore>,
    ) -> ChromosomeWorker {
        let consensus = config
            .umi
            .as_ref()
            .map(|umi| UmiConsensusBuilder::new(umi.max_distance));

        ChromosomeWorker {
            chrom,
            chrom_index,
            window: ReadWindowCache::new(config.buffer_size),
            config,
            store,
            open: AHashMap::new(),
            cursor: i64::MIN,
            outbound: AHashMap::new(),
            consensus,
            metrics: Metrics::default(),
        }
    }

    pub fn chrom(&self) -> &Arc<str> {
        &self.chrom
    }

    pub fn take_metrics(&mut self) -> Metrics {
        std::mem::take(&mut self.metrics)
    }

    /// Process the next record of this chromosome's coordinate sorted stream.
    /// Resolved output is appended to `out`.
    pub fn ingest(&mut self, record: AlignmentRecord, out: &mut Vec<OutputRecord>) {
        self.metrics.total_records += 1;

        let Some(start) = record.start().filter(|_| record.chrom().is_some()) else {
            self.passthrough(record, out);
            return;
        };
        if record.flags().is_unmapped() || record.is_secondary() {
            self.passthrough(record, out);
            return;
        }

        if record.is_supplementary() {
            // rides along with its open fragment when one is buffered
            let name = record.name().to_string();
            match self.open.get(&name) {
                Some(&slot) => {
                    if let Some(back) = self.window.append(slot, &name, record) {
                        self.passthrough(back, out);
                    }
                }
                None => self.passthrough(record, out),
            }
            return;
        }

        if self.window.is_stale(start) {
            log::warn!(
                "{}: record {} at {} is behind the processing window; input not coordinate sorted?",
                self.chrom,
                record.name(),
                start
            );
            self.passthrough(record, out);
            return;
        }

        for (_, group) in self.window.evict_before(start) {
            self.classify_group(group, out);
        }

        let partition = start.div_euclid(self.config.partition_size);
        if partition != self.cursor {
            self.flush_outbound(out);
            self.cursor = partition;
        }

        if !record.is_paired() || record.is_mate_unmapped() {
            self.open_fragment(record, out);
            return;
        }

        if let Some(&slot) = self.open.get(record.name()) {
            let name = record.name().to_string();
            if let Some(back) = self.window.append(slot, &name, record) {
                self.passthrough(back, out);
            }
            return;
        }

        let Some(mate_index) = record.mate_chrom_index() else {
            // the mate contig is not in the reference dictionary; this
            // fragment can never be completed
            self.metrics.count(Status::MissingMateInfo);
            self.passthrough(record, out);
            return;
        };
        let Some(mate_start) = record.mate_start() else {
            self.metrics.count(Status::MissingMateInfo);
            self.passthrough(record, out);
            return;
        };

        if (mate_index, mate_start) < (self.chrom_index, start) {
            self.route_reply(record, mate_start, out);
        } else {
            self.open_fragment(record, out);
        }
    }

    /// Flush everything left at the end of the chromosome's stream. Deferred
    /// state stays in the store for other workers and the end-of-run sweep.
    pub fn finish(&mut self, out: &mut Vec<OutputRecord>) {
        for (_, group) in self.window.drain() {
            self.classify_group(group, out);
        }
        self.flush_outbound(out);
        self.open.clear();
    }

    fn passthrough(&mut self, record: AlignmentRecord, out: &mut Vec<OutputRecord>) {
        self.metrics.count(Status::Passthrough);
        out.push(OutputRecord::Fragment(Fragment::passthrough(record)));
    }

    fn base_key(&self, fragment: &Fragment) -> PartitionKey {
        let chrom = fragment.chrom().cloned().unwrap_or_else(|| self.chrom.clone());
        PartitionKey::containing(chrom, fragment.start(), self.config.partition_size)
    }

    fn open_fragment(&mut self, record: AlignmentRecord, out: &mut Vec<OutputRecord>) {
        match Fragment::new(record) {
            Ok(fragment) => {
                let name = fragment.name().to_string();
                let slot = self.window.insert(fragment);
                self.open.insert(name, slot);
            }
            Err((record, e)) => {
                log::warn!("{}: unusable record {}: {}", self.chrom, record.name(), e);
                self.passthrough(record, out);
            }
        }
    }

    /// The mate of this record is strictly earlier in genome order, so the
    /// template's state lives in the mate's base partition. Resolve against
    /// the active partition directly; batch everything else for the next
    /// partition boundary.
    fn route_reply(
        &mut self,
        record: AlignmentRecord,
        mate_start: i64,
        out: &mut Vec<OutputRecord>,
    ) {
        let Some(mate_chrom) = record.mate_chrom().cloned() else {
            self.metrics.count(Status::MissingMateInfo);
            self.passthrough(record, out);
            return;
        };
        let key = PartitionKey::containing(mate_chrom, mate_start, self.config.partition_size);

        if *key.chrom() == self.chrom && key.partition() == self.cursor {
            let outcome = self.store.complete_mate(&key, record);
            self.handle_outcome(outcome, out);
        } else {
            self.metrics.count(Status::CrossPartition);
            self.outbound.entry(key).or_default().push(record);
        }
    }

    fn handle_outcome(&mut self, outcome: MateOutcome, out: &mut Vec<OutputRecord>) {
        match outcome {
            MateOutcome::Adopted(record, status) => {
                self.metrics.count(Status::AdoptedMate);
                out.push(OutputRecord::Fragment(Fragment::adopted(record, status)));
            }
            MateOutcome::GroupResolved(group) => self.reclassify_group(group, out),
            // joined a still-waiting group, or deposited for an owner that
            // has not registered yet; the sweep picks up true orphans
            MateOutcome::Joined | MateOutcome::Buffered => {}
        }
    }

    fn flush_outbound(&mut self, out: &mut Vec<OutputRecord>) {
        if self.outbound.is_empty() {
            return;
        }
        let mut batches: Vec<(PartitionKey, Vec<AlignmentRecord>)> =
            self.outbound.drain().collect();
        batches.sort_by(|a, b| {
            (a.0.chrom().as_ref(), a.0.partition()).cmp(&(b.0.chrom().as_ref(), b.0.partition()))
        });

        for (key, records) in batches {
            for outcome in self.store.flush_pending(&key, records) {
                self.handle_outcome(outcome, out);
            }
        }
    }

    /// One evicted window group: merge any mate records other workers
    /// deposited for us, then classify the group atomically.
    fn classify_group(&mut self, mut fragments: Vec<Fragment>, out: &mut Vec<OutputRecord>) {
        for fragment in &mut fragments {
            self.open.remove(fragment.name());
            if !fragment.is_complete() {
                let key = self.base_key(fragment);
                if let Some(mate) = self.store.take_mate(&key, fragment.name()) {
                    fragment.push(mate);
                }
            }
        }

        let outcome = classify_fragments(fragments, self.config.read_length);
        self.emit_outcome(outcome, out);
    }

    /// A deferred group whose members all completed: run the classifier again
    /// with full mate information.
    fn reclassify_group(&mut self, group: CandidateDuplicates, out: &mut Vec<OutputRecord>) {
        let outcome = classify_fragments(group.fragments, self.config.read_length);
        self.emit_outcome(outcome, out);
    }

    fn emit_outcome(&mut self, outcome: ClassifyOutcome, out: &mut Vec<OutputRecord>) {
        if !outcome.balanced {
            self.metrics.count(Status::IntegrityFailure);
        }

        let mut umi_output = Vec::new();
        if let Some(builder) = &self.consensus {
            for cluster in &outcome.clusters {
                let members: Vec<&Fragment> =
                    cluster.iter().map(|&i| &outcome.resolved[i]).collect();
                umi_output.push(builder.build_groups(&members));
            }
        }
        for (groups, missing) in umi_output {
            self.metrics.count_many(Status::MissingUmi, missing);
            for group in groups {
                self.metrics.count(Status::UmiGroup);
                if group.dual_strand {
                    self.metrics.count(Status::DualStrandGroup);
                }
                out.push(OutputRecord::Consensus(group));
            }
        }

        for fragment in outcome.resolved {
            match fragment.status() {
                FragmentStatus::None => self.metrics.count(Status::UniqueFragment),
                FragmentStatus::Duplicate => self.metrics.count(Status::DuplicateFragment),
                FragmentStatus::Primary => self.metrics.count(Status::PrimaryFragment),
                FragmentStatus::Unresolved | FragmentStatus::Unclear => {}
            }

            if fragment.awaits_mate() {
                // the missing side adopts this status when it arrives
                let key = self.base_key(&fragment);
                if let Some(record) =
                    self.store
                        .register_status(&key, fragment.name(), fragment.status())
                {
                    self.metrics.count(Status::AdoptedMate);
                    out.push(OutputRecord::Fragment(Fragment::adopted(
                        record,
                        fragment.status(),
                    )));
                }
            }
            out.push(OutputRecord::Fragment(fragment));
        }

        for group in outcome.deferred {
            self.metrics
                .count_many(Status::DeferredFragment, group.fragments.len());

            if group.is_complete() {
                // malformed mates can leave a complete group undecidable
                for mut fragment in group.fragments {
                    self.metrics.count(Status::ForcedUnresolved);
                    fragment.resolve(FragmentStatus::None);
                    out.push(OutputRecord::Fragment(fragment));
                }
                continue;
            }

            let Some(first) = group.fragments.first() else {
                continue;
            };
            let key = self.base_key(first);
            if let Some(resolved) = self.store.register_candidates(&key, group) {
                self.reclassify_group(resolved, out);
            }
        }
    }
}

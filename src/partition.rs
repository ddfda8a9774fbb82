use std::fmt;
use std::hash::BuildHasher;
use std::sync::{Arc, Mutex, MutexGuard};

use ahash::{AHashMap, RandomState};

use crate::fragment::{CandidateDuplicates, FragmentStatus};
use crate::record::AlignmentRecord;

const SHARD_COUNT: usize = 64;

/// Address of one genomic partition: a fixed-size coordinate range on one
/// contig. Renders as `chrom_partition`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct PartitionKey {
    chrom: Arc<str>,
    partition: i64,
}

impl PartitionKey {
    pub fn containing(chrom: Arc<str>, position: i64, partition_size: i64) -> PartitionKey {
        PartitionKey {
            chrom,
            partition: position.div_euclid(partition_size),
        }
    }

    pub fn chrom(&self) -> &Arc<str> {
        &self.chrom
    }

    pub fn partition(&self) -> i64 {
        self.partition
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.chrom, self.partition)
    }
}

/// Outcome of merging an incomplete reply-side record into an entry.
#[derive(Debug)]
pub enum MateOutcome {
    /// The fragment already resolved; the record takes over its status.
    Adopted(AlignmentRecord, FragmentStatus),
    /// The record completed the last open fragment of a deferred group.
    GroupResolved(CandidateDuplicates),
    /// The record joined a pending fragment whose group is still waiting.
    Joined,
    /// Nothing is registered for this template yet; the record is buffered.
    Buffered,
}

/// Per-partition shared state: deferred candidate groups with their pending
/// fragments, terminal statuses awaiting mate adoption, and mate records
/// deposited before their owner registered anything.
#[derive(Debug, Default)]
pub struct PartitionEntry {
    groups: AHashMap<u64, CandidateDuplicates>,
    group_index: AHashMap<String, u64>,
    statuses: AHashMap<String, FragmentStatus>,
    mates: AHashMap<String, AlignmentRecord>,
    next_group: u64,
}

impl PartitionEntry {
    fn insert_group(&mut self, group: CandidateDuplicates) {
        let id = self.next_group;
        self.next_group += 1;
        for fragment in &group.fragments {
            self.group_index.insert(fragment.name().to_string(), id);
        }
        self.groups.insert(id, group);
    }

    fn complete(&mut self, record: AlignmentRecord) -> MateOutcome {
        let name = record.name().to_string();

        if let Some(status) = self.statuses.remove(&name) {
            return MateOutcome::Adopted(record, status);
        }

        if let Some(&id) = self.group_index.get(&name) {
            let group = self.groups.get_mut(&id).expect("indexed group exists");
            match group.fragments.iter_mut().find(|f| f.name() == name) {
                Some(fragment) => fragment.push(record),
                None => {
                    self.mates.insert(name, record);
                    return MateOutcome::Buffered;
                }
            }
            if group.is_complete() {
                let group = self.groups.remove(&id).expect("indexed group exists");
                for fragment in &group.fragments {
                    self.group_index.remove(fragment.name());
                }
                return MateOutcome::GroupResolved(group);
            }
            return MateOutcome::Joined;
        }

        self.mates.insert(name, record);
        MateOutcome::Buffered
    }

    fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.statuses.is_empty() && self.mates.is_empty()
    }

    /// Decompose for the end-of-run sweep, in a reproducible order.
    pub fn into_parts(
        self,
    ) -> (
        Vec<CandidateDuplicates>,
        Vec<(String, FragmentStatus)>,
        Vec<(String, AlignmentRecord)>,
    ) {
        let mut groups: Vec<_> = self.groups.into_values().collect();
        groups.sort_by(|a, b| {
            (a.position, a.fragments.first().map(|f| f.name().to_string()))
                .cmp(&(b.position, b.fragments.first().map(|f| f.name().to_string())))
        });

        let mut statuses: Vec<_> = self.statuses.into_iter().collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));

        let mut mates: Vec<_> = self.mates.into_iter().collect();
        mates.sort_by(|a, b| a.0.cmp(&b.0));

        (groups, statuses, mates)
    }
}

type Shard = AHashMap<PartitionKey, PartitionEntry>;

/// Process-wide index of per-partition pending state, shared by every
/// chromosome worker. Entries are created lazily; mutation is serialized per
/// shard so workers on different regions rarely contend.
#[derive(Debug)]
pub struct PartitionStore {
    shards: Vec<Mutex<Shard>>,
    hasher: RandomState,
}

impl Default for PartitionStore {
    fn default() -> Self {
        PartitionStore::new()
    }
}

impl PartitionStore {
    pub fn new() -> PartitionStore {
        PartitionStore {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(Shard::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, key: &PartitionKey) -> MutexGuard<'_, Shard> {
        let index = self.hasher.hash_one(key) as usize % SHARD_COUNT;
        match self.shards[index].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn with_entry<T>(&self, key: &PartitionKey, f: impl FnOnce(&mut PartitionEntry) -> T) -> T {
        let mut shard = self.shard(key);
        let entry = shard.entry(key.clone()).or_default();
        let result = f(entry);
        if entry.is_empty() {
            shard.remove(key);
        }
        result
    }

    /// Register a deferred group into its own base partition. Mate records
    /// already deposited by other workers are merged first; when that
    /// completes every member the group is handed back for immediate
    /// re-classification.
    pub fn register_candidates(
        &self,
        key: &PartitionKey,
        mut group: CandidateDuplicates,
    ) -> Option<CandidateDuplicates> {
        self.with_entry(key, |entry| {
            for fragment in &mut group.fragments {
                if !fragment.is_complete() {
                    if let Some(record) = entry.mates.remove(fragment.name()) {
                        fragment.push(record);
                    }
                }
            }
            if group.is_complete() {
                Some(group)
            } else {
                entry.insert_group(group);
                None
            }
        })
    }

    /// Record the terminal status of a fragment emitted with a side missing.
    /// When the missing side was already deposited the record comes back for
    /// immediate adopted emission instead.
    pub fn register_status(
        &self,
        key: &PartitionKey,
        template: &str,
        status: FragmentStatus,
    ) -> Option<AlignmentRecord> {
        self.with_entry(key, |entry| match entry.mates.remove(template) {
            Some(record) => Some(record),
            None => {
                entry.statuses.insert(template.to_string(), status);
                None
            }
        })
    }

    /// Merge one reply-side record into the entry of its owner partition.
    pub fn complete_mate(&self, key: &PartitionKey, record: AlignmentRecord) -> MateOutcome {
        self.with_entry(key, |entry| entry.complete(record))
    }

    /// Push a batch of reply-side records collected for a remote partition.
    pub fn flush_pending(
        &self,
        key: &PartitionKey,
        records: Vec<AlignmentRecord>,
    ) -> Vec<MateOutcome> {
        self.with_entry(key, |entry| {
            records.into_iter().map(|r| entry.complete(r)).collect()
        })
    }

    /// Take a deposited mate record for a fragment being classified.
    pub fn take_mate(&self, key: &PartitionKey, template: &str) -> Option<AlignmentRecord> {
        self.with_entry(key, |entry| entry.mates.remove(template))
    }

    /// Drain every remaining entry for the end-of-run sweep, ordered by
    /// contig name and partition.
    pub fn drain(&self) -> Vec<(PartitionKey, PartitionEntry)> {
        let mut entries = Vec::new();
        for shard in &self.shards {
            let mut guard = match shard.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            entries.extend(guard.drain());
        }
        entries.sort_by(|a, b| {
            (a.0.chrom.as_ref(), a.0.partition).cmp(&(b.0.chrom.as_ref(), b.0.partition))
        });
        entries
    }
}

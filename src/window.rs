use std::collections::BTreeMap;

use crate::fragment::Fragment;
use crate::record::AlignmentRecord;

/// Where a fragment sits in the window: unsigned genomic position for
/// eviction ordering, signed strand position as the group identity. Soft
/// clipped reads land in the same slot as their unclipped peers.
pub type WindowSlot = (i64, i64);

/// Sliding buffer of in-flight fragments ordered by initial position.
///
/// A slot is handed out for classification once the stream has advanced more
/// than `buffer_size` bases past it, at which point no further read can join
/// that group. Groups are evicted atomically and fragments within a slot keep
/// their insertion order.
#[derive(Debug)]
pub struct ReadWindowCache {
    buffer_size: i64,
    groups: BTreeMap<WindowSlot, Vec<Fragment>>,
    watermark: i64,
}

impl ReadWindowCache {
    pub fn new(buffer_size: i64) -> ReadWindowCache {
        ReadWindowCache {
            buffer_size,
            groups: BTreeMap::new(),
            watermark: i64::MIN,
        }
    }

    pub fn insert(&mut self, fragment: Fragment) -> WindowSlot {
        let initial = fragment.initial_position();
        let slot = (initial.abs(), initial);
        self.groups.entry(slot).or_default().push(fragment);
        slot
    }

    /// Hand a record to the open fragment of its template. Returns the record
    /// when no such fragment is buffered in `slot`.
    pub fn append(
        &mut self,
        slot: WindowSlot,
        name: &str,
        record: AlignmentRecord,
    ) -> Option<AlignmentRecord> {
        match self
            .groups
            .get_mut(&slot)
            .and_then(|group| group.iter_mut().find(|f| f.name() == name))
        {
            Some(fragment) => {
                fragment.push(record);
                None
            }
            None => Some(record),
        }
    }

    /// Evict every slot the stream has moved past.
    pub fn evict_before(&mut self, stream_start: i64) -> Vec<(WindowSlot, Vec<Fragment>)> {
        let cutoff = stream_start - self.buffer_size;
        if cutoff > self.watermark {
            self.watermark = cutoff;
        }

        let mut evicted = Vec::new();
        while let Some((&slot, _)) = self.groups.first_key_value() {
            if slot.0 >= cutoff {
                break;
            }
            if let Some(entry) = self.groups.pop_first() {
                evicted.push(entry);
            }
        }
        evicted
    }

    /// A record this far below the watermark can no longer be grouped; the
    /// input was not coordinate sorted.
    pub fn is_stale(&self, start: i64) -> bool {
        start < self.watermark
    }

    pub fn drain(&mut self) -> Vec<(WindowSlot, Vec<Fragment>)> {
        std::mem::take(&mut self.groups).into_iter().collect()
    }

    pub fn fragment_count(&self) -> usize {
        self.groups.values().map(|g| g.len()).sum()
    }
}

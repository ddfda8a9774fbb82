use std::collections::BTreeMap;

use crate::fragment::{CandidateDuplicates, Fragment, FragmentStatus};

/// Result of classifying one same-start group.
///
/// `clusters` indexes into `resolved`, one entry per duplicate cluster, so a
/// consensus stage can revisit the members without re-deriving them.
#[derive(Debug, Default)]
pub struct ClassifyOutcome {
    pub resolved: Vec<Fragment>,
    pub clusters: Vec<Vec<usize>>,
    pub deferred: Vec<CandidateDuplicates>,
    pub balanced: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PairStatus {
    None,
    Duplicate,
    Unclear,
}

/// Classify all fragments sharing one alignment start position.
///
/// Mutually duplicate fragments merge into clusters with one `Primary`
/// elected per cluster. Fragments that cannot be decided without a missing
/// mate are deferred as [`CandidateDuplicates`] keyed by their initial
/// position; everything else resolves `None`.
pub fn classify_fragments(fragments: Vec<Fragment>, read_length: i64) -> ClassifyOutcome {
    let n = fragments.len();
    let mut outcome = ClassifyOutcome {
        resolved: Vec::with_capacity(n),
        clusters: Vec::new(),
        deferred: Vec::new(),
        balanced: true,
    };

    if n == 0 {
        return outcome;
    }
    if n == 1 {
        let mut fragment = fragments.into_iter().next().expect("one fragment");
        fragment.resolve(FragmentStatus::None);
        outcome.resolved.push(fragment);
        return outcome;
    }

    let mut parent: Vec<usize> = (0..n).collect();
    let mut unclear = vec![false; n];

    for i in 0..n {
        for j in i + 1..n {
            match pair_status(&fragments[i], &fragments[j], read_length) {
                PairStatus::Duplicate => union(&mut parent, i, j),
                PairStatus::Unclear => {
                    unclear[i] = true;
                    unclear[j] = true;
                }
                PairStatus::None => {}
            }
        }
    }

    // components in first-seen order
    let mut components: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        components[find(&mut parent, i)].push(i);
    }

    let mut in_cluster = vec![false; n];
    let mut clusters: Vec<Vec<usize>> = Vec::new();
    for component in components.into_iter().filter(|c| c.len() >= 2) {
        for &i in &component {
            in_cluster[i] = true;
        }
        clusters.push(component);
    }

    let mut slots: Vec<Option<Fragment>> = fragments.into_iter().map(Some).collect();

    for member_indices in clusters {
        let primary = find_primary_fragment(&slots, &member_indices);
        let size = member_indices.len() as u32;
        let mut resolved_indices = Vec::with_capacity(member_indices.len());
        for i in member_indices {
            let mut fragment = slots[i].take().expect("cluster member taken once");
            fragment.set_duplicate_count(size);
            fragment.resolve(if i == primary {
                FragmentStatus::Primary
            } else {
                FragmentStatus::Duplicate
            });
            resolved_indices.push(outcome.resolved.len());
            outcome.resolved.push(fragment);
        }
        outcome.clusters.push(resolved_indices);
    }

    // remaining unclear fragments group by shared initial position
    let mut deferred: BTreeMap<i64, Vec<Fragment>> = BTreeMap::new();
    for i in 0..n {
        let Some(slot) = slots[i].take() else { continue };
        if unclear[i] && !in_cluster[i] {
            let mut fragment = slot;
            fragment.resolve(FragmentStatus::Unclear);
            deferred
                .entry(fragment.initial_position())
                .or_default()
                .push(fragment);
        } else {
            let mut fragment = slot;
            fragment.resolve(FragmentStatus::None);
            outcome.resolved.push(fragment);
        }
    }

    for (position, fragments) in deferred {
        outcome
            .deferred
            .push(CandidateDuplicates { position, fragments });
    }

    let deferred_total: usize = outcome.deferred.iter().map(|d| d.fragments.len()).sum();
    if outcome.resolved.len() + deferred_total != n {
        log::error!(
            "classification dropped fragments: {} in, {} resolved, {} deferred",
            n,
            outcome.resolved.len(),
            deferred_total
        );
        outcome.balanced = false;
    }

    outcome
}

fn pair_status(a: &Fragment, b: &Fragment, read_length: i64) -> PairStatus {
    if a.is_paired() != b.is_paired() {
        return PairStatus::None;
    }

    if a.coords().has_mate_info && b.coords().has_mate_info {
        return if a.coords().key == b.coords().key {
            PairStatus::Duplicate
        } else {
            PairStatus::None
        };
    }

    // at least one side is missing its mate; compare what is known
    let (Some(a_mate), Some(b_mate)) = (a.mate_start(), b.mate_start()) else {
        return PairStatus::None;
    };

    if a.initial_position() == b.initial_position()
        && a.mate_chrom_index().is_some()
        && a.mate_chrom_index() == b.mate_chrom_index()
        && a.mate_strand() == b.mate_strand()
        && (a_mate - b_mate).abs() <= read_length
    {
        PairStatus::Unclear
    } else {
        PairStatus::None
    }
}

/// Elect the surviving fragment of a duplicate cluster: the single member
/// without a pre-existing duplicate marking if there is exactly one, else the
/// highest mean base quality, ties broken by lowest template name.
fn find_primary_fragment(slots: &[Option<Fragment>], members: &[usize]) -> usize {
    let unmarked: Vec<usize> = members
        .iter()
        .copied()
        .filter(|&i| {
            !slots[i]
                .as_ref()
                .expect("cluster member present")
                .has_existing_duplicate_flag()
        })
        .collect();
    if unmarked.len() == 1 {
        return unmarked[0];
    }

    let mut best = members[0];
    for &i in &members[1..] {
        if quality_beats(fragment_at(slots, i), fragment_at(slots, best)) {
            best = i;
        }
    }
    best
}

fn fragment_at<'a>(slots: &'a [Option<Fragment>], i: usize) -> &'a Fragment {
    slots[i].as_ref().expect("cluster member present")
}

/// Exact mean comparison via cross multiplication, lowest name on ties.
fn quality_beats(a: &Fragment, b: &Fragment) -> bool {
    let (a_sum, a_count) = a.quality_total();
    let (b_sum, b_count) = b.quality_total();
    let lhs = a_sum as u128 * b_count.max(1) as u128;
    let rhs = b_sum as u128 * a_count.max(1) as u128;
    match lhs.cmp(&rhs) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => a.name() < b.name(),
    }
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

fn union(parent: &mut [usize], a: usize, b: usize) {
    let ra = find(parent, a);
    let rb = find(parent, b);
    if ra != rb {
        // lower root wins to keep first-seen ordering
        let (low, high) = if ra < rb { (ra, rb) } else { (rb, ra) };
        parent[high] = low;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{pair_fragment, se_fragment, set_qualities};

    #[test]
    fn empty_group() {
        let outcome = classify_fragments(Vec::new(), 151);
        assert!(outcome.resolved.is_empty());
        assert!(outcome.deferred.is_empty());
        assert!(outcome.balanced);
    }

    #[test]
    fn singleton_resolves_none() {
        let outcome = classify_fragments(vec![se_fragment("t1", 1000, false)], 151);
        assert_eq!(outcome.resolved.len(), 1);
        assert_eq!(outcome.resolved[0].status(), FragmentStatus::None);
        assert!(outcome.clusters.is_empty());
    }

    #[test]
    fn full_pairs_duplicate_with_primary() {
        // both ends known, identical keys: one Primary, one Duplicate
        let mut a = pair_fragment("t1", 1000, 1200);
        let mut b = pair_fragment("t2", 1000, 1200);
        set_qualities(&mut a, 30);
        set_qualities(&mut b, 35);

        let outcome = classify_fragments(vec![a, b], 151);
        assert!(outcome.balanced);
        assert_eq!(outcome.resolved.len(), 2);
        assert_eq!(outcome.clusters.len(), 1);

        let primaries: Vec<_> = outcome
            .resolved
            .iter()
            .filter(|f| f.status() == FragmentStatus::Primary)
            .collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].name(), "t2");
        assert!(outcome
            .resolved
            .iter()
            .all(|f| f.duplicate_count() == 2));
    }

    #[test]
    fn different_keys_resolve_none() {
        let a = pair_fragment("t1", 1000, 1200);
        let b = pair_fragment("t2", 1000, 1450);
        let outcome = classify_fragments(vec![a, b], 151);
        assert!(outcome
            .resolved
            .iter()
            .all(|f| f.status() == FragmentStatus::None));
        assert!(outcome.clusters.is_empty());
    }

    #[test]
    fn missing_mate_defers_unclear() {
        // one full pair and one fragment without mate info at the same start,
        // mate coordinates compatible: both are deferred
        let full = pair_fragment("t1", 1000, 1200);
        let half = crate::testutil::half_fragment("t2", 1000, 1210);

        let outcome = classify_fragments(vec![full, half], 151);
        assert!(outcome.balanced);
        assert!(outcome.resolved.is_empty());
        assert_eq!(outcome.deferred.len(), 1);
        assert_eq!(outcome.deferred[0].fragments.len(), 2);
        assert_eq!(outcome.deferred[0].position, 1000);
        assert!(outcome.deferred[0]
            .fragments
            .iter()
            .all(|f| f.status() == FragmentStatus::Unclear));
    }

    #[test]
    fn incompatible_mates_resolve_none() {
        let full = pair_fragment("t1", 1000, 1200);
        // mate too far away for an unclear call
        let half = crate::testutil::half_fragment("t2", 1000, 1600);

        let outcome = classify_fragments(vec![full, half], 151);
        assert_eq!(outcome.resolved.len(), 2);
        assert!(outcome
            .resolved
            .iter()
            .all(|f| f.status() == FragmentStatus::None));
    }

    #[test]
    fn paired_mismatch_is_none() {
        let se = se_fragment("t1", 1000, false);
        let pe = pair_fragment("t2", 1000, 1200);
        let outcome = classify_fragments(vec![se, pe], 151);
        assert!(outcome
            .resolved
            .iter()
            .all(|f| f.status() == FragmentStatus::None));
    }

    #[test]
    fn single_end_duplicates() {
        let a = se_fragment("t1", 1000, false);
        let b = se_fragment("t2", 1000, false);
        let c = se_fragment("t3", 1000, true);

        let outcome = classify_fragments(vec![a, b, c], 151);
        assert_eq!(outcome.clusters.len(), 1);
        assert_eq!(outcome.clusters[0].len(), 2);
        // the reverse read has a different key and stays unique
        let none: Vec<_> = outcome
            .resolved
            .iter()
            .filter(|f| f.status() == FragmentStatus::None)
            .collect();
        assert_eq!(none.len(), 1);
        assert_eq!(none[0].name(), "t3");
    }

    #[test]
    fn equal_quality_ties_break_by_name() {
        let a = pair_fragment("t9", 1000, 1200);
        let b = pair_fragment("t2", 1000, 1200);
        let outcome = classify_fragments(vec![a, b], 151);
        let primary = outcome
            .resolved
            .iter()
            .find(|f| f.status() == FragmentStatus::Primary)
            .unwrap();
        assert_eq!(primary.name(), "t2");
    }

    #[test]
    fn count_invariant_holds() {
        let fragments = vec![
            pair_fragment("t1", 1000, 1200),
            pair_fragment("t2", 1000, 1200),
            crate::testutil::half_fragment("t3", 1000, 1190),
            se_fragment("t4", 1000, false),
        ];
        let n = fragments.len();
        let outcome = classify_fragments(fragments, 151);
        let deferred: usize = outcome.deferred.iter().map(|d| d.fragments.len()).sum();
        assert!(outcome.balanced);
        assert_eq!(outcome.resolved.len() + deferred, n);
    }
}

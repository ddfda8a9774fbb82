use smallvec::{smallvec, SmallVec};
use vec_map::VecMap;

/// Hamming distance over UMI bytes. `N` never counts as a mismatch; length
/// mismatches push the pair out of clustering range entirely.
pub fn umi_distance(a: &[u8], b: &[u8]) -> usize {
    if a.len() == b.len() {
        a.iter()
            .zip(b.iter())
            .filter(|(&x, &y)| x != b'N' && y != b'N' && x != y)
            .count()
    } else {
        std::cmp::max(a.len(), b.len())
    }
}

/// One UMI cluster: the most frequent sequence and the member indices that
/// fell within range of it.
#[derive(Debug)]
pub struct UmiCluster {
    pub umi: Vec<u8>,
    pub members: Vec<usize>,
}

#[derive(Debug)]
struct UmiNode {
    umi: Vec<u8>,
    members: SmallVec<[usize; 4]>,
    edges: VecMap<usize>,
}

/// Metric tree over the UMI sequences of one duplicate cluster. Identical
/// sequences share a node; lookups prune on the triangle inequality.
#[derive(Debug, Default)]
pub struct UmiTree {
    nodes: Vec<UmiNode>,
}

impl UmiTree {
    pub fn new() -> UmiTree {
        UmiTree { nodes: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn insert(&mut self, umi: &[u8], member: usize) {
        let pos = self.nodes.len();
        if self.nodes.is_empty() {
            self.nodes.push(UmiNode {
                umi: umi.to_vec(),
                members: smallvec![member],
                edges: VecMap::new(),
            });
            return;
        }

        let mut current = 0;
        loop {
            let node = &mut self.nodes[current];
            let d = umi_distance(&node.umi, umi);
            if d == 0 {
                node.members.push(member);
                return;
            }
            match node.edges.get(d) {
                Some(&next) => current = next,
                None => {
                    node.edges.insert(d, pos);
                    break;
                }
            }
        }
        self.nodes.push(UmiNode {
            umi: umi.to_vec(),
            members: smallvec![member],
            edges: VecMap::new(),
        });
    }

    /// Partition the inserted UMIs, most frequent sequence first, gathering
    /// everything within `max_dist` of each seed. Ties keep insertion order
    /// for reproducibility.
    pub fn clusters(&self, max_dist: usize) -> Vec<UmiCluster> {
        let mut order: Vec<usize> = (0..self.nodes.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(self.nodes[i].members.len()));

        let mut assigned = vec![false; self.nodes.len()];
        let mut clusters = Vec::new();

        for seed in order {
            if assigned[seed] {
                continue;
            }
            assigned[seed] = true;
            let seed_umi = &self.nodes[seed].umi;
            let mut members: Vec<usize> = self.nodes[seed].members.to_vec();

            // walk from the root, pruning edges that cannot reach max_dist
            let mut queue = vec![0usize];
            while let Some(current) = queue.pop() {
                let node = &self.nodes[current];
                let d = umi_distance(seed_umi, &node.umi);
                if d <= max_dist && !assigned[current] {
                    assigned[current] = true;
                    members.extend(node.members.iter().copied());
                }
                queue.extend(
                    node.edges
                        .iter()
                        .filter(|&(dist, _)| dist.abs_diff(d) <= max_dist)
                        .map(|(_, &target)| target),
                );
            }

            clusters.push(UmiCluster {
                umi: seed_umi.clone(),
                members,
            });
        }

        clusters
    }
}

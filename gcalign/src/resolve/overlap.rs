use crate::resolve::area::PeakArea;

/// Disjoint-set forest over peak indices, path compression + union by rank.
///
/// Grouping has to be transitive: peak A overlapping B and B overlapping C
/// puts all three in one group even when A and C never touch. Pair-at-a-time
/// map lookups miss exactly that case once both endpoints already represent
/// different groups, so the partition is built here instead.
#[derive(Clone, Debug)]
pub struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    pub fn new(n: usize) -> Self {
        DisjointSet {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    pub fn find(&mut self, i: usize) -> usize {
        let mut root = i;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = i;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    pub fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Partitions a chromatogram's peak list into groups of mutually overlapping
/// areas. Two areas are connected iff either seed lies inside the other's
/// *region* (not merely on its boundary); connectivity extends transitively.
///
/// Read-only on the areas. Merged areas are skipped. Output order is fixed:
/// members ascending within a group, groups ordered by their smallest member,
/// singletons included.
pub fn overlap_groups(peaks: &[PeakArea]) -> Vec<Vec<usize>> {
    let n = peaks.len();
    let mut set = DisjointSet::new(n);

    for i in 0..n {
        if peaks[i].is_merged() {
            continue;
        }
        for j in (i + 1)..n {
            if peaks[j].is_merged() {
                continue;
            }
            if peaks[i].contains(peaks[j].seed) || peaks[j].contains(peaks[i].seed) {
                set.union(i, j);
            }
        }
    }

    let mut groups: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        if peaks[i].is_merged() {
            continue;
        }
        let root = set.find(i);
        groups[root].push(i);
    }

    // ascending member order falls out of the index loop; drop empty slots
    groups.retain(|g| !g.is_empty());
    groups.sort_by_key(|g| g[0]);
    groups
}

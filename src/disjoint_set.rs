use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Handle to one partition of a [`DisjointSet`].
///
/// Handles obtained before a `union` stay usable; every lookup goes through the
/// current representative.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Partition(usize);

struct Node {
    parent: Cell<usize>,
    rank: u32,
    // Nodes linked directly under this one by `union`; used to enumerate members.
    children: Vec<usize>,
}

/// Union-find forest with union by rank and path compression.
pub(crate) struct DisjointSet<T> {
    nodes: Vec<Node>,
    values: Vec<T>,
    index: BTreeMap<T, usize>,
    partitions: usize,
}

impl<T: Ord + Clone> Default for DisjointSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord + Clone> DisjointSet<T> {
    pub(crate) fn new() -> Self {
        Self {
            nodes: Vec::new(),
            values: Vec::new(),
            index: BTreeMap::new(),
            partitions: 0,
        }
    }

    /// Insert `value` as a singleton unless already present.
    pub(crate) fn add(&mut self, value: T) -> Partition {
        if let Some(partition) = self.get(&value) {
            return partition;
        }
        let node = self.nodes.len();
        self.nodes.push(Node {
            parent: Cell::new(node),
            rank: 0,
            children: Vec::new(),
        });
        self.values.push(value.clone());
        self.index.insert(value, node);
        self.partitions += 1;
        Partition(node)
    }

    pub(crate) fn get(&self, value: &T) -> Option<Partition> {
        let node = *self.index.get(value)?;
        Some(Partition(self.find(node)))
    }

    pub(crate) fn union(&mut self, x: Partition, y: Partition) -> Partition {
        let x_root = self.find(x.0);
        let y_root = self.find(y.0);
        if x_root == y_root {
            return Partition(x_root);
        }
        let (x_rank, y_rank) = (self.nodes[x_root].rank, self.nodes[y_root].rank);
        let root = if x_rank < y_rank {
            self.link(x_root, y_root);
            y_root
        } else {
            self.link(y_root, x_root);
            if x_rank == y_rank {
                self.nodes[x_root].rank += 1;
            }
            x_root
        };
        self.partitions -= 1;
        Partition(root)
    }

    /// Members of `partition` in breadth-first order from its representative.
    pub(crate) fn members(&self, partition: Partition) -> Vec<&T> {
        let mut members = Vec::new();
        let mut queue = VecDeque::from([self.find(partition.0)]);
        while let Some(node) = queue.pop_front() {
            members.push(&self.values[node]);
            queue.extend(self.nodes[node].children.iter().copied());
        }
        members
    }

    /// Each partition once, ordered by its smallest member.
    pub(crate) fn partitions(&self) -> Vec<Partition> {
        let mut seen = BTreeSet::new();
        self.index
            .values()
            .map(|node| self.find(*node))
            .filter(|root| seen.insert(*root))
            .map(Partition)
            .collect()
    }

    pub(crate) fn element_count(&self) -> usize {
        self.values.len()
    }

    pub(crate) fn partition_count(&self) -> usize {
        self.partitions
    }

    fn find(&self, node: usize) -> usize {
        let parent = self.nodes[node].parent.get();
        if parent == node {
            return node;
        }
        let root = self.find(parent);
        self.nodes[node].parent.set(root);
        root
    }

    fn link(&mut self, child: usize, parent: usize) {
        self.nodes[child].parent.set(parent);
        self.nodes[parent].children.push(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(set: &DisjointSet<char>, partition: Partition) -> Vec<char> {
        let mut members: Vec<char> = set.members(partition).into_iter().copied().collect();
        members.sort();
        members
    }

    #[test]
    fn unions_merge_partitions_transitively() {
        let mut set = DisjointSet::new();
        let a = set.add('a');
        let b = set.add('b');
        let c = set.add('c');
        let d = set.add('d');
        assert_eq!(set.element_count(), 4);
        assert_eq!(set.partition_count(), 4);

        set.union(a, b);
        set.union(c, d);
        assert_eq!(set.partition_count(), 2);
        assert_ne!(set.get(&'a'), set.get(&'c'));

        set.union(b, d);
        assert_eq!(set.partition_count(), 1);
        assert_eq!(set.get(&'a'), set.get(&'d'));
        assert_eq!(sorted(&set, a), vec!['a', 'b', 'c', 'd']);
    }

    #[test]
    fn repeated_add_and_union_are_idempotent() {
        let mut set = DisjointSet::new();
        let a = set.add('a');
        assert_eq!(set.add('a'), a);
        let b = set.add('b');
        set.union(a, b);
        set.union(b, a);
        assert_eq!(set.partition_count(), 1);
        assert_eq!(set.element_count(), 2);
        assert_eq!(set.get(&'z'), None);
    }

    #[test]
    fn partitions_are_listed_once_in_member_order() {
        let mut set = DisjointSet::new();
        for value in ['e', 'd', 'c', 'b', 'a'] {
            set.add(value);
        }
        let e = set.get(&'e').expect("e");
        let a = set.get(&'a').expect("a");
        set.union(e, a);
        let partitions = set.partitions();
        assert_eq!(partitions.len(), 4);
        assert_eq!(sorted(&set, partitions[0]), vec!['a', 'e']);
        assert_eq!(sorted(&set, partitions[1]), vec!['b']);
    }
}

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::{Context, Result};

use crate::ir::{Insn, Method};

/// Domain callbacks required by the backward worklist engine.
pub(crate) trait DataFlowSemantics {
    type Set: Clone + PartialEq;

    /// Fact assumed for a predecessor that has not been visited yet.
    fn initial_set(&self) -> Self::Set;

    /// Fact flowing into an exit node.
    fn entry_set(&self) -> Self::Set {
        self.initial_set()
    }

    fn join(&self, set1: &Self::Set, set2: &Self::Set) -> Self::Set;

    fn transfer(&self, set: &Self::Set, insn: &Insn) -> Self::Set;
}

/// Facts flowing into each instruction position from its successors.
///
/// Only positions that appear on some control-flow edge have facts.
pub(crate) struct DataFlowResult<T> {
    in_sets: BTreeMap<usize, T>,
}

impl<T> DataFlowResult<T> {
    pub(crate) fn in_set(&self, index: usize) -> Option<&T> {
        self.in_sets.get(&index)
    }
}

/// Deterministic worklist solver running against the edges recorded by the
/// analyzer.
pub(crate) fn solve_backward<S>(
    method: &Method,
    edges: &BTreeSet<(usize, usize)>,
    semantics: &S,
) -> Result<DataFlowResult<S::Set>>
where
    S: DataFlowSemantics,
{
    let mut predecessors: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    let mut successors: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for &(to, from) in edges {
        successors.entry(from).or_default().push(to);
        predecessors.entry(to).or_default().push(from);
        successors.entry(to).or_default();
        predecessors.entry(from).or_default();
    }

    let mut queue: VecDeque<usize> = predecessors
        .iter()
        .filter(|(_, incoming)| incoming.is_empty())
        .map(|(node, _)| *node)
        .collect();
    let mut queued: BTreeSet<usize> = queue.iter().copied().collect();

    let initial = semantics.initial_set();
    let entry = semantics.entry_set();
    let mut in_sets = BTreeMap::new();
    let mut out_sets: BTreeMap<usize, S::Set> = BTreeMap::new();

    while let Some(node) = queue.pop_front() {
        queued.remove(&node);
        let incoming = predecessors.get(&node).map(Vec::as_slice).unwrap_or_default();
        let in_set = incoming
            .iter()
            .map(|pred| out_sets.get(pred).unwrap_or(&initial))
            .fold(None, |acc: Option<S::Set>, set| match acc {
                None => Some(set.clone()),
                Some(acc) => Some(semantics.join(&acc, set)),
            })
            .unwrap_or_else(|| entry.clone());

        let (_, insn) = method
            .instructions
            .at(node)
            .with_context(|| format!("control-flow node {node} out of range"))?;
        let out_set = semantics.transfer(&in_set, insn);
        in_sets.insert(node, in_set);

        if out_sets.get(&node) != Some(&out_set) {
            out_sets.insert(node, out_set);
            for successor in successors.get(&node).into_iter().flatten() {
                if queued.insert(*successor) {
                    queue.push_back(*successor);
                }
            }
        }
    }

    Ok(DataFlowResult { in_sets })
}

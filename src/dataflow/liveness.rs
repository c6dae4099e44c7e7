use std::collections::BTreeSet;

use anyhow::Result;

use crate::dataflow::analyzer::Analysis;
use crate::dataflow::worklist::{DataFlowResult, DataFlowSemantics, solve_backward};
use crate::ir::{Insn, Method};
use crate::opcodes::*;

/// Local variables read on some path after each instruction.
pub(crate) struct Liveness {
    result: DataFlowResult<BTreeSet<u16>>,
}

impl Liveness {
    /// Variables live right after the instruction at `index`; `None` when the
    /// instruction is not on any analysed path.
    pub(crate) fn live_after(&self, index: usize) -> Option<&BTreeSet<u16>> {
        self.result.in_set(index)
    }
}

struct LiveVariables;

impl DataFlowSemantics for LiveVariables {
    type Set = BTreeSet<u16>;

    fn initial_set(&self) -> BTreeSet<u16> {
        BTreeSet::new()
    }

    fn join(&self, set1: &BTreeSet<u16>, set2: &BTreeSet<u16>) -> BTreeSet<u16> {
        set1.union(set2).copied().collect()
    }

    fn transfer(&self, set: &BTreeSet<u16>, insn: &Insn) -> BTreeSet<u16> {
        let mut set = set.clone();
        match insn {
            Insn::Var { opcode, var } => match *opcode {
                ILOAD | LLOAD | FLOAD | DLOAD | ALOAD => {
                    set.insert(*var);
                }
                ISTORE | LSTORE | FSTORE | DSTORE | ASTORE => {
                    set.remove(var);
                }
                _ => {}
            },
            Insn::Iinc { var, .. } => {
                set.insert(*var);
            }
            _ => {}
        }
        set
    }
}

pub(crate) fn analyze_liveness<V>(method: &Method, analysis: &Analysis<V>) -> Result<Liveness> {
    let result = solve_backward(method, &analysis.edges, &LiveVariables)?;
    Ok(Liveness { result })
}

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::info;

use crate::classpath::ClassPath;
use crate::config::Profile;
use crate::dataflow::analyzer::analyze;
use crate::dataflow::interpreter::BasicInterpreter;
use crate::dataflow::liveness::analyze_liveness;
use crate::expr::{PurityPolicy, delete_expression, is_pure};
use crate::ir::{Insn, InsnId, Method};
use crate::opcodes::ISTORE;
use crate::passes::PassMetadata;
use crate::transform::Transformer;

/// Deletes `int` stores, and the side-effect-free expressions feeding them,
/// whose value is never read.
pub(crate) struct DummyLocalPass {
    purity: PurityPolicy,
    removed: usize,
}

crate::register_pass!(DummyLocalPass);

impl DummyLocalPass {
    pub(crate) fn new(profile: &Profile) -> Self {
        Self {
            purity: profile.purity(),
            removed: 0,
        }
    }
}

impl Transformer for DummyLocalPass {
    fn metadata(&self) -> PassMetadata {
        PassMetadata {
            id: "dummy_local",
            name: "Dummy locals",
            description: "Removes stores to int locals that are never read",
            order: 40,
        }
    }

    fn pre_transform(&mut self, _classpath: &mut ClassPath) -> Result<()> {
        self.removed = 0;
        Ok(())
    }

    fn transform_code(
        &mut self,
        _classpath: &ClassPath,
        owner: &str,
        method: &mut Method,
    ) -> Result<bool> {
        let analysis = analyze(owner, method, &BasicInterpreter)?;
        let liveness = analyze_liveness(method, &analysis)?;

        let dead: Vec<InsnId> = method
            .instructions
            .iter()
            .enumerate()
            .filter_map(|(index, (id, insn))| match insn {
                Insn::Var { opcode: ISTORE, var } => liveness
                    .live_after(index)
                    .filter(|live| !live.contains(var))
                    .map(|_| id),
                _ => None,
            })
            .collect();

        let purity = self.purity;
        for id in dead {
            if delete_expression(&mut method.instructions, id, |insn| is_pure(insn, purity))? {
                self.removed += 1;
            }
        }
        Ok(false)
    }

    fn post_transform(&mut self, _classpath: &mut ClassPath) -> Result<()> {
        info!("Removed {} dummy local variables", self.removed);
        Ok(())
    }

    fn counters(&self) -> BTreeMap<&'static str, usize> {
        BTreeMap::from([("locals_removed", self.removed)])
    }
}

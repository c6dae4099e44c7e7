use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tracing::info;

use crate::classpath::ClassPath;
use crate::config::Profile;
use crate::dataflow::analyzer::analyze;
use crate::dataflow::interpreter::BasicInterpreter;
use crate::ir::{Insn, InsnId, InsnList, Method, TryCatchBlock};
use crate::passes::PassMetadata;
use crate::transform::Transformer;

/// Deletes unreachable instructions and the exception ranges they leave empty.
#[derive(Default)]
pub(crate) struct DeadCodePass {
    instructions: usize,
    try_catch_blocks: usize,
}

crate::register_pass!(DeadCodePass);

impl DeadCodePass {
    pub(crate) fn new(_profile: &Profile) -> Self {
        Self::default()
    }
}

/// Whether only labels and line numbers lie between the block's start and end.
fn is_body_empty(list: &InsnList, block: &TryCatchBlock) -> Result<bool> {
    let start = list
        .label_position(block.start)
        .context("try-catch start label missing")?;
    let end = list
        .label_position(block.end)
        .context("try-catch end label missing")?;
    Ok((start..end).all(|index| list.at(index).is_none_or(|(_, insn)| insn.is_pseudo())))
}

/// Remove unreachable code from `method` until it stabilises, returning the
/// number of instructions and exception ranges removed.
pub(crate) fn remove_dead_code(owner: &str, method: &mut Method) -> Result<(usize, usize)> {
    let (mut instructions, mut blocks) = (0, 0);
    loop {
        let analysis = analyze(owner, method, &BasicInterpreter)?;
        let dead: Vec<InsnId> = method
            .instructions
            .iter()
            .enumerate()
            .filter(|(index, (_, insn))| {
                analysis.frame(*index).is_none() && !matches!(insn, Insn::Label(_))
            })
            .map(|(_, (id, _))| id)
            .collect();
        for id in &dead {
            method.instructions.remove(*id);
        }

        let before = method.try_catch_blocks.len();
        let mut kept = Vec::with_capacity(before);
        for block in std::mem::take(&mut method.try_catch_blocks) {
            if !is_body_empty(&method.instructions, &block)? {
                kept.push(block);
            }
        }
        let removed_blocks = before - kept.len();
        method.try_catch_blocks = kept;

        instructions += dead.len();
        blocks += removed_blocks;
        if dead.is_empty() && removed_blocks == 0 {
            return Ok((instructions, blocks));
        }
    }
}

impl Transformer for DeadCodePass {
    fn metadata(&self) -> PassMetadata {
        PassMetadata {
            id: "dead_code",
            name: "Dead code",
            description: "Removes unreachable instructions and exception ranges with empty bodies",
            order: 30,
        }
    }

    fn pre_transform(&mut self, _classpath: &mut ClassPath) -> Result<()> {
        self.instructions = 0;
        self.try_catch_blocks = 0;
        Ok(())
    }

    fn transform_code(
        &mut self,
        _classpath: &ClassPath,
        owner: &str,
        method: &mut Method,
    ) -> Result<bool> {
        let (instructions, blocks) = remove_dead_code(owner, method)?;
        self.instructions += instructions;
        self.try_catch_blocks += blocks;
        Ok(instructions + blocks > 0)
    }

    fn post_transform(&mut self, _classpath: &mut ClassPath) -> Result<()> {
        info!(
            "Removed {} dead instructions and {} empty try-catch blocks",
            self.instructions, self.try_catch_blocks
        );
        Ok(())
    }

    fn counters(&self) -> BTreeMap<&'static str, usize> {
        BTreeMap::from([
            ("instructions_removed", self.instructions),
            ("try_catch_blocks_removed", self.try_catch_blocks),
        ])
    }
}

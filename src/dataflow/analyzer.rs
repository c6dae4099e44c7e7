use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::{Context, Result};

use crate::dataflow::frame::Frame;
use crate::dataflow::interpreter::Interpreter;
use crate::descriptor::{FieldType, MethodType};
use crate::error::DeobError;
use crate::ir::{Insn, InsnId, LabelId, Method};
use crate::opcodes;

/// Per-instruction frames of one method plus the control-flow edges that were
/// followed to compute them.
#[derive(Clone, Debug)]
pub(crate) struct Analysis<V> {
    /// Frame before each instruction, by list position; `None` when unreachable.
    pub(crate) frames: Vec<Option<Frame<V>>>,
    /// `(from, to)` positions, including edges into exception handlers.
    pub(crate) edges: BTreeSet<(usize, usize)>,
}

impl<V> Analysis<V> {
    pub(crate) fn frame(&self, index: usize) -> Option<&Frame<V>> {
        self.frames.get(index).and_then(Option::as_ref)
    }
}

/// Run `interpreter` over `method` to a fixed point.
///
/// Failures are reported as [`DeobError::AnalysisInvariant`].
pub(crate) fn analyze<I>(owner: &str, method: &Method, interpreter: &I) -> Result<Analysis<I::Value>>
where
    I: Interpreter,
{
    Analyzer::new(owner, method, interpreter)
        .and_then(|analyzer| analyzer.run())
        .map_err(|err| DeobError::invariant(owner, &method.name, format!("{err:#}")).into())
}

struct Analyzer<'a, I: Interpreter> {
    method: &'a Method,
    interpreter: &'a I,
    labels: BTreeMap<LabelId, usize>,
    handlers: Vec<Vec<(usize, Option<&'a str>)>>,
    frames: Vec<Option<Frame<I::Value>>>,
    edges: BTreeSet<(usize, usize)>,
    queue: VecDeque<usize>,
    queued: Vec<bool>,
}

impl<'a, I: Interpreter> Analyzer<'a, I> {
    fn new(owner: &str, method: &'a Method, interpreter: &'a I) -> Result<Self> {
        let size = method.instructions.len();
        let labels: BTreeMap<LabelId, usize> = method
            .instructions
            .iter()
            .enumerate()
            .filter_map(|(index, (_, insn))| match insn {
                Insn::Label(label) => Some((*label, index)),
                _ => None,
            })
            .collect();

        let mut handlers = vec![Vec::new(); size];
        for block in &method.try_catch_blocks {
            let start = position(&labels, block.start)?;
            let end = position(&labels, block.end)?;
            let handler = position(&labels, block.handler)?;
            for slot in handlers.iter_mut().take(end).skip(start) {
                slot.push((handler, block.catch_type.as_deref()));
            }
        }

        let mut analyzer = Self {
            method,
            interpreter,
            labels,
            handlers,
            frames: vec![None; size],
            edges: BTreeSet::new(),
            queue: VecDeque::new(),
            queued: vec![false; size],
        };
        if size > 0 {
            let entry = analyzer.entry_frame(owner)?;
            analyzer.merge(0, &entry)?;
        }
        Ok(analyzer)
    }

    fn entry_frame(&self, owner: &str) -> Result<Frame<I::Value>> {
        let descriptor = MethodType::parse(&self.method.descriptor)?;
        let is_instance = !self.method.is_static();
        let mut locals = Vec::new();
        if is_instance {
            let receiver = FieldType::Object(owner.to_string());
            locals.push(self.interpreter.new_parameter_value(true, 0, &receiver));
        }
        for argument in &descriptor.arguments {
            let local = locals.len();
            locals.push(
                self.interpreter
                    .new_parameter_value(is_instance, local, argument),
            );
            if argument.size() == 2 {
                locals.push(self.interpreter.new_empty_value(local + 1));
            }
        }
        let max_locals = usize::from(self.method.max_locals);
        if locals.len() > max_locals {
            anyhow::bail!(
                "arguments need {} locals but max_locals is {max_locals}",
                locals.len()
            );
        }
        while locals.len() < max_locals {
            let local = locals.len();
            locals.push(self.interpreter.new_empty_value(local));
        }
        Ok(Frame::new(locals))
    }

    fn run(mut self) -> Result<Analysis<I::Value>> {
        let method: &'a Method = self.method;
        while let Some(index) = self.queue.pop_front() {
            self.queued[index] = false;
            let (id, insn) = method
                .instructions
                .at(index)
                .context("instruction index out of range")?;
            let before = self.frames[index]
                .clone()
                .context("queued instruction without frame")?;

            self.step(index, id, insn, &before)
                .with_context(|| format!("at instruction {index} ({insn:?})"))?;

            let handlers = self.handlers[index].clone();
            for (handler, catch_type) in handlers {
                let mut frame = before.clone();
                frame.clear_stack();
                frame.push(self.interpreter.new_exception_value(catch_type));
                self.flow_to(index, handler, &frame)?;
            }
        }
        Ok(Analysis {
            frames: self.frames,
            edges: self.edges,
        })
    }

    fn step(
        &mut self,
        index: usize,
        id: InsnId,
        insn: &Insn,
        before: &Frame<I::Value>,
    ) -> Result<()> {
        if insn.is_pseudo() {
            return self.flow_to(index, index + 1, before);
        }
        let mut after = before.clone();
        after.execute(id, insn, self.interpreter)?;
        self.follow(index, insn, &after)
    }

    fn follow(&mut self, index: usize, insn: &Insn, after: &Frame<I::Value>) -> Result<()> {
        match insn {
            Insn::Jump { opcode, target } => {
                if *opcode != opcodes::GOTO {
                    self.flow_to(index, index + 1, after)?;
                }
                let target = position(&self.labels, *target)?;
                self.flow_to(index, target, after)
            }
            Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => {
                for label in insn.targets() {
                    let target = position(&self.labels, label)?;
                    self.flow_to(index, target, after)?;
                }
                Ok(())
            }
            other => match other.opcode() {
                Some(opcode) if opcodes::is_return(opcode) || opcode == opcodes::ATHROW => Ok(()),
                _ => self.flow_to(index, index + 1, after),
            },
        }
    }

    fn flow_to(&mut self, from: usize, to: usize, frame: &Frame<I::Value>) -> Result<()> {
        if to >= self.frames.len() {
            anyhow::bail!("execution can fall off the end of the code");
        }
        self.edges.insert((from, to));
        self.merge(to, frame)
    }

    fn merge(&mut self, index: usize, frame: &Frame<I::Value>) -> Result<()> {
        let changed = if let Some(existing) = self.frames[index].as_mut() {
            existing.merge(frame, self.interpreter)?
        } else {
            self.frames[index] = Some(frame.clone());
            true
        };
        if changed && !self.queued[index] {
            self.queued[index] = true;
            self.queue.push_back(index);
        }
        Ok(())
    }
}

fn position(labels: &BTreeMap<LabelId, usize>, label: LabelId) -> Result<usize> {
    labels
        .get(&label)
        .copied()
        .with_context(|| format!("label {label:?} is not placed"))
}

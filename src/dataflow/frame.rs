use anyhow::{Context, Result};

use crate::dataflow::interpreter::{Interpreter, Value};
use crate::descriptor::MethodType;
use crate::ir::{Insn, InsnId};
use crate::opcodes::*;

/// Locals and operand stack before one instruction.
///
/// The stack holds one entry per value; a `long` or `double` is a single entry
/// of size two.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Frame<V> {
    locals: Vec<V>,
    stack: Vec<V>,
}

impl<V: Value> Frame<V> {
    pub(crate) fn new(locals: Vec<V>) -> Self {
        Self {
            locals,
            stack: Vec::new(),
        }
    }

    pub(crate) fn local(&self, index: usize) -> Option<&V> {
        self.locals.get(index)
    }

    pub(crate) fn set_local(&mut self, index: usize, value: V) -> Result<()> {
        let slot = self
            .locals
            .get_mut(index)
            .with_context(|| format!("local {index} out of range"))?;
        *slot = value;
        Ok(())
    }

    pub(crate) fn stack(&self, index: usize) -> Option<&V> {
        self.stack.get(index)
    }

    /// Value `depth` entries below the top; zero is the top.
    pub(crate) fn peek(&self, depth: usize) -> Option<&V> {
        self.stack.len().checked_sub(depth + 1).map(|index| &self.stack[index])
    }

    pub(crate) fn push(&mut self, value: V) {
        self.stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> Result<V> {
        self.stack.pop().context("operand stack underflow")
    }

    pub(crate) fn clear_stack(&mut self) {
        self.stack.clear();
    }

    /// Join `other` into this frame; returns whether anything changed.
    pub(crate) fn merge<I>(&mut self, other: &Frame<V>, interpreter: &I) -> Result<bool>
    where
        I: Interpreter<Value = V>,
    {
        if self.stack.len() != other.stack.len() {
            anyhow::bail!(
                "incompatible stack heights {} and {}",
                self.stack.len(),
                other.stack.len()
            );
        }
        let mut changed = false;
        let pairs = self
            .locals
            .iter_mut()
            .zip(&other.locals)
            .chain(self.stack.iter_mut().zip(&other.stack));
        for (mine, theirs) in pairs {
            let merged = interpreter.merge(mine, theirs);
            if merged != *mine {
                *mine = merged;
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Apply the effect of `insn` to this frame.
    pub(crate) fn execute<I>(&mut self, id: InsnId, insn: &Insn, interpreter: &I) -> Result<()>
    where
        I: Interpreter<Value = V>,
    {
        let Some(opcode) = insn.opcode() else {
            return Ok(());
        };
        let effect =
            decode(insn).with_context(|| format!("unsupported opcode 0x{opcode:02x}"))?;
        match effect {
            Effect::Noop => {}
            Effect::Push => {
                let value = interpreter.new_operation(id, insn)?;
                self.push(value);
            }
            Effect::Load(var) => {
                let local = self
                    .local(var)
                    .with_context(|| format!("local {var} out of range"))?
                    .clone();
                let value = interpreter.copy_operation(id, insn, &local)?;
                self.push(value);
            }
            Effect::Store(var) => {
                let popped = self.pop()?;
                let value = interpreter.copy_operation(id, insn, &popped)?;
                let size = value.size();
                self.set_local(var, value)?;
                if size == 2 {
                    self.set_local(var + 1, interpreter.new_empty_value(var + 1))?;
                }
                if var > 0 && self.local(var - 1).is_some_and(|local| local.size() == 2) {
                    self.set_local(var - 1, interpreter.new_empty_value(var - 1))?;
                }
            }
            Effect::Iinc(var) => {
                let local = self
                    .local(var)
                    .with_context(|| format!("local {var} out of range"))?
                    .clone();
                let value = interpreter
                    .unary_operation(id, insn, &local)?
                    .context("iinc produced no value")?;
                self.set_local(var, value)?;
            }
            Effect::Unary { push } => {
                let value = self.pop()?;
                let result = interpreter.unary_operation(id, insn, &value)?;
                self.push_result(push, result)?;
            }
            Effect::Binary { push } => {
                let value2 = self.pop()?;
                let value1 = self.pop()?;
                let result = interpreter.binary_operation(id, insn, &value1, &value2)?;
                self.push_result(push, result)?;
            }
            Effect::Ternary => {
                let value3 = self.pop()?;
                let value2 = self.pop()?;
                let value1 = self.pop()?;
                interpreter.ternary_operation(id, insn, [&value1, &value2, &value3])?;
            }
            Effect::Invoke { arguments, pushes } => {
                let mut values = self.pop_values(arguments)?;
                values.reverse();
                let result = interpreter.nary_operation(id, insn, &values)?;
                self.push_result(pushes, result)?;
            }
            Effect::MultiANewArray(dimensions) => {
                let mut values = self.pop_values(dimensions)?;
                values.reverse();
                let result = interpreter.nary_operation(id, insn, &values)?;
                self.push_result(true, result)?;
            }
            Effect::Stack(kind) => self.execute_stack(kind, id, insn, interpreter)?,
            Effect::Subroutine => anyhow::bail!("subroutines are not supported"),
        }
        Ok(())
    }

    fn push_result(&mut self, push: bool, result: Option<V>) -> Result<()> {
        if push {
            self.push(result.context("operation produced no value")?);
        }
        Ok(())
    }

    fn pop_values(&mut self, count: usize) -> Result<Vec<V>> {
        (0..count).map(|_| self.pop()).collect()
    }

    fn pop_category1(&mut self, opcode: &str) -> Result<V> {
        let value = self.pop()?;
        if value.size() != 1 {
            anyhow::bail!("illegal use of {opcode} on a wide value");
        }
        Ok(value)
    }

    fn execute_stack<I>(
        &mut self,
        kind: StackOp,
        id: InsnId,
        insn: &Insn,
        interpreter: &I,
    ) -> Result<()>
    where
        I: Interpreter<Value = V>,
    {
        let copy = |value: &V| interpreter.copy_operation(id, insn, value);
        match kind {
            StackOp::Pop => {
                self.pop_category1("pop")?;
            }
            StackOp::Pop2 => {
                if self.pop()?.size() == 1 {
                    self.pop_category1("pop2")?;
                }
            }
            StackOp::Dup => {
                let value1 = self.pop_category1("dup")?;
                let copied = copy(&value1)?;
                self.push(value1);
                self.push(copied);
            }
            StackOp::DupX1 => {
                let value1 = self.pop_category1("dup_x1")?;
                let value2 = self.pop_category1("dup_x1")?;
                self.push(copy(&value1)?);
                self.push(value2);
                self.push(value1);
            }
            StackOp::DupX2 => {
                let value1 = self.pop_category1("dup_x2")?;
                let value2 = self.pop()?;
                if value2.size() == 1 {
                    let value3 = self.pop_category1("dup_x2")?;
                    self.push(copy(&value1)?);
                    self.push(value3);
                } else {
                    self.push(copy(&value1)?);
                }
                self.push(value2);
                self.push(value1);
            }
            StackOp::Dup2 => {
                let value1 = self.pop()?;
                if value1.size() == 1 {
                    let value2 = self.pop_category1("dup2")?;
                    let (copy2, copy1) = (copy(&value2)?, copy(&value1)?);
                    self.push(value2);
                    self.push(value1);
                    self.push(copy2);
                    self.push(copy1);
                } else {
                    let copied = copy(&value1)?;
                    self.push(value1);
                    self.push(copied);
                }
            }
            StackOp::Dup2X1 => {
                let value1 = self.pop()?;
                if value1.size() == 1 {
                    let value2 = self.pop_category1("dup2_x1")?;
                    let value3 = self.pop_category1("dup2_x1")?;
                    self.push(copy(&value2)?);
                    self.push(copy(&value1)?);
                    self.push(value3);
                    self.push(value2);
                } else {
                    let value2 = self.pop_category1("dup2_x1")?;
                    self.push(copy(&value1)?);
                    self.push(value2);
                }
                self.push(value1);
            }
            StackOp::Dup2X2 => {
                let value1 = self.pop()?;
                if value1.size() == 1 {
                    let value2 = self.pop_category1("dup2_x2")?;
                    let value3 = self.pop()?;
                    let value4 = if value3.size() == 1 {
                        Some(self.pop_category1("dup2_x2")?)
                    } else {
                        None
                    };
                    self.push(copy(&value2)?);
                    self.push(copy(&value1)?);
                    if let Some(value4) = value4 {
                        self.push(value4);
                    }
                    self.push(value3);
                    self.push(value2);
                } else {
                    let value2 = self.pop()?;
                    if value2.size() == 1 {
                        let value3 = self.pop_category1("dup2_x2")?;
                        self.push(copy(&value1)?);
                        self.push(value3);
                    } else {
                        self.push(copy(&value1)?);
                    }
                    self.push(value2);
                }
                self.push(value1);
            }
            StackOp::Swap => {
                let value2 = self.pop_category1("swap")?;
                let value1 = self.pop_category1("swap")?;
                self.push(copy(&value2)?);
                self.push(copy(&value1)?);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Effect {
    Noop,
    Push,
    Load(usize),
    Store(usize),
    Iinc(usize),
    Unary { push: bool },
    Binary { push: bool },
    Ternary,
    Invoke { arguments: usize, pushes: bool },
    MultiANewArray(usize),
    Stack(StackOp),
    Subroutine,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum StackOp {
    Pop,
    Pop2,
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Dup2X1,
    Dup2X2,
    Swap,
}

fn decode(insn: &Insn) -> Option<Effect> {
    let effect = match insn {
        Insn::Var { opcode, var } => {
            let var = usize::from(*var);
            match *opcode {
                ILOAD..=ALOAD => Effect::Load(var),
                ISTORE..=ASTORE => Effect::Store(var),
                RET => Effect::Subroutine,
                _ => return None,
            }
        }
        Insn::Iinc { var, .. } => Effect::Iinc(usize::from(*var)),
        Insn::Method {
            opcode, member, ..
        } => {
            let method = MethodType::parse(&member.descriptor).ok()?;
            let receiver = usize::from(*opcode != INVOKESTATIC);
            Effect::Invoke {
                arguments: method.arguments.len() + receiver,
                pushes: method.return_type.is_some(),
            }
        }
        Insn::InvokeDynamic { descriptor, .. } => {
            let method = MethodType::parse(descriptor).ok()?;
            Effect::Invoke {
                arguments: method.arguments.len(),
                pushes: method.return_type.is_some(),
            }
        }
        Insn::MultiANewArray { dimensions, .. } => {
            Effect::MultiANewArray(usize::from(*dimensions))
        }
        other => match other.opcode()? {
            NOP | GOTO | RETURN => Effect::Noop,
            ACONST_NULL | ICONST_M1..=DCONST_1 | BIPUSH | SIPUSH | LDC | NEW | GETSTATIC => {
                Effect::Push
            }
            IALOAD..=SALOAD => Effect::Binary { push: true },
            IASTORE..=SASTORE => Effect::Ternary,
            POP => Effect::Stack(StackOp::Pop),
            POP2 => Effect::Stack(StackOp::Pop2),
            DUP => Effect::Stack(StackOp::Dup),
            DUP_X1 => Effect::Stack(StackOp::DupX1),
            DUP_X2 => Effect::Stack(StackOp::DupX2),
            DUP2 => Effect::Stack(StackOp::Dup2),
            DUP2_X1 => Effect::Stack(StackOp::Dup2X1),
            DUP2_X2 => Effect::Stack(StackOp::Dup2X2),
            SWAP => Effect::Stack(StackOp::Swap),
            IADD..=DREM | ISHL..=LXOR | LCMP..=DCMPG => Effect::Binary { push: true },
            INEG..=DNEG | I2L..=I2S => Effect::Unary { push: true },
            IFEQ..=IFLE | IFNULL | IFNONNULL | TABLESWITCH | LOOKUPSWITCH => {
                Effect::Unary { push: false }
            }
            IF_ICMPEQ..=IF_ACMPNE => Effect::Binary { push: false },
            IRETURN..=ARETURN | PUTSTATIC | ATHROW | MONITORENTER | MONITOREXIT => {
                Effect::Unary { push: false }
            }
            GETFIELD | NEWARRAY | ANEWARRAY | ARRAYLENGTH | CHECKCAST | INSTANCEOF => {
                Effect::Unary { push: true }
            }
            PUTFIELD => Effect::Binary { push: false },
            JSR => Effect::Subroutine,
            _ => return None,
        },
    };
    Some(effect)
}

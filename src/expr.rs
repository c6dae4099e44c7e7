//! Instruction classification and expression-level edits.

use anyhow::{Context, Result};

use crate::descriptor::MethodType;
use crate::ir::{Constant, Insn, InsnId, InsnList};
use crate::opcodes::*;
use crate::stack::stack_metadata;

/// Controls which instructions count as free of side effects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PurityPolicy {
    /// Treat `*div` and `*rem` as pure even though a zero divisor throws.
    pub(crate) division_is_pure: bool,
}

impl Default for PurityPolicy {
    fn default() -> Self {
        Self {
            division_is_pure: true,
        }
    }
}

pub(crate) fn is_pure(insn: &Insn, policy: PurityPolicy) -> bool {
    let Some(opcode) = insn.opcode() else {
        return true;
    };
    match opcode {
        IDIV | LDIV | FDIV | DDIV | IREM | LREM | FREM | DREM => policy.division_is_pure,
        NOP | ACONST_NULL | ICONST_M1..=DCONST_1 | BIPUSH | SIPUSH | LDC => true,
        ILOAD | LLOAD | FLOAD | DLOAD | ALOAD => true,
        POP..=SWAP => true,
        IADD..=DMUL | INEG..=LXOR => true,
        I2L..=DCMPG => true,
        GETSTATIC | NEW | INSTANCEOF => true,
        _ => false,
    }
}

/// Control always reaches the next instruction.
pub(crate) fn is_sequential(insn: &Insn) -> bool {
    match insn {
        Insn::Label(_)
        | Insn::Jump { .. }
        | Insn::TableSwitch { .. }
        | Insn::LookupSwitch { .. } => false,
        other => !matches!(
            other.opcode(),
            Some(IRETURN..=RETURN | RET | ATHROW)
        ),
    }
}

pub(crate) fn int_constant(insn: &Insn) -> Option<i32> {
    match insn {
        Insn::Simple(opcode) if (ICONST_M1..=ICONST_5).contains(opcode) => {
            Some(i32::from(*opcode) - i32::from(ICONST_0))
        }
        Insn::Int { opcode, operand } if *opcode == BIPUSH || *opcode == SIPUSH => {
            Some(*operand)
        }
        Insn::Ldc(Constant::Int(value)) => Some(*value),
        _ => None,
    }
}

/// Shortest instruction pushing `value`.
pub(crate) fn create_int_constant(value: i32) -> Insn {
    if (-1..=5).contains(&value) {
        Insn::Simple((i32::from(ICONST_0) + value) as u8)
    } else if i8::try_from(value).is_ok() {
        Insn::Int {
            opcode: BIPUSH,
            operand: value,
        }
    } else if i16::try_from(value).is_ok() {
        Insn::Int {
            opcode: SIPUSH,
            operand: value,
        }
    } else {
        Insn::Ldc(Constant::Int(value))
    }
}

/// Walk backward from `last` until the instructions seen so far produce
/// `initial_height` slots (or, with zero, exactly consume what `last` pops).
///
/// Returns `None` when the walk hits the list start, a non-sequential
/// instruction, or one rejected by `filter`.
pub(crate) fn get_expression<F>(
    list: &InsnList,
    last: InsnId,
    filter: F,
    initial_height: usize,
) -> Result<Option<Vec<InsnId>>>
where
    F: Fn(&Insn) -> bool,
{
    let mut expression = Vec::new();
    let mut height = initial_height as i64;
    let mut current = last;
    loop {
        let insn = list.get(current).context("expression instruction not in list")?;
        let metadata = stack_metadata(insn)?;
        expression.push(current);
        if current != last || initial_height != 0 {
            height -= metadata.pushes as i64;
        }
        height += metadata.pops as i64;
        if height == 0 {
            expression.reverse();
            return Ok(Some(expression));
        }
        match list.previous(current) {
            Some(previous) => {
                let previous_insn = list
                    .get(previous)
                    .context("expression instruction not in list")?;
                if !is_sequential(previous_insn) || !filter(previous_insn) {
                    return Ok(None);
                }
                current = previous;
            }
            None => return Ok(None),
        }
    }
}

/// The expressions pushing each argument of the invoke `call`, in declaration
/// order. An instance call's receiver is not included.
pub(crate) fn get_argument_expressions<F>(
    list: &InsnList,
    call: InsnId,
    filter: F,
) -> Result<Option<Vec<Vec<InsnId>>>>
where
    F: Fn(&Insn) -> bool,
{
    let descriptor = match list.get(call).context("invoke not in list")? {
        Insn::Method { member, .. } => &member.descriptor,
        Insn::InvokeDynamic { descriptor, .. } => descriptor,
        other => anyhow::bail!("{other:?} is not an invoke"),
    };
    let arguments = MethodType::parse(descriptor)?.arguments;

    let mut expressions = Vec::with_capacity(arguments.len());
    let mut current = call;
    for argument in arguments.iter().rev() {
        let Some(previous) = list.previous(current) else {
            return Ok(None);
        };
        let previous_insn = list.get(previous).context("expression instruction not in list")?;
        if !is_sequential(previous_insn) || !filter(previous_insn) {
            return Ok(None);
        }
        let Some(expression) = get_expression(list, previous, &filter, argument.size())? else {
            return Ok(None);
        };
        current = expression[0];
        expressions.push(expression);
    }
    expressions.reverse();
    Ok(Some(expressions))
}

/// Replace the expression ending at `last` with a single instruction that keeps
/// `last`'s handle.
pub(crate) fn replace_expression<F>(
    list: &mut InsnList,
    last: InsnId,
    replacement: Insn,
    filter: F,
) -> Result<bool>
where
    F: Fn(&Insn) -> bool,
{
    let Some(expression) = get_expression(list, last, filter, 0)? else {
        return Ok(false);
    };
    for id in expression.into_iter().filter(|id| *id != last) {
        list.remove(id);
    }
    list.set(last, replacement);
    Ok(true)
}

pub(crate) fn delete_expression<F>(list: &mut InsnList, last: InsnId, filter: F) -> Result<bool>
where
    F: Fn(&Insn) -> bool,
{
    let Some(expression) = get_expression(list, last, filter, 0)? else {
        return Ok(false);
    };
    for id in expression {
        list.remove(id);
    }
    Ok(true)
}

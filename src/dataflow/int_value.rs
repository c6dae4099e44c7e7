use std::collections::BTreeSet;

use anyhow::Result;

use crate::dataflow::interpreter::{BasicInterpreter, BasicValue, Interpreter, Value};
use crate::descriptor::FieldType;
use crate::expr::int_constant;
use crate::ir::{Insn, InsnId};
use crate::opcodes::*;

/// Default bound on the number of constants tracked per value.
pub(crate) const DEFAULT_MAX_TRACKED_VALUES: usize = 8;

/// Integer value that is either unknown or one of a small set of constants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum IntValue {
    Unknown(BasicValue),
    /// Non-empty set of possible `int` values.
    Constant(BTreeSet<i32>),
}

impl IntValue {
    pub(crate) fn constant(value: i32) -> IntValue {
        IntValue::Constant(BTreeSet::from([value]))
    }

    pub(crate) fn basic(&self) -> BasicValue {
        match self {
            IntValue::Unknown(basic) => *basic,
            IntValue::Constant(_) => BasicValue::Int,
        }
    }

    pub(crate) fn values(&self) -> Option<&BTreeSet<i32>> {
        match self {
            IntValue::Constant(values) => Some(values),
            IntValue::Unknown(_) => None,
        }
    }

    pub(crate) fn singleton(&self) -> Option<i32> {
        match self {
            IntValue::Constant(values) if values.len() == 1 => values.first().copied(),
            _ => None,
        }
    }
}

impl Value for IntValue {
    fn size(&self) -> usize {
        self.basic().size()
    }
}

/// Constant-set interpreter for `int` arithmetic.
pub(crate) struct IntInterpreter {
    /// Known constant sets per argument slot (receiver excluded).
    parameters: Vec<Option<BTreeSet<i32>>>,
    max_tracked_values: usize,
}

impl IntInterpreter {
    pub(crate) fn new(max_tracked_values: usize) -> Self {
        Self {
            parameters: Vec::new(),
            max_tracked_values,
        }
    }

    pub(crate) fn with_parameters(mut self, parameters: Vec<Option<BTreeSet<i32>>>) -> Self {
        self.parameters = parameters;
        self
    }

    fn constants(&self, basic: BasicValue, values: BTreeSet<i32>) -> IntValue {
        if basic != BasicValue::Int || values.is_empty() || values.len() > self.max_tracked_values
        {
            IntValue::Unknown(basic)
        } else {
            IntValue::Constant(values)
        }
    }
}

impl Interpreter for IntInterpreter {
    type Value = IntValue;

    fn new_value(&self, field_type: Option<&FieldType>) -> IntValue {
        IntValue::Unknown(BasicInterpreter.new_value(field_type))
    }

    fn new_parameter_value(&self, is_instance: bool, local: usize, field_type: &FieldType) -> IntValue {
        let basic = BasicValue::of(field_type);
        let index = match (is_instance, local) {
            (true, 0) => return IntValue::Unknown(basic),
            (true, local) => local - 1,
            (false, local) => local,
        };
        match self.parameters.get(index) {
            Some(Some(values)) => self.constants(basic, values.clone()),
            _ => IntValue::Unknown(basic),
        }
    }

    fn new_operation(&self, id: InsnId, insn: &Insn) -> Result<IntValue> {
        let basic = BasicInterpreter.new_operation(id, insn)?;
        Ok(match int_constant(insn) {
            Some(value) => IntValue::constant(value),
            None => IntValue::Unknown(basic),
        })
    }

    fn copy_operation(&self, _id: InsnId, _insn: &Insn, value: &IntValue) -> Result<IntValue> {
        Ok(value.clone())
    }

    fn unary_operation(&self, id: InsnId, insn: &Insn, value: &IntValue) -> Result<Option<IntValue>> {
        let Some(basic) = BasicInterpreter.unary_operation(id, insn, &value.basic())? else {
            return Ok(None);
        };
        let Some(values) = value.values() else {
            return Ok(Some(IntValue::Unknown(basic)));
        };
        let apply: fn(i32, i32) -> i32 = match insn {
            Insn::Iinc { .. } => |v, increment| v.wrapping_add(increment),
            Insn::Simple(INEG) => |v, _| v.wrapping_neg(),
            Insn::Simple(I2B) => |v, _| i32::from(v as i8),
            Insn::Simple(I2C) => |v, _| i32::from(v as u16),
            Insn::Simple(I2S) => |v, _| i32::from(v as i16),
            _ => return Ok(Some(IntValue::Unknown(basic))),
        };
        let increment = match insn {
            Insn::Iinc { increment, .. } => i32::from(*increment),
            _ => 0,
        };
        let results = values.iter().map(|v| apply(*v, increment)).collect();
        Ok(Some(self.constants(basic, results)))
    }

    fn binary_operation(
        &self,
        id: InsnId,
        insn: &Insn,
        value1: &IntValue,
        value2: &IntValue,
    ) -> Result<Option<IntValue>> {
        let Some(basic) =
            BasicInterpreter.binary_operation(id, insn, &value1.basic(), &value2.basic())?
        else {
            return Ok(None);
        };
        let (Some(values1), Some(values2)) = (value1.values(), value2.values()) else {
            return Ok(Some(IntValue::Unknown(basic)));
        };
        let Some(opcode) = insn.opcode() else {
            return Ok(Some(IntValue::Unknown(basic)));
        };
        let mut results = BTreeSet::new();
        for v1 in values1 {
            for v2 in values2 {
                match fold_binary(opcode, *v1, *v2) {
                    Some(result) => results.insert(result),
                    None => return Ok(Some(IntValue::Unknown(basic))),
                };
            }
        }
        Ok(Some(self.constants(basic, results)))
    }

    fn ternary_operation(
        &self,
        _id: InsnId,
        _insn: &Insn,
        _values: [&IntValue; 3],
    ) -> Result<Option<IntValue>> {
        Ok(None)
    }

    fn nary_operation(&self, id: InsnId, insn: &Insn, values: &[IntValue]) -> Result<Option<IntValue>> {
        let basics: Vec<BasicValue> = values.iter().map(IntValue::basic).collect();
        Ok(BasicInterpreter
            .nary_operation(id, insn, &basics)?
            .map(IntValue::Unknown))
    }

    fn merge(&self, value1: &IntValue, value2: &IntValue) -> IntValue {
        if value1 == value2 {
            return value1.clone();
        }
        let basic = BasicInterpreter.merge(&value1.basic(), &value2.basic());
        match (value1.values(), value2.values()) {
            (Some(values1), Some(values2)) => {
                self.constants(basic, values1.union(values2).copied().collect())
            }
            _ => IntValue::Unknown(basic),
        }
    }
}

/// `None` when the result is not a constant (division by zero or a non-`int` opcode).
fn fold_binary(opcode: u8, v1: i32, v2: i32) -> Option<i32> {
    let result = match opcode {
        IADD => v1.wrapping_add(v2),
        ISUB => v1.wrapping_sub(v2),
        IMUL => v1.wrapping_mul(v2),
        IDIV if v2 != 0 => v1.wrapping_div(v2),
        IREM if v2 != 0 => v1.wrapping_rem(v2),
        ISHL => v1.wrapping_shl(v2 as u32),
        ISHR => v1.wrapping_shr(v2 as u32),
        IUSHR => (v1 as u32).wrapping_shr(v2 as u32) as i32,
        IAND => v1 & v2,
        IOR => v1 | v2,
        IXOR => v1 ^ v2,
        _ => return None,
    };
    Some(result)
}

use std::fmt::Debug;

use anyhow::{Context, Result};

use crate::descriptor::{FieldType, MethodType};
use crate::ir::{Constant, Insn, InsnId};
use crate::opcodes::*;

/// Abstract value tracked in frames.
pub(crate) trait Value: Clone + Debug + PartialEq {
    /// Slots taken in the local variable table.
    fn size(&self) -> usize;
}

/// Verification type of a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum BasicValue {
    /// Unusable slot: the upper half of a wide value or a local with no single type.
    Uninitialized,
    Int,
    Float,
    Long,
    Double,
    Reference,
    ReturnAddress,
}

impl Value for BasicValue {
    fn size(&self) -> usize {
        match self {
            BasicValue::Long | BasicValue::Double => 2,
            _ => 1,
        }
    }
}

impl BasicValue {
    pub(crate) fn of(field_type: &FieldType) -> BasicValue {
        match field_type {
            FieldType::Boolean
            | FieldType::Byte
            | FieldType::Char
            | FieldType::Short
            | FieldType::Int => BasicValue::Int,
            FieldType::Float => BasicValue::Float,
            FieldType::Long => BasicValue::Long,
            FieldType::Double => BasicValue::Double,
            FieldType::Object(_) | FieldType::Array(_) => BasicValue::Reference,
        }
    }
}

/// Transfer functions used by the analyzer.
///
/// Operations returning `None` produce no stack value (branches, stores into
/// fields, `void` invokes).
pub(crate) trait Interpreter {
    type Value: Value;

    fn new_value(&self, field_type: Option<&FieldType>) -> Self::Value;

    fn new_parameter_value(
        &self,
        _is_instance: bool,
        _local: usize,
        field_type: &FieldType,
    ) -> Self::Value {
        self.new_value(Some(field_type))
    }

    fn new_empty_value(&self, _local: usize) -> Self::Value {
        self.new_value(None)
    }

    fn new_exception_value(&self, catch_type: Option<&str>) -> Self::Value {
        let class = catch_type.unwrap_or("java/lang/Throwable").to_string();
        self.new_value(Some(&FieldType::Object(class)))
    }

    fn new_operation(&self, id: InsnId, insn: &Insn) -> Result<Self::Value>;

    fn copy_operation(
        &self,
        id: InsnId,
        insn: &Insn,
        value: &Self::Value,
    ) -> Result<Self::Value>;

    fn unary_operation(
        &self,
        id: InsnId,
        insn: &Insn,
        value: &Self::Value,
    ) -> Result<Option<Self::Value>>;

    fn binary_operation(
        &self,
        id: InsnId,
        insn: &Insn,
        value1: &Self::Value,
        value2: &Self::Value,
    ) -> Result<Option<Self::Value>>;

    fn ternary_operation(
        &self,
        id: InsnId,
        insn: &Insn,
        values: [&Self::Value; 3],
    ) -> Result<Option<Self::Value>>;

    fn nary_operation(
        &self,
        id: InsnId,
        insn: &Insn,
        values: &[Self::Value],
    ) -> Result<Option<Self::Value>>;

    fn merge(&self, value1: &Self::Value, value2: &Self::Value) -> Self::Value;
}

/// Interpreter over [`BasicValue`]s.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct BasicInterpreter;

impl Interpreter for BasicInterpreter {
    type Value = BasicValue;

    fn new_value(&self, field_type: Option<&FieldType>) -> BasicValue {
        field_type.map_or(BasicValue::Uninitialized, BasicValue::of)
    }

    fn new_operation(&self, _id: InsnId, insn: &Insn) -> Result<BasicValue> {
        let value = match insn {
            Insn::Ldc(constant) => match constant {
                Constant::Int(_) => BasicValue::Int,
                Constant::Float(_) => BasicValue::Float,
                Constant::Long(_) => BasicValue::Long,
                Constant::Double(_) => BasicValue::Double,
                Constant::String(_) | Constant::Class(_) | Constant::Other => {
                    BasicValue::Reference
                }
            },
            Insn::Field { member, .. } => BasicValue::of(&FieldType::parse(&member.descriptor)?),
            other => match other.opcode().context("pseudo-instruction has no value")? {
                ACONST_NULL | NEW => BasicValue::Reference,
                ICONST_M1..=ICONST_5 | BIPUSH | SIPUSH => BasicValue::Int,
                LCONST_0 | LCONST_1 => BasicValue::Long,
                FCONST_0..=FCONST_2 => BasicValue::Float,
                DCONST_0 | DCONST_1 => BasicValue::Double,
                JSR => BasicValue::ReturnAddress,
                opcode => anyhow::bail!("opcode 0x{opcode:02x} is not a value producer"),
            },
        };
        Ok(value)
    }

    fn copy_operation(&self, _id: InsnId, _insn: &Insn, value: &BasicValue) -> Result<BasicValue> {
        Ok(*value)
    }

    fn unary_operation(
        &self,
        _id: InsnId,
        insn: &Insn,
        _value: &BasicValue,
    ) -> Result<Option<BasicValue>> {
        if let Insn::Field { member, .. } = insn {
            // getfield pushes, putstatic does not.
            if insn.opcode() == Some(GETFIELD) {
                return Ok(Some(BasicValue::of(&FieldType::parse(&member.descriptor)?)));
            }
            return Ok(None);
        }
        let opcode = insn.opcode().context("pseudo-instruction has no value")?;
        let value = match opcode {
            INEG | IINC | L2I | F2I | D2I | I2B | I2C | I2S | ARRAYLENGTH | INSTANCEOF => {
                BasicValue::Int
            }
            FNEG | I2F | L2F | D2F => BasicValue::Float,
            LNEG | I2L | F2L | D2L => BasicValue::Long,
            DNEG | I2D | L2D | F2D => BasicValue::Double,
            NEWARRAY | ANEWARRAY | CHECKCAST => BasicValue::Reference,
            _ => return Ok(None),
        };
        Ok(Some(value))
    }

    fn binary_operation(
        &self,
        _id: InsnId,
        insn: &Insn,
        _value1: &BasicValue,
        _value2: &BasicValue,
    ) -> Result<Option<BasicValue>> {
        let opcode = insn.opcode().context("pseudo-instruction has no value")?;
        let value = match opcode {
            IALOAD | BALOAD | CALOAD | SALOAD | IADD | ISUB | IMUL | IDIV | IREM | ISHL | ISHR
            | IUSHR | IAND | IOR | IXOR | LCMP | FCMPL | FCMPG | DCMPL | DCMPG => BasicValue::Int,
            FALOAD | FADD | FSUB | FMUL | FDIV | FREM => BasicValue::Float,
            LALOAD | LADD | LSUB | LMUL | LDIV | LREM | LSHL | LSHR | LUSHR | LAND | LOR
            | LXOR => BasicValue::Long,
            DALOAD | DADD | DSUB | DMUL | DDIV | DREM => BasicValue::Double,
            AALOAD => BasicValue::Reference,
            _ => return Ok(None),
        };
        Ok(Some(value))
    }

    fn ternary_operation(
        &self,
        _id: InsnId,
        _insn: &Insn,
        _values: [&BasicValue; 3],
    ) -> Result<Option<BasicValue>> {
        Ok(None)
    }

    fn nary_operation(
        &self,
        _id: InsnId,
        insn: &Insn,
        _values: &[BasicValue],
    ) -> Result<Option<BasicValue>> {
        let value = match insn {
            Insn::MultiANewArray { .. } => Some(BasicValue::Reference),
            Insn::Method { member, .. } => MethodType::parse(&member.descriptor)?
                .return_type
                .as_ref()
                .map(BasicValue::of),
            Insn::InvokeDynamic { descriptor, .. } => MethodType::parse(descriptor)?
                .return_type
                .as_ref()
                .map(BasicValue::of),
            _ => None,
        };
        Ok(value)
    }

    fn merge(&self, value1: &BasicValue, value2: &BasicValue) -> BasicValue {
        if value1 == value2 {
            *value1
        } else {
            BasicValue::Uninitialized
        }
    }
}

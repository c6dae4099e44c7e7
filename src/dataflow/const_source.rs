use anyhow::Result;

use crate::dataflow::interpreter::{BasicInterpreter, BasicValue, Interpreter, Value};
use crate::descriptor::FieldType;
use crate::expr::int_constant;
use crate::ir::{Insn, InsnId};

/// Where a value came from, as far as argument removal cares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SourceValue {
    Unknown(BasicValue),
    /// Pushed by exactly one `int` constant instruction.
    Single { basic: BasicValue, source: InsnId },
    /// Flows from a method parameter (or the receiver).
    Arg(BasicValue),
}

impl SourceValue {
    pub(crate) fn basic(&self) -> BasicValue {
        match self {
            SourceValue::Unknown(basic)
            | SourceValue::Single { basic, .. }
            | SourceValue::Arg(basic) => *basic,
        }
    }

    pub(crate) fn source(&self) -> Option<InsnId> {
        match self {
            SourceValue::Single { source, .. } => Some(*source),
            _ => None,
        }
    }

    pub(crate) fn is_arg(&self) -> bool {
        matches!(self, SourceValue::Arg(_))
    }
}

impl Value for SourceValue {
    fn size(&self) -> usize {
        self.basic().size()
    }
}

/// Tracks single constant producers and parameter flow. Arithmetic of any kind
/// loses the source.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ConstSourceInterpreter;

impl Interpreter for ConstSourceInterpreter {
    type Value = SourceValue;

    fn new_value(&self, field_type: Option<&FieldType>) -> SourceValue {
        SourceValue::Unknown(BasicInterpreter.new_value(field_type))
    }

    fn new_parameter_value(
        &self,
        _is_instance: bool,
        _local: usize,
        field_type: &FieldType,
    ) -> SourceValue {
        SourceValue::Arg(BasicValue::of(field_type))
    }

    fn new_operation(&self, id: InsnId, insn: &Insn) -> Result<SourceValue> {
        let basic = BasicInterpreter.new_operation(id, insn)?;
        Ok(match int_constant(insn) {
            Some(_) => SourceValue::Single { basic, source: id },
            None => SourceValue::Unknown(basic),
        })
    }

    fn copy_operation(&self, id: InsnId, insn: &Insn, value: &SourceValue) -> Result<SourceValue> {
        let basic = BasicInterpreter.copy_operation(id, insn, &value.basic())?;
        Ok(SourceValue::Unknown(basic))
    }

    fn unary_operation(
        &self,
        id: InsnId,
        insn: &Insn,
        value: &SourceValue,
    ) -> Result<Option<SourceValue>> {
        Ok(BasicInterpreter
            .unary_operation(id, insn, &value.basic())?
            .map(SourceValue::Unknown))
    }

    fn binary_operation(
        &self,
        id: InsnId,
        insn: &Insn,
        value1: &SourceValue,
        value2: &SourceValue,
    ) -> Result<Option<SourceValue>> {
        Ok(BasicInterpreter
            .binary_operation(id, insn, &value1.basic(), &value2.basic())?
            .map(SourceValue::Unknown))
    }

    fn ternary_operation(
        &self,
        _id: InsnId,
        _insn: &Insn,
        _values: [&SourceValue; 3],
    ) -> Result<Option<SourceValue>> {
        Ok(None)
    }

    fn nary_operation(
        &self,
        id: InsnId,
        insn: &Insn,
        values: &[SourceValue],
    ) -> Result<Option<SourceValue>> {
        let basics: Vec<BasicValue> = values.iter().map(SourceValue::basic).collect();
        Ok(BasicInterpreter
            .nary_operation(id, insn, &basics)?
            .map(SourceValue::Unknown))
    }

    fn merge(&self, value1: &SourceValue, value2: &SourceValue) -> SourceValue {
        let basic = BasicInterpreter.merge(&value1.basic(), &value2.basic());
        if value1.is_arg() || value2.is_arg() {
            SourceValue::Arg(basic)
        } else if value1 == value2 {
            *value1
        } else {
            SourceValue::Unknown(basic)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataflow::analyzer::analyze;
    use crate::ir::{AccessFlags, InsnList, Method};
    use crate::opcodes::*;

    fn method(descriptor: &str, access: AccessFlags, max_locals: u16, list: InsnList) -> Method {
        Method {
            name: "m".to_string(),
            descriptor: descriptor.to_string(),
            access,
            max_locals,
            instructions: list,
            try_catch_blocks: Vec::new(),
        }
    }

    #[test]
    fn constants_are_single_sources_until_copied() {
        let mut list = InsnList::new();
        let constant = list.push(Insn::Simple(ICONST_3));
        list.push(Insn::Var {
            opcode: ISTORE,
            var: 0,
        });
        list.push(Insn::Var {
            opcode: ILOAD,
            var: 0,
        });
        list.push(Insn::Simple(IRETURN));
        let method = method("()I", AccessFlags::STATIC, 1, list);
        let analysis = analyze("A", &method, &ConstSourceInterpreter).expect("analyze");
        let before_store = analysis.frame(1).expect("frame");
        assert_eq!(before_store.peek(0).and_then(SourceValue::source), Some(constant));
        let before_return = analysis.frame(3).expect("frame");
        assert_eq!(
            before_return.peek(0),
            Some(&SourceValue::Unknown(BasicValue::Int))
        );
    }

    #[test]
    fn parameters_and_receiver_are_args() {
        let mut list = InsnList::new();
        list.push(Insn::Simple(RETURN));
        let method = method("(I)V", AccessFlags::empty(), 2, list);
        let analysis = analyze("A", &method, &ConstSourceInterpreter).expect("analyze");
        let frame = analysis.frame(0).expect("frame");
        assert_eq!(frame.local(0), Some(&SourceValue::Arg(BasicValue::Reference)));
        assert_eq!(frame.local(1), Some(&SourceValue::Arg(BasicValue::Int)));
    }

    #[test]
    fn arg_absorbs_on_merge() {
        let interpreter = ConstSourceInterpreter;
        let mut list = InsnList::new();
        let single = SourceValue::Single {
            basic: BasicValue::Int,
            source: list.push(Insn::Simple(ICONST_0)),
        };
        let arg = SourceValue::Arg(BasicValue::Int);
        assert_eq!(interpreter.merge(&single, &arg), arg);
        assert_eq!(interpreter.merge(&arg, &single), arg);
        assert_eq!(interpreter.merge(&single, &single), single);
        let other = SourceValue::Single {
            basic: BasicValue::Int,
            source: list.push(Insn::Simple(ICONST_1)),
        };
        assert_eq!(
            interpreter.merge(&single, &other),
            SourceValue::Unknown(BasicValue::Int)
        );
    }
}

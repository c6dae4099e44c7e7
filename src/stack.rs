use anyhow::{Context, Result};

use crate::descriptor::{MethodType, field_size};
use crate::ir::{Constant, Insn};
use crate::opcodes::*;

/// Operand stack effect of one instruction, in slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct StackMetadata {
    pub(crate) pops: usize,
    pub(crate) pushes: usize,
}

const fn effect(pops: usize, pushes: usize) -> StackMetadata {
    StackMetadata { pops, pushes }
}

const NONE: StackMetadata = effect(0, 0);

/// Stack effect of `insn`; pseudo-instructions have none.
pub(crate) fn stack_metadata(insn: &Insn) -> Result<StackMetadata> {
    let metadata = match insn {
        Insn::Label(_) | Insn::LineNumber { .. } => NONE,
        Insn::Ldc(Constant::Long(_) | Constant::Double(_)) => effect(0, 2),
        Insn::Ldc(_) => effect(0, 1),
        Insn::Field { opcode, member } => {
            let size = field_size(&member.descriptor)
                .with_context(|| format!("field instruction {member}"))?;
            let receiver = usize::from(*opcode == GETFIELD || *opcode == PUTFIELD);
            if *opcode == PUTFIELD || *opcode == PUTSTATIC {
                effect(receiver + size, 0)
            } else {
                effect(receiver, size)
            }
        }
        Insn::Method { opcode, member, .. } => {
            let method = MethodType::parse(&member.descriptor)
                .with_context(|| format!("method instruction {member}"))?;
            let receiver = usize::from(*opcode != INVOKESTATIC);
            effect(method.argument_size() + receiver, method.return_size())
        }
        Insn::InvokeDynamic { descriptor, .. } => {
            let method = MethodType::parse(descriptor)?;
            effect(method.argument_size(), method.return_size())
        }
        Insn::MultiANewArray { dimensions, .. } => effect(usize::from(*dimensions), 1),
        Insn::Iinc { .. } => NONE,
        Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => effect(1, 0),
        Insn::Simple(opcode)
        | Insn::Int { opcode, .. }
        | Insn::Var { opcode, .. }
        | Insn::Type { opcode, .. }
        | Insn::Jump { opcode, .. } => simple(*opcode)
            .with_context(|| format!("no stack metadata for opcode 0x{opcode:02x}"))?,
    };
    Ok(metadata)
}

fn simple(opcode: u8) -> Option<StackMetadata> {
    let metadata = match opcode {
        NOP | GOTO | RET | RETURN => NONE,
        ACONST_NULL | ICONST_M1..=ICONST_5 | FCONST_0..=FCONST_2 | BIPUSH | SIPUSH => {
            effect(0, 1)
        }
        LCONST_0 | LCONST_1 | DCONST_0 | DCONST_1 => effect(0, 2),
        ILOAD | FLOAD | ALOAD | NEW | JSR => effect(0, 1),
        LLOAD | DLOAD => effect(0, 2),
        IALOAD | FALOAD | AALOAD | BALOAD | CALOAD | SALOAD => effect(2, 1),
        LALOAD | DALOAD => effect(2, 2),
        ISTORE | FSTORE | ASTORE | POP => effect(1, 0),
        LSTORE | DSTORE | POP2 => effect(2, 0),
        IASTORE | FASTORE | AASTORE | BASTORE | CASTORE | SASTORE => effect(3, 0),
        LASTORE | DASTORE => effect(4, 0),
        DUP => effect(1, 2),
        DUP_X1 => effect(2, 3),
        DUP_X2 => effect(3, 4),
        DUP2 => effect(2, 4),
        DUP2_X1 => effect(3, 5),
        DUP2_X2 => effect(4, 6),
        SWAP => effect(2, 2),
        IADD | FADD | ISUB | FSUB | IMUL | FMUL | IDIV | FDIV | IREM | FREM | ISHL | ISHR
        | IUSHR | IAND | IOR | IXOR | FCMPL | FCMPG => effect(2, 1),
        LADD | DADD | LSUB | DSUB | LMUL | DMUL | LDIV | DDIV | LREM | DREM | LAND | LOR
        | LXOR => effect(4, 2),
        LSHL | LSHR | LUSHR => effect(3, 2),
        INEG | FNEG | I2F | F2I | I2B | I2C | I2S => effect(1, 1),
        LNEG | DNEG | L2D | D2L => effect(2, 2),
        I2L | I2D | F2L | F2D => effect(1, 2),
        L2I | L2F | D2I | D2F => effect(2, 1),
        LCMP | DCMPL | DCMPG => effect(4, 1),
        IFEQ..=IFLE | IFNULL | IFNONNULL => effect(1, 0),
        IF_ICMPEQ..=IF_ACMPNE => effect(2, 0),
        IRETURN | FRETURN | ARETURN | ATHROW | MONITORENTER | MONITOREXIT => effect(1, 0),
        LRETURN | DRETURN => effect(2, 0),
        NEWARRAY | ANEWARRAY | ARRAYLENGTH | CHECKCAST | INSTANCEOF => effect(1, 1),
        _ => return None,
    };
    Some(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::MemberRef;

    #[test]
    fn invoke_counts_receiver_and_wide_arguments() {
        let virtual_call = Insn::Method {
            opcode: INVOKEVIRTUAL,
            member: MemberRef::new("a", "b", "(JI)D"),
            interface: false,
        };
        assert_eq!(stack_metadata(&virtual_call).expect("metadata"), effect(4, 2));
        let static_call = Insn::Method {
            opcode: INVOKESTATIC,
            member: MemberRef::new("a", "b", "(I)V"),
            interface: false,
        };
        assert_eq!(stack_metadata(&static_call).expect("metadata"), effect(1, 0));
    }

    #[test]
    fn field_instructions_use_field_size() {
        let put = Insn::Field {
            opcode: PUTFIELD,
            member: MemberRef::new("a", "b", "J"),
        };
        assert_eq!(stack_metadata(&put).expect("metadata"), effect(3, 0));
        let get = Insn::Field {
            opcode: GETSTATIC,
            member: MemberRef::new("a", "b", "I"),
        };
        assert_eq!(stack_metadata(&get).expect("metadata"), effect(0, 1));
    }

    #[test]
    fn constants_and_pseudo_instructions() {
        assert_eq!(
            stack_metadata(&Insn::Ldc(Constant::Double(1.0))).expect("metadata"),
            effect(0, 2)
        );
        assert_eq!(
            stack_metadata(&Insn::Label(crate::ir::LabelId(0))).expect("metadata"),
            NONE
        );
        assert!(stack_metadata(&Insn::Simple(0xca)).is_err());
    }
}

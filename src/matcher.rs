//! Regular expressions over instruction opcodes.
//!
//! Each opcode is encoded as one private-use codepoint, so a pattern such as
//! `ICONST_0 ISTORE` becomes an ordinary text regex over the encoded method body.

use anyhow::Result;
use regex::Regex;

use crate::error::DeobError;
use crate::ir::{InsnId, InsnList};
use crate::opcodes::*;

const PRIVATE_USE_AREA: u32 = 0xE000;
/// UTF-8 width of every encoded opcode.
const CODEPOINT_WIDTH: usize = 3;

/// Compiled instruction pattern.
#[derive(Clone, Debug)]
pub(crate) struct InsnMatcher {
    regex: Regex,
}

impl InsnMatcher {
    pub(crate) fn compile(pattern: &str) -> Result<InsnMatcher> {
        let malformed = |reason: String| DeobError::MalformedPattern {
            pattern: pattern.to_string(),
            reason,
        };

        let mut translated = String::new();
        let mut token = String::new();
        let mut in_repetition = false;
        for c in pattern.chars() {
            if in_repetition {
                translated.push(c);
                in_repetition = c != '}';
                continue;
            }
            if c.is_alphanumeric() || c == '_' {
                token.push(c);
                continue;
            }
            if !token.is_empty() {
                append_token(&mut translated, &token).map_err(malformed)?;
                token.clear();
            }
            if c == '{' {
                in_repetition = true;
            }
            if !c.is_whitespace() {
                translated.push(c);
            }
        }
        if !token.is_empty() {
            append_token(&mut translated, &token).map_err(malformed)?;
        }

        let regex = Regex::new(&translated).map_err(|err| malformed(err.to_string()))?;
        Ok(InsnMatcher { regex })
    }

    /// Every non-overlapping match, left to right, as instruction handles.
    /// Pseudo-instructions are skipped and never appear in a match.
    pub(crate) fn match_list(&self, list: &InsnList) -> Vec<Vec<InsnId>> {
        let mut ids = Vec::with_capacity(list.len());
        let mut encoded = String::with_capacity(list.len() * CODEPOINT_WIDTH);
        for (id, insn) in list.iter() {
            if let Some(opcode) = insn.opcode() {
                ids.push(id);
                encoded.push(codepoint(opcode));
            }
        }
        self.regex
            .find_iter(&encoded)
            .map(|found| {
                ids[found.start() / CODEPOINT_WIDTH..found.end() / CODEPOINT_WIDTH].to_vec()
            })
            .collect()
    }
}

fn codepoint(opcode: u8) -> char {
    char::from_u32(PRIVATE_USE_AREA + u32::from(opcode)).unwrap_or(char::REPLACEMENT_CHARACTER)
}

fn append_token(translated: &mut String, token: &str) -> std::result::Result<(), String> {
    if let Some(opcode) = opcode_for(token) {
        translated.push(codepoint(opcode));
        return Ok(());
    }
    if let Some(members) = group(token) {
        translated.push('(');
        for (index, opcode) in members.into_iter().enumerate() {
            if index > 0 {
                translated.push('|');
            }
            translated.push(codepoint(opcode));
        }
        translated.push(')');
        return Ok(());
    }
    if token == "AbstractInsnNode" {
        translated.push('.');
        return Ok(());
    }
    Err(format!("{token} is not a valid opcode or opcode group"))
}

/// Opcodes sharing one instruction shape, plus the constant-push shorthands.
fn group(name: &str) -> Option<Vec<u8>> {
    let member: fn(u8) -> bool = match name {
        "InsnNode" => |op| {
            matches!(
                op,
                NOP..=DCONST_1
                    | IALOAD..=SALOAD
                    | IASTORE..=SASTORE
                    | POP..=LXOR
                    | I2L..=DCMPG
                    | IRETURN..=RETURN
                    | ARRAYLENGTH
                    | ATHROW
                    | MONITORENTER
                    | MONITOREXIT
            )
        },
        "IntInsnNode" => |op| matches!(op, BIPUSH | SIPUSH | NEWARRAY),
        "VarInsnNode" => |op| matches!(op, ILOAD..=ALOAD | ISTORE..=ASTORE | RET),
        "TypeInsnNode" => |op| matches!(op, NEW | ANEWARRAY | CHECKCAST | INSTANCEOF),
        "FieldInsnNode" => |op| matches!(op, GETSTATIC..=PUTFIELD),
        "MethodInsnNode" => |op| matches!(op, INVOKEVIRTUAL..=INVOKEINTERFACE),
        "InvokeDynamicInsnNode" => |op| op == INVOKEDYNAMIC,
        "JumpInsnNode" => |op| matches!(op, IFEQ..=JSR | IFNULL | IFNONNULL),
        "LdcInsnNode" => |op| op == LDC,
        "IincInsnNode" => |op| op == IINC,
        "TableSwitchInsnNode" => |op| op == TABLESWITCH,
        "LookupSwitchInsnNode" => |op| op == LOOKUPSWITCH,
        "MultiANewArrayInsnNode" => |op| op == MULTIANEWARRAY,
        "ICONST" => |op| matches!(op, ICONST_M1..=ICONST_5),
        "FCONST" => |op| matches!(op, FCONST_0..=FCONST_2),
        "DCONST" => |op| matches!(op, DCONST_0 | DCONST_1),
        _ => return None,
    };
    Some(
        (0..=u8::MAX)
            .filter(|op| mnemonic(*op).is_some() && member(*op))
            .collect(),
    )
}

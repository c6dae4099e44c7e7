use std::fmt;

use bitflags::bitflags;
use serde::Serialize;

use crate::opcodes;

bitflags! {
    /// JVM access flags shared by classes, fields and methods.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub(crate) struct AccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SUPER = 0x0020;
        const NATIVE = 0x0100;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
    }
}

/// Intermediate representation for a class being transformed.
#[derive(Clone, Debug)]
pub(crate) struct Class {
    pub(crate) name: String,
    pub(crate) super_name: Option<String>,
    pub(crate) interfaces: Vec<String>,
    pub(crate) access: AccessFlags,
    pub(crate) fields: Vec<Field>,
    pub(crate) methods: Vec<Method>,
}

impl Class {
    pub(crate) fn new(name: &str, super_name: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            super_name: super_name.map(str::to_string),
            interfaces: Vec::new(),
            access: AccessFlags::PUBLIC | AccessFlags::SUPER,
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub(crate) fn is_interface(&self) -> bool {
        self.access.contains(AccessFlags::INTERFACE)
    }

    pub(crate) fn field(&self, member: &MemberDesc) -> Option<&Field> {
        self.fields.iter().find(|field| field.desc() == *member)
    }

    pub(crate) fn method(&self, member: &MemberDesc) -> Option<&Method> {
        self.methods.iter().find(|method| method.desc() == *member)
    }

    pub(crate) fn method_mut(&mut self, member: &MemberDesc) -> Option<&mut Method> {
        self.methods.iter_mut().find(|method| method.desc() == *member)
    }

    pub(crate) fn remove_field(&mut self, member: &MemberDesc) -> Option<Field> {
        let index = self.fields.iter().position(|field| field.desc() == *member)?;
        Some(self.fields.remove(index))
    }
}

/// Field declared by a class.
#[derive(Clone, Debug)]
pub(crate) struct Field {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) access: AccessFlags,
}

impl Field {
    pub(crate) fn desc(&self) -> MemberDesc {
        MemberDesc::new(&self.name, &self.descriptor)
    }
}

/// Method declared by a class, with its instruction list when it has code.
#[derive(Clone, Debug)]
pub(crate) struct Method {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) access: AccessFlags,
    pub(crate) max_locals: u16,
    pub(crate) instructions: InsnList,
    pub(crate) try_catch_blocks: Vec<TryCatchBlock>,
}

impl Method {
    pub(crate) fn desc(&self) -> MemberDesc {
        MemberDesc::new(&self.name, &self.descriptor)
    }

    pub(crate) fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }

    /// Native and abstract methods carry no instructions.
    pub(crate) fn has_code(&self) -> bool {
        !self
            .access
            .intersects(AccessFlags::NATIVE | AccessFlags::ABSTRACT)
    }
}

/// Exception range; `catch_type` is `None` for `finally` handlers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct TryCatchBlock {
    pub(crate) start: LabelId,
    pub(crate) end: LabelId,
    pub(crate) handler: LabelId,
    pub(crate) catch_type: Option<String>,
}

/// Member identity within its owner.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub(crate) struct MemberDesc {
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

impl MemberDesc {
    pub(crate) fn new(name: &str, descriptor: &str) -> Self {
        Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }
}

/// Fully qualified member reference.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub(crate) struct MemberRef {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

impl MemberRef {
    pub(crate) fn new(owner: &str, name: &str, descriptor: &str) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }

    pub(crate) fn of(owner: &str, member: &MemberDesc) -> Self {
        Self::new(owner, &member.name, &member.descriptor)
    }

    pub(crate) fn desc(&self) -> MemberDesc {
        MemberDesc::new(&self.name, &self.descriptor)
    }
}

impl fmt::Display for MemberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} {}", self.owner, self.name, self.descriptor)
    }
}

/// Stable handle to an instruction inside one [`InsnList`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct InsnId(u32);

/// Branch target identity, placed in a list by an [`Insn::Label`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct LabelId(pub(crate) u32);

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Constant {
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(String),
    Class(String),
    /// Method handles, method types and dynamic constants.
    Other,
}

/// Canonical instruction. Pseudo-instructions (`Label`, `LineNumber`) have no opcode.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Insn {
    Label(LabelId),
    LineNumber {
        line: u16,
        start: LabelId,
    },
    Simple(u8),
    Int {
        opcode: u8,
        operand: i32,
    },
    Var {
        opcode: u8,
        var: u16,
    },
    Type {
        opcode: u8,
        class: String,
    },
    Field {
        opcode: u8,
        member: MemberRef,
    },
    Method {
        opcode: u8,
        member: MemberRef,
        interface: bool,
    },
    InvokeDynamic {
        name: String,
        descriptor: String,
    },
    Jump {
        opcode: u8,
        target: LabelId,
    },
    Ldc(Constant),
    Iinc {
        var: u16,
        increment: i16,
    },
    TableSwitch {
        low: i32,
        high: i32,
        default: LabelId,
        targets: Vec<LabelId>,
    },
    LookupSwitch {
        default: LabelId,
        pairs: Vec<(i32, LabelId)>,
    },
    MultiANewArray {
        descriptor: String,
        dimensions: u8,
    },
}

impl Insn {
    pub(crate) fn opcode(&self) -> Option<u8> {
        let opcode = match self {
            Insn::Label(_) | Insn::LineNumber { .. } => return None,
            Insn::Simple(opcode)
            | Insn::Int { opcode, .. }
            | Insn::Var { opcode, .. }
            | Insn::Type { opcode, .. }
            | Insn::Field { opcode, .. }
            | Insn::Method { opcode, .. }
            | Insn::Jump { opcode, .. } => *opcode,
            Insn::InvokeDynamic { .. } => opcodes::INVOKEDYNAMIC,
            Insn::Ldc(_) => opcodes::LDC,
            Insn::Iinc { .. } => opcodes::IINC,
            Insn::TableSwitch { .. } => opcodes::TABLESWITCH,
            Insn::LookupSwitch { .. } => opcodes::LOOKUPSWITCH,
            Insn::MultiANewArray { .. } => opcodes::MULTIANEWARRAY,
        };
        Some(opcode)
    }

    pub(crate) fn is_pseudo(&self) -> bool {
        self.opcode().is_none()
    }

    /// Branch targets of jumps and switches, default first.
    pub(crate) fn targets(&self) -> Vec<LabelId> {
        match self {
            Insn::Jump { target, .. } => vec![*target],
            Insn::TableSwitch {
                default, targets, ..
            } => std::iter::once(*default)
                .chain(targets.iter().copied())
                .collect(),
            Insn::LookupSwitch { default, pairs } => std::iter::once(*default)
                .chain(pairs.iter().map(|(_, label)| *label))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Ordered instruction arena for one method.
///
/// Handles stay valid across insertions and removals of other instructions;
/// positional navigation is a linear scan.
#[derive(Clone, Debug, Default)]
pub(crate) struct InsnList {
    entries: Vec<(InsnId, Insn)>,
    next_id: u32,
    next_label: u32,
}

impl InsnList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (InsnId, &Insn)> {
        self.entries.iter().map(|(id, insn)| (*id, insn))
    }

    pub(crate) fn ids(&self) -> Vec<InsnId> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    pub(crate) fn at(&self, index: usize) -> Option<(InsnId, &Insn)> {
        self.entries.get(index).map(|(id, insn)| (*id, insn))
    }

    pub(crate) fn index_of(&self, id: InsnId) -> Option<usize> {
        self.entries.iter().position(|(candidate, _)| *candidate == id)
    }

    pub(crate) fn contains(&self, id: InsnId) -> bool {
        self.index_of(id).is_some()
    }

    pub(crate) fn get(&self, id: InsnId) -> Option<&Insn> {
        self.entries
            .iter()
            .find(|(candidate, _)| *candidate == id)
            .map(|(_, insn)| insn)
    }

    pub(crate) fn get_mut(&mut self, id: InsnId) -> Option<&mut Insn> {
        self.entries
            .iter_mut()
            .find(|(candidate, _)| *candidate == id)
            .map(|(_, insn)| insn)
    }

    pub(crate) fn push(&mut self, insn: Insn) -> InsnId {
        let id = self.allocate(&insn);
        self.entries.push((id, insn));
        id
    }

    pub(crate) fn insert_after(&mut self, anchor: InsnId, insn: Insn) -> Option<InsnId> {
        let index = self.index_of(anchor)?;
        let id = self.allocate(&insn);
        self.entries.insert(index + 1, (id, insn));
        Some(id)
    }

    pub(crate) fn remove(&mut self, id: InsnId) -> Option<Insn> {
        let index = self.index_of(id)?;
        Some(self.entries.remove(index).1)
    }

    /// Replace the instruction behind `id`, keeping the handle.
    pub(crate) fn set(&mut self, id: InsnId, insn: Insn) -> Option<Insn> {
        let slot = self.get_mut(id)?;
        Some(std::mem::replace(slot, insn))
    }

    /// Allocate a fresh label; it takes effect once an `Insn::Label` is placed.
    pub(crate) fn new_label(&mut self) -> LabelId {
        let label = LabelId(self.next_label);
        self.next_label += 1;
        label
    }

    pub(crate) fn label_position(&self, label: LabelId) -> Option<usize> {
        self.entries
            .iter()
            .position(|(_, insn)| *insn == Insn::Label(label))
    }

    pub(crate) fn next_real(&self, id: InsnId) -> Option<InsnId> {
        let index = self.index_of(id)?;
        self.entries[index + 1..]
            .iter()
            .find(|(_, insn)| !insn.is_pseudo())
            .map(|(id, _)| *id)
    }

    /// Previous instruction, pseudo or not.
    pub(crate) fn previous(&self, id: InsnId) -> Option<InsnId> {
        let index = self.index_of(id)?;
        index
            .checked_sub(1)
            .map(|previous| self.entries[previous].0)
    }

    fn allocate(&mut self, insn: &Insn) -> InsnId {
        if let Insn::Label(LabelId(label)) = insn {
            self.next_label = self.next_label.max(label + 1);
        }
        let id = InsnId(self.next_id);
        self.next_id += 1;
        id
    }
}

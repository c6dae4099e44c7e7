//! Class-file and jar writers and stack checks for tests.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use zip::write::SimpleFileOptions;

use crate::dataflow::analyzer::analyze;
use crate::dataflow::interpreter::BasicInterpreter;
use crate::ir::{InsnId, Method};

/// Writes minimal class files: constant pool, fields, methods with `Code`
/// (exception table and `LineNumberTable`) and nothing else.
pub(crate) struct ClassFileBuilder {
    cp: Vec<CpEntry>,
    access: u16,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    fields: Vec<FieldSpec>,
    methods: Vec<MethodSpec>,
}

struct FieldSpec {
    access: u16,
    name_index: u16,
    descriptor_index: u16,
}

struct MethodSpec {
    access: u16,
    name_index: u16,
    descriptor_index: u16,
    code: Option<CodeSpec>,
}

struct CodeSpec {
    max_locals: u16,
    code: Vec<u8>,
    /// `(start, end, handler, catch type class index)`
    handlers: Vec<(u16, u16, u16, u16)>,
    /// `(start pc, line)`
    lines: Vec<(u16, u16)>,
}

enum CpEntry {
    Utf8(String),
    Integer(i32),
    Long(i64),
    /// Second slot of a long constant.
    Reserved,
    Class(u16),
    String(u16),
    NameAndType(u16, u16),
    FieldRef(u16, u16),
    MethodRef(u16, u16),
    InterfaceMethodRef(u16, u16),
}

impl ClassFileBuilder {
    pub(crate) fn new(class_name: &str, super_name: &str) -> Self {
        let mut builder = Self {
            cp: Vec::new(),
            access: 0x0021,
            this_class: 0,
            super_class: 0,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        };
        builder.this_class = builder.add_class(class_name);
        builder.super_class = builder.add_class(super_name);
        builder
    }

    pub(crate) fn set_access(&mut self, access: u16) {
        self.access = access;
    }

    fn push(&mut self, entry: CpEntry) -> u16 {
        self.cp.push(entry);
        self.cp.len() as u16
    }

    pub(crate) fn add_utf8(&mut self, value: &str) -> u16 {
        self.push(CpEntry::Utf8(value.to_string()))
    }

    pub(crate) fn add_class(&mut self, name: &str) -> u16 {
        let name_index = self.add_utf8(name);
        self.push(CpEntry::Class(name_index))
    }

    pub(crate) fn add_integer(&mut self, value: i32) -> u16 {
        self.push(CpEntry::Integer(value))
    }

    pub(crate) fn add_long(&mut self, value: i64) -> u16 {
        let index = self.push(CpEntry::Long(value));
        self.push(CpEntry::Reserved);
        index
    }

    pub(crate) fn add_string(&mut self, value: &str) -> u16 {
        let utf8 = self.add_utf8(value);
        self.push(CpEntry::String(utf8))
    }

    fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name_index = self.add_utf8(name);
        let descriptor_index = self.add_utf8(descriptor);
        self.push(CpEntry::NameAndType(name_index, descriptor_index))
    }

    pub(crate) fn add_field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.add_class(class);
        let name_and_type = self.add_name_and_type(name, descriptor);
        self.push(CpEntry::FieldRef(class_index, name_and_type))
    }

    pub(crate) fn add_method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.add_class(class);
        let name_and_type = self.add_name_and_type(name, descriptor);
        self.push(CpEntry::MethodRef(class_index, name_and_type))
    }

    pub(crate) fn add_interface_method_ref(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> u16 {
        let class_index = self.add_class(class);
        let name_and_type = self.add_name_and_type(name, descriptor);
        self.push(CpEntry::InterfaceMethodRef(class_index, name_and_type))
    }

    pub(crate) fn add_interface(&mut self, name: &str) {
        let index = self.add_class(name);
        self.interfaces.push(index);
    }

    pub(crate) fn add_field(&mut self, access: u16, name: &str, descriptor: &str) {
        let name_index = self.add_utf8(name);
        let descriptor_index = self.add_utf8(descriptor);
        self.fields.push(FieldSpec {
            access,
            name_index,
            descriptor_index,
        });
    }

    /// Adds a method with a body and returns its index for [`Self::add_handler`]
    /// and [`Self::add_line`].
    pub(crate) fn add_method(
        &mut self,
        access: u16,
        name: &str,
        descriptor: &str,
        max_locals: u16,
        code: Vec<u8>,
    ) -> usize {
        let name_index = self.add_utf8(name);
        let descriptor_index = self.add_utf8(descriptor);
        self.methods.push(MethodSpec {
            access,
            name_index,
            descriptor_index,
            code: Some(CodeSpec {
                max_locals,
                code,
                handlers: Vec::new(),
                lines: Vec::new(),
            }),
        });
        self.methods.len() - 1
    }

    /// Adds an abstract or native method.
    pub(crate) fn add_bodiless_method(&mut self, access: u16, name: &str, descriptor: &str) {
        let name_index = self.add_utf8(name);
        let descriptor_index = self.add_utf8(descriptor);
        self.methods.push(MethodSpec {
            access,
            name_index,
            descriptor_index,
            code: None,
        });
    }

    pub(crate) fn add_handler(
        &mut self,
        method: usize,
        start: u16,
        end: u16,
        handler: u16,
        catch_type: Option<&str>,
    ) {
        let catch_index = catch_type.map_or(0, |name| self.add_class(name));
        if let Some(code) = self.methods.get_mut(method).and_then(|m| m.code.as_mut()) {
            code.handlers.push((start, end, handler, catch_index));
        }
    }

    pub(crate) fn add_line(&mut self, method: usize, start_pc: u16, line: u16) {
        if let Some(code) = self.methods.get_mut(method).and_then(|m| m.code.as_mut()) {
            code.lines.push((start_pc, line));
        }
    }

    pub(crate) fn finish(mut self) -> Vec<u8> {
        let code_index = self.add_utf8("Code");
        let lines_index = self.add_utf8("LineNumberTable");

        let mut bytes = Vec::new();
        write_u32(&mut bytes, 0xCAFEBABE);
        write_u16(&mut bytes, 0);
        write_u16(&mut bytes, 52);
        write_u16(&mut bytes, (self.cp.len() + 1) as u16);
        for entry in &self.cp {
            entry.write(&mut bytes);
        }
        write_u16(&mut bytes, self.access);
        write_u16(&mut bytes, self.this_class);
        write_u16(&mut bytes, self.super_class);
        write_u16(&mut bytes, self.interfaces.len() as u16);
        for interface in &self.interfaces {
            write_u16(&mut bytes, *interface);
        }
        write_u16(&mut bytes, self.fields.len() as u16);
        for field in &self.fields {
            write_u16(&mut bytes, field.access);
            write_u16(&mut bytes, field.name_index);
            write_u16(&mut bytes, field.descriptor_index);
            write_u16(&mut bytes, 0);
        }
        write_u16(&mut bytes, self.methods.len() as u16);
        for method in &self.methods {
            write_u16(&mut bytes, method.access);
            write_u16(&mut bytes, method.name_index);
            write_u16(&mut bytes, method.descriptor_index);
            let Some(code) = &method.code else {
                write_u16(&mut bytes, 0);
                continue;
            };
            write_u16(&mut bytes, 1);
            write_u16(&mut bytes, code_index);
            let lines_len = if code.lines.is_empty() {
                0
            } else {
                8 + 4 * code.lines.len() as u32
            };
            let attr_len =
                12 + code.code.len() as u32 + 8 * code.handlers.len() as u32 + lines_len;
            write_u32(&mut bytes, attr_len);
            write_u16(&mut bytes, 16);
            write_u16(&mut bytes, code.max_locals);
            write_u32(&mut bytes, code.code.len() as u32);
            bytes.extend_from_slice(&code.code);
            write_u16(&mut bytes, code.handlers.len() as u16);
            for (start, end, handler, catch_type) in &code.handlers {
                write_u16(&mut bytes, *start);
                write_u16(&mut bytes, *end);
                write_u16(&mut bytes, *handler);
                write_u16(&mut bytes, *catch_type);
            }
            if code.lines.is_empty() {
                write_u16(&mut bytes, 0);
            } else {
                write_u16(&mut bytes, 1);
                write_u16(&mut bytes, lines_index);
                write_u32(&mut bytes, 2 + 4 * code.lines.len() as u32);
                write_u16(&mut bytes, code.lines.len() as u16);
                for (start_pc, line) in &code.lines {
                    write_u16(&mut bytes, *start_pc);
                    write_u16(&mut bytes, *line);
                }
            }
        }
        write_u16(&mut bytes, 0);
        bytes
    }
}

impl CpEntry {
    fn write(&self, bytes: &mut Vec<u8>) {
        match self {
            CpEntry::Utf8(value) => {
                bytes.push(1);
                write_u16(bytes, value.len() as u16);
                bytes.extend_from_slice(value.as_bytes());
            }
            CpEntry::Integer(value) => {
                bytes.push(3);
                bytes.extend_from_slice(&value.to_be_bytes());
            }
            CpEntry::Long(value) => {
                bytes.push(5);
                bytes.extend_from_slice(&value.to_be_bytes());
            }
            CpEntry::Reserved => {}
            CpEntry::Class(name_index) => {
                bytes.push(7);
                write_u16(bytes, *name_index);
            }
            CpEntry::String(utf8_index) => {
                bytes.push(8);
                write_u16(bytes, *utf8_index);
            }
            CpEntry::FieldRef(class_index, name_and_type) => {
                bytes.push(9);
                write_u16(bytes, *class_index);
                write_u16(bytes, *name_and_type);
            }
            CpEntry::MethodRef(class_index, name_and_type) => {
                bytes.push(10);
                write_u16(bytes, *class_index);
                write_u16(bytes, *name_and_type);
            }
            CpEntry::InterfaceMethodRef(class_index, name_and_type) => {
                bytes.push(11);
                write_u16(bytes, *class_index);
                write_u16(bytes, *name_and_type);
            }
            CpEntry::NameAndType(name_index, descriptor_index) => {
                bytes.push(12);
                write_u16(bytes, *name_index);
                write_u16(bytes, *descriptor_index);
            }
        }
    }
}

fn write_u16(bytes: &mut Vec<u8>, value: u16) {
    bytes.extend_from_slice(&value.to_be_bytes());
}

fn write_u32(bytes: &mut Vec<u8>, value: u32) {
    bytes.extend_from_slice(&value.to_be_bytes());
}

/// Writes a jar holding `entries` and, when `class_path` is set, a manifest
/// with that `Class-Path`.
pub(crate) fn write_jar(
    path: &Path,
    class_path: Option<&str>,
    entries: &[(&str, &[u8])],
) -> Result<()> {
    let file = fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut writer = zip::ZipWriter::new(file);
    let mut manifest = String::from("Manifest-Version: 1.0\n");
    if let Some(class_path) = class_path {
        manifest.push_str(&format!("Class-Path: {class_path}\n"));
    }
    manifest.push('\n');
    writer
        .start_file("META-INF/MANIFEST.MF", SimpleFileOptions::default())
        .context("start manifest entry")?;
    writer
        .write_all(manifest.as_bytes())
        .context("write manifest")?;
    for (name, data) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .with_context(|| format!("start {name}"))?;
        writer.write_all(data).with_context(|| format!("write {name}"))?;
    }
    writer.finish().context("finish jar")?;
    Ok(())
}

/// A class with no members, for tests that only need a name and a parent.
pub(crate) fn empty_class(name: &str, super_name: &str) -> Vec<u8> {
    ClassFileBuilder::new(name, super_name).finish()
}

/// Operand stack depth, in values, on entry to each reachable instruction.
pub(crate) fn stack_heights(method: &Method) -> Result<BTreeMap<InsnId, usize>> {
    let analysis = analyze("test", method, &BasicInterpreter)?;
    Ok(method
        .instructions
        .iter()
        .enumerate()
        .filter_map(|(index, (id, _))| {
            let frame = analysis.frame(index)?;
            let depth = (0..).take_while(|depth| frame.peek(*depth).is_some()).count();
            Some((id, depth))
        })
        .collect())
}

/// Every instruction that survived an edit, except `rewritten`, is entered
/// with the stack depth it had before the edit.
pub(crate) fn assert_heights_preserved(
    before: &BTreeMap<InsnId, usize>,
    method: &Method,
    rewritten: &[InsnId],
) {
    let after = stack_heights(method).expect("analyze edited method");
    for (id, height) in after.iter().filter(|(id, _)| !rewritten.contains(*id)) {
        assert_eq!(before.get(id), Some(height), "stack depth changed at {id:?}");
    }
}

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jclassfile::attributes::{Attribute, ExceptionRecord};
use jclassfile::class_file;
use jclassfile::constant_pool::ConstantPool;
use opentelemetry::KeyValue;
use tracing::debug;
use zip::ZipArchive;

use crate::ir::{
    AccessFlags, Class, Constant, Field, Insn, InsnList, LabelId, MemberRef, Method,
    TryCatchBlock,
};
use crate::library::Library;
use crate::opcodes::*;
use crate::telemetry::{Telemetry, with_span};

/// Libraries to transform and the read-only libraries they link against.
pub(crate) struct LoadedInputs {
    pub(crate) libraries: Vec<Library>,
    pub(crate) dependencies: Vec<Library>,
}

/// Load every input as its own library, then the dependencies plus whatever
/// the input jars' manifests reference through `Class-Path`.
pub(crate) fn load_inputs(
    inputs: &[PathBuf],
    dependencies: &[PathBuf],
    telemetry: Option<&Telemetry>,
) -> Result<LoadedInputs> {
    let mut libraries = Vec::with_capacity(inputs.len());
    for input in inputs {
        libraries.push(load_library(input, telemetry)?);
    }

    // Keep deterministic ordering by sorting dependency entries and directory listings.
    let mut entries = dependencies.to_vec();
    entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));
    for input in inputs.iter().filter(|input| is_jar_path(input)) {
        entries.extend(manifest_classpath(input)?);
    }

    let input_keys: BTreeSet<String> = inputs.iter().map(|input| path_key(input)).collect();
    let mut loaded = Vec::new();
    for entry in expand_classpath(entries)? {
        if input_keys.contains(&path_key(&entry)) {
            continue;
        }
        loaded.push(load_library(&entry, telemetry)?);
    }

    Ok(LoadedInputs {
        libraries,
        dependencies: loaded,
    })
}

/// Read a `.class` file, a directory tree of class files or a jar into one
/// library named after the path.
pub(crate) fn load_library(path: &Path, telemetry: Option<&Telemetry>) -> Result<Library> {
    if !path.exists() {
        anyhow::bail!("input not found: {}", path.display());
    }
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path_key(path));
    let mut library = Library::new(&name);
    scan_path(path, true, telemetry, &mut library)?;
    debug!(library = %library.name, classes = library.len(), "library loaded");
    Ok(library)
}

fn scan_path(
    path: &Path,
    strict: bool,
    telemetry: Option<&Telemetry>,
    library: &mut Library,
) -> Result<()> {
    if path.is_dir() {
        return scan_dir(path, telemetry, library);
    }

    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    match extension {
        "class" => scan_class_file(path, telemetry, library),
        "jar" => scan_jar_file(path, telemetry, library),
        _ => {
            if strict {
                anyhow::bail!("unsupported input file: {}", path.display())
            } else {
                Ok(())
            }
        }
    }
}

fn scan_dir(path: &Path, telemetry: Option<&Telemetry>, library: &mut Library) -> Result<()> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?
    {
        let entry =
            entry.with_context(|| format!("failed to read entry under {}", path.display()))?;
        entries.push(entry.path());
    }

    entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));

    for entry in entries {
        if entry.is_dir() {
            scan_dir(&entry, telemetry, library)?;
        } else if !entry.ends_with("module-info.class") {
            scan_path(&entry, false, telemetry, library)?;
        }
    }

    Ok(())
}

fn scan_class_file(path: &Path, telemetry: Option<&Telemetry>, library: &mut Library) -> Result<()> {
    let attributes = [KeyValue::new(
        "jdeob.class_path",
        path.display().to_string(),
    )];
    let class = with_span(telemetry, "class.scan", &attributes, || -> Result<Class> {
        let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        parse_class_bytes(&data).with_context(|| format!("failed to parse {}", path.display()))
    })?;
    add_class(library, class, &path.display().to_string())
}

fn scan_jar_file(path: &Path, telemetry: Option<&Telemetry>, library: &mut Library) -> Result<()> {
    let jar_attributes = [KeyValue::new("jdeob.jar_path", path.display().to_string())];
    let mut archive = with_span(
        telemetry,
        "jar.scan",
        &jar_attributes,
        || -> Result<ZipArchive<fs::File>> {
            let file = fs::File::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))
        },
    )?;

    let mut entry_names = Vec::new();
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if name.ends_with(".class")
            && !name.ends_with("module-info.class")
            && !name.starts_with("META-INF/versions/")
        {
            entry_names.push(name);
        }
    }

    entry_names.sort();

    for name in entry_names {
        let class_attributes = [
            KeyValue::new("jdeob.jar_path", path.display().to_string()),
            KeyValue::new("jdeob.jar_entry", name.clone()),
        ];
        let class = with_span(telemetry, "class.scan", &class_attributes, || -> Result<Class> {
            let mut entry = archive
                .by_name(&name)
                .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
            parse_class_bytes(&data)
                .with_context(|| format!("failed to parse {}:{}", path.display(), name))
        })?;
        add_class(library, class, &format!("{}:{}", path.display(), name))?;
    }

    Ok(())
}

fn add_class(library: &mut Library, class: Class, origin: &str) -> Result<()> {
    let name = class.name.clone();
    if library.add(class).is_some() {
        anyhow::bail!(
            "duplicate class {name} in library {} ({origin})",
            library.name
        );
    }
    Ok(())
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn expand_classpath(initial: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    let mut queue = VecDeque::from(initial);

    let mut seen = BTreeSet::new();
    let mut result = Vec::new();
    while let Some(entry) = queue.pop_front() {
        let key = path_key(&entry);
        if !seen.insert(key) {
            continue;
        }
        if !entry.exists() {
            anyhow::bail!("dependency not found: {}", entry.display());
        }
        result.push(entry.clone());
        if is_jar_path(&entry) {
            let mut referenced = manifest_classpath(&entry)?;
            referenced.sort_by(|a, b| path_key(a).cmp(&path_key(b)));
            queue.extend(referenced);
        }
    }

    Ok(result)
}

fn manifest_classpath(path: &Path) -> Result<Vec<PathBuf>> {
    let file =
        fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;
    let Ok(mut entry) = archive.by_name("META-INF/MANIFEST.MF") else {
        return Ok(Vec::new());
    };
    let mut content = String::new();
    entry
        .read_to_string(&mut content)
        .with_context(|| format!("failed to read manifest of {}", path.display()))?;
    Ok(parse_manifest_classpath(path, &content))
}

/// `Class-Path` entries of a manifest, resolved against the jar's directory.
/// Continuation lines start with a single space.
fn parse_manifest_classpath(jar_path: &Path, content: &str) -> Vec<PathBuf> {
    let mut class_path = None;
    let mut current_key: Option<String> = None;
    let mut current_value = String::new();

    for raw_line in content.lines() {
        let line = raw_line.trim_end_matches('\r');
        if let Some(continuation) = line.strip_prefix(' ') {
            if current_key.is_some() {
                current_value.push_str(continuation);
            }
            continue;
        }

        if current_key.take().is_some_and(|key| key == "Class-Path") {
            class_path = Some(current_value.clone());
        }
        current_value.clear();

        if let Some((key, value)) = line.split_once(':') {
            current_key = Some(key.trim().to_string());
            current_value.push_str(value.trim_start());
        }
    }
    if current_key.is_some_and(|key| key == "Class-Path") {
        class_path = Some(current_value);
    }

    let Some(class_path) = class_path else {
        return Vec::new();
    };

    let base_dir = jar_path.parent().unwrap_or_else(|| Path::new(""));
    class_path
        .split_whitespace()
        .map(|entry| {
            let entry_path = PathBuf::from(entry);
            if entry_path.is_absolute() {
                entry_path
            } else {
                base_dir.join(entry_path)
            }
        })
        .collect()
}

fn is_jar_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("jar"))
}

pub(crate) fn parse_class_bytes(data: &[u8]) -> Result<Class> {
    let class_file = class_file::parse(data).context("failed to parse class file bytes")?;
    let constant_pool = class_file.constant_pool();
    let name =
        resolve_class_name(constant_pool, class_file.this_class()).context("resolve class name")?;
    let super_name = if class_file.super_class() == 0 {
        None
    } else {
        Some(
            resolve_class_name(constant_pool, class_file.super_class())
                .context("resolve super class name")?,
        )
    };

    let mut class = Class::new(&name, super_name.as_deref());
    for interface in class_file.interfaces() {
        class
            .interfaces
            .push(resolve_class_name(constant_pool, *interface).context("resolve interface name")?);
    }
    class.access = class_access(data).context("read class access flags")?;
    class.fields = parse_fields(constant_pool, class_file.fields()).context("parse fields")?;
    class.methods = parse_methods(constant_pool, class_file.methods())
        .with_context(|| format!("parse methods of {name}"))?;
    Ok(class)
}

fn resolve_class_name(constant_pool: &[ConstantPool], class_index: u16) -> Result<String> {
    let entry = constant_pool
        .get(class_index as usize)
        .context("missing class entry")?;
    match entry {
        ConstantPool::Class { name_index } => resolve_utf8(constant_pool, *name_index),
        _ => anyhow::bail!("unexpected class entry"),
    }
}

fn resolve_utf8(constant_pool: &[ConstantPool], index: u16) -> Result<String> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing utf8 entry")?;
    match entry {
        ConstantPool::Utf8 { value } => Ok(value.clone()),
        _ => anyhow::bail!("unexpected utf8 entry"),
    }
}

/// Class access flags straight from the header, after skipping the constant pool.
fn class_access(data: &[u8]) -> Result<AccessFlags> {
    let mut offset = 0usize;
    let magic = read_u32_class(data, &mut offset)?;
    if magic != 0xCAFEBABE {
        anyhow::bail!("invalid class file magic");
    }
    let _minor = read_u16_class(data, &mut offset)?;
    let _major = read_u16_class(data, &mut offset)?;
    skip_constant_pool(data, &mut offset)?;
    Ok(AccessFlags::from_bits_truncate(read_u16_class(
        data,
        &mut offset,
    )?))
}

fn skip_constant_pool(data: &[u8], offset: &mut usize) -> Result<()> {
    let count = read_u16_class(data, offset)?;
    let mut index = 1u16;
    while index < count {
        let tag = read_u8_class(data, offset)?;
        let len = match tag {
            1 => read_u16_class(data, offset)? as usize,
            3 | 4 | 9 | 10 | 11 | 12 | 17 | 18 => 4,
            5 | 6 => {
                index += 1;
                8
            }
            7 | 8 | 16 | 19 | 20 => 2,
            15 => 3,
            _ => anyhow::bail!("unsupported constant pool tag: {}", tag),
        };
        skip_class_bytes(data, offset, len)?;
        index += 1;
    }
    Ok(())
}

fn read_u8_class(data: &[u8], offset: &mut usize) -> Result<u8> {
    let byte = *data.get(*offset).context("class file out of bounds")?;
    *offset += 1;
    Ok(byte)
}

fn read_u16_class(data: &[u8], offset: &mut usize) -> Result<u16> {
    let bytes = read_bytes_class(data, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32_class(data: &[u8], offset: &mut usize) -> Result<u32> {
    let bytes = read_bytes_class(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_bytes_class<'a>(data: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8]> {
    let start = *offset;
    let end = start + len;
    let slice = data.get(start..end).context("class file out of bounds")?;
    *offset = end;
    Ok(slice)
}

fn skip_class_bytes(data: &[u8], offset: &mut usize, len: usize) -> Result<()> {
    read_bytes_class(data, offset, len)?;
    Ok(())
}

fn parse_fields(
    constant_pool: &[ConstantPool],
    fields: &[jclassfile::fields::FieldInfo],
) -> Result<Vec<Field>> {
    let mut parsed = Vec::new();
    for field in fields {
        let name = resolve_utf8(constant_pool, field.name_index()).context("resolve field name")?;
        let descriptor = resolve_utf8(constant_pool, field.descriptor_index())
            .context("resolve field descriptor")?;
        parsed.push(Field {
            name,
            descriptor,
            access: AccessFlags::from_bits_truncate(field.access_flags().bits()),
        });
    }
    Ok(parsed)
}

fn parse_methods(
    constant_pool: &[ConstantPool],
    methods: &[jclassfile::methods::MethodInfo],
) -> Result<Vec<Method>> {
    let mut parsed = Vec::new();
    for method in methods {
        let name =
            resolve_utf8(constant_pool, method.name_index()).context("resolve method name")?;
        let descriptor = resolve_utf8(constant_pool, method.descriptor_index())
            .context("resolve method descriptor")?;
        let access = AccessFlags::from_bits_truncate(method.access_flags().bits());
        let code = method
            .attributes()
            .iter()
            .find_map(|attribute| match attribute {
                Attribute::Code {
                    max_locals,
                    code,
                    exception_table,
                    attributes,
                    ..
                } => Some((*max_locals, code, exception_table, attributes)),
                _ => None,
            });
        let (max_locals, instructions, try_catch_blocks) = match code {
            Some((max_locals, code, exception_table, attributes)) => {
                let (instructions, try_catch_blocks) =
                    decode_code(constant_pool, code, exception_table, attributes)
                        .with_context(|| format!("decode {name}{descriptor}"))?;
                (max_locals, instructions, try_catch_blocks)
            }
            None => (0, InsnList::new(), Vec::new()),
        };
        parsed.push(Method {
            name,
            descriptor,
            access,
            max_locals,
            instructions,
            try_catch_blocks,
        });
    }
    Ok(parsed)
}

/// Bytecode decoder. Branch, switch, exception and line-number offsets get
/// one label each, allocated on first reference.
struct Decoder<'a> {
    code: &'a [u8],
    constant_pool: &'a [ConstantPool],
    list: InsnList,
    labels: BTreeMap<usize, LabelId>,
}

fn decode_code(
    constant_pool: &[ConstantPool],
    code: &[u8],
    exception_table: &[ExceptionRecord],
    attributes: &[Attribute],
) -> Result<(InsnList, Vec<TryCatchBlock>)> {
    let mut decoder = Decoder {
        code,
        constant_pool,
        list: InsnList::new(),
        labels: BTreeMap::new(),
    };

    let mut decoded = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        let length = opcode_length(code, offset)?;
        if length == 0 || offset + length > code.len() {
            anyhow::bail!("invalid bytecode length at offset {}", offset);
        }
        let insn = decoder
            .decode(offset)
            .with_context(|| format!("decode instruction at offset {offset}"))?;
        decoded.push((offset, insn));
        offset += length;
    }

    let mut try_catch_blocks = Vec::with_capacity(exception_table.len());
    for record in exception_table {
        let catch_type = if record.catch_type() == 0 {
            None
        } else {
            Some(
                resolve_class_name(constant_pool, record.catch_type())
                    .context("resolve catch type")?,
            )
        };
        try_catch_blocks.push(TryCatchBlock {
            start: decoder.label(record.start_pc() as usize)?,
            end: decoder.label(record.end_pc() as usize)?,
            handler: decoder.label(record.handler_pc() as usize)?,
            catch_type,
        });
    }

    let mut lines: BTreeMap<usize, Vec<u16>> = BTreeMap::new();
    for attribute in attributes {
        let Attribute::LineNumberTable { line_number_table } = attribute else {
            continue;
        };
        for record in line_number_table {
            let start_pc = record.start_pc() as usize;
            decoder.label(start_pc)?;
            lines
                .entry(start_pc)
                .or_default()
                .push(record.line_number() as u16);
        }
    }

    let boundaries: BTreeSet<usize> = decoded
        .iter()
        .map(|(offset, _)| *offset)
        .chain(std::iter::once(code.len()))
        .collect();
    if let Some(offset) = decoder
        .labels
        .keys()
        .find(|offset| !boundaries.contains(offset))
    {
        anyhow::bail!("offset {offset} is not an instruction boundary");
    }

    let Decoder {
        mut list, labels, ..
    } = decoder;
    for (offset, insn) in decoded {
        if let Some(label) = labels.get(&offset) {
            list.push(Insn::Label(*label));
            for line in lines.get(&offset).into_iter().flatten() {
                list.push(Insn::LineNumber {
                    line: *line,
                    start: *label,
                });
            }
        }
        list.push(insn);
    }
    if let Some(label) = labels.get(&code.len()) {
        list.push(Insn::Label(*label));
    }
    Ok((list, try_catch_blocks))
}

impl Decoder<'_> {
    fn label(&mut self, offset: usize) -> Result<LabelId> {
        if offset > self.code.len() {
            anyhow::bail!(
                "offset {offset} outside code of length {}",
                self.code.len()
            );
        }
        let list = &mut self.list;
        Ok(*self.labels.entry(offset).or_insert_with(|| list.new_label()))
    }

    fn branch(&mut self, offset: usize, delta: i32) -> Result<LabelId> {
        let target = i64::try_from(offset)? + i64::from(delta);
        let target = usize::try_from(target)
            .with_context(|| format!("branch target {target} before start of code"))?;
        self.label(target)
    }

    /// Decode one instruction into its canonical form: short and wide
    /// variable forms become `Var`/`Iinc`, `ldc_w`/`ldc2_w` become `Ldc` and
    /// `goto_w`/`jsr_w` become their short forms.
    fn decode(&mut self, offset: usize) -> Result<Insn> {
        let code = self.code;
        let opcode = read_u8(code, offset)?;
        let insn = match opcode {
            BIPUSH => Insn::Int {
                opcode,
                operand: i32::from(read_u8(code, offset + 1)? as i8),
            },
            SIPUSH => Insn::Int {
                opcode,
                operand: i32::from(read_i16(code, offset + 1)?),
            },
            NEWARRAY => Insn::Int {
                opcode,
                operand: i32::from(read_u8(code, offset + 1)?),
            },
            LDC => Insn::Ldc(resolve_constant(
                self.constant_pool,
                u16::from(read_u8(code, offset + 1)?),
            )?),
            LDC_W | LDC2_W => Insn::Ldc(resolve_constant(
                self.constant_pool,
                read_u16(code, offset + 1)?,
            )?),
            ILOAD..=ALOAD | ISTORE..=ASTORE | RET => Insn::Var {
                opcode,
                var: u16::from(read_u8(code, offset + 1)?),
            },
            ILOAD_0..=ALOAD_3 => {
                let n = opcode - ILOAD_0;
                Insn::Var {
                    opcode: ILOAD + n / 4,
                    var: u16::from(n % 4),
                }
            }
            ISTORE_0..=ASTORE_3 => {
                let n = opcode - ISTORE_0;
                Insn::Var {
                    opcode: ISTORE + n / 4,
                    var: u16::from(n % 4),
                }
            }
            IINC => Insn::Iinc {
                var: u16::from(read_u8(code, offset + 1)?),
                increment: i16::from(read_u8(code, offset + 2)? as i8),
            },
            IFEQ..=JSR | IFNULL | IFNONNULL => Insn::Jump {
                opcode,
                target: self.branch(offset, i32::from(read_i16(code, offset + 1)?))?,
            },
            GOTO_W | JSR_W => Insn::Jump {
                opcode: if opcode == GOTO_W { GOTO } else { JSR },
                target: self.branch(offset, read_i32(code, offset + 1)?)?,
            },
            TABLESWITCH => {
                let base = offset + 1 + padding(offset);
                let default = self.branch(offset, read_i32(code, base)?)?;
                let low = read_i32(code, base + 4)?;
                let high = read_i32(code, base + 8)?;
                let count = usize::try_from(i64::from(high) - i64::from(low) + 1)
                    .context("invalid tableswitch range")?;
                let mut targets = Vec::with_capacity(count);
                for index in 0..count {
                    let delta = read_i32(code, base + 12 + index * 4)?;
                    targets.push(self.branch(offset, delta)?);
                }
                Insn::TableSwitch {
                    low,
                    high,
                    default,
                    targets,
                }
            }
            LOOKUPSWITCH => {
                let base = offset + 1 + padding(offset);
                let default = self.branch(offset, read_i32(code, base)?)?;
                let npairs =
                    usize::try_from(read_i32(code, base + 4)?).context("invalid lookupswitch pairs")?;
                let mut pairs = Vec::with_capacity(npairs);
                for index in 0..npairs {
                    let key = read_i32(code, base + 8 + index * 8)?;
                    let delta = read_i32(code, base + 12 + index * 8)?;
                    pairs.push((key, self.branch(offset, delta)?));
                }
                Insn::LookupSwitch { default, pairs }
            }
            GETSTATIC..=PUTFIELD => Insn::Field {
                opcode,
                member: resolve_member_ref(self.constant_pool, read_u16(code, offset + 1)?)?.0,
            },
            INVOKEVIRTUAL..=INVOKEINTERFACE => {
                let (member, interface) =
                    resolve_member_ref(self.constant_pool, read_u16(code, offset + 1)?)?;
                Insn::Method {
                    opcode,
                    member,
                    interface,
                }
            }
            INVOKEDYNAMIC => {
                let (name, descriptor) =
                    resolve_invoke_dynamic(self.constant_pool, read_u16(code, offset + 1)?)?;
                Insn::InvokeDynamic { name, descriptor }
            }
            NEW | ANEWARRAY | CHECKCAST | INSTANCEOF => Insn::Type {
                opcode,
                class: resolve_class_name(self.constant_pool, read_u16(code, offset + 1)?)?,
            },
            MULTIANEWARRAY => Insn::MultiANewArray {
                descriptor: resolve_class_name(self.constant_pool, read_u16(code, offset + 1)?)?,
                dimensions: read_u8(code, offset + 3)?,
            },
            WIDE => {
                let inner = read_u8(code, offset + 1)?;
                let var = read_u16(code, offset + 2)?;
                match inner {
                    IINC => Insn::Iinc {
                        var,
                        increment: read_i16(code, offset + 4)?,
                    },
                    ILOAD..=ALOAD | ISTORE..=ASTORE | RET => Insn::Var { opcode: inner, var },
                    _ => anyhow::bail!("invalid wide opcode 0x{:02x}", inner),
                }
            }
            _ => Insn::Simple(opcode),
        };
        Ok(insn)
    }
}

fn resolve_constant(constant_pool: &[ConstantPool], index: u16) -> Result<Constant> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing constant pool entry")?;
    let constant = match entry {
        ConstantPool::Integer { value } => Constant::Int(*value),
        ConstantPool::Float { value } => Constant::Float(*value),
        ConstantPool::Long { value } => Constant::Long(*value),
        ConstantPool::Double { value } => Constant::Double(*value),
        ConstantPool::String { string_index } => {
            Constant::String(resolve_utf8(constant_pool, *string_index)?)
        }
        ConstantPool::Class { name_index } => {
            Constant::Class(resolve_utf8(constant_pool, *name_index)?)
        }
        _ => Constant::Other,
    };
    Ok(constant)
}

/// Field or method reference, with whether it names an interface method.
fn resolve_member_ref(constant_pool: &[ConstantPool], index: u16) -> Result<(MemberRef, bool)> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing member ref entry")?;
    let (class_index, name_and_type_index, interface) = match entry {
        ConstantPool::Fieldref {
            class_index,
            name_and_type_index,
        }
        | ConstantPool::Methodref {
            class_index,
            name_and_type_index,
        } => (*class_index, *name_and_type_index, false),
        ConstantPool::InterfaceMethodref {
            class_index,
            name_and_type_index,
        } => (*class_index, *name_and_type_index, true),
        _ => anyhow::bail!("unexpected member ref entry"),
    };
    let owner = resolve_class_name(constant_pool, class_index).context("resolve owner")?;
    let (name, descriptor) = resolve_name_and_type(constant_pool, name_and_type_index)?;
    Ok((MemberRef::new(&owner, &name, &descriptor), interface))
}

fn resolve_invoke_dynamic(constant_pool: &[ConstantPool], index: u16) -> Result<(String, String)> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing invokedynamic entry")?;
    match entry {
        ConstantPool::InvokeDynamic {
            name_and_type_index,
            ..
        } => resolve_name_and_type(constant_pool, *name_and_type_index),
        _ => anyhow::bail!("unexpected invokedynamic entry"),
    }
}

fn resolve_name_and_type(constant_pool: &[ConstantPool], index: u16) -> Result<(String, String)> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing name and type entry")?;
    match entry {
        ConstantPool::NameAndType {
            name_index,
            descriptor_index,
        } => Ok((
            resolve_utf8(constant_pool, *name_index).context("resolve member name")?,
            resolve_utf8(constant_pool, *descriptor_index).context("resolve member descriptor")?,
        )),
        _ => anyhow::bail!("unexpected name and type entry"),
    }
}

fn opcode_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = read_u8(code, offset)?;
    let length = match opcode {
        0x00..=0x0f => 1,
        BIPUSH => 2,
        SIPUSH => 3,
        LDC => 2,
        LDC_W | LDC2_W => 3,
        0x15..=0x19 => 2,
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,
        0x3b..=0x83 => 1,
        IINC => 3,
        0x85..=0x98 => 1,
        0x99..=0xa8 => 3,
        RET => 2,
        TABLESWITCH => tableswitch_length(code, offset)?,
        LOOKUPSWITCH => lookupswitch_length(code, offset)?,
        0xac..=0xb1 => 1,
        0xb2..=0xb8 => 3,
        INVOKEINTERFACE | INVOKEDYNAMIC => 5,
        NEW => 3,
        NEWARRAY => 2,
        ANEWARRAY => 3,
        0xbe | 0xbf => 1,
        CHECKCAST | INSTANCEOF => 3,
        0xc2 | 0xc3 => 1,
        WIDE => wide_length(code, offset)?,
        MULTIANEWARRAY => 4,
        IFNULL | IFNONNULL => 3,
        GOTO_W | JSR_W => 5,
        _ => anyhow::bail!("unsupported opcode 0x{:02x}", opcode),
    };
    Ok(length)
}

fn tableswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    let count = high
        .checked_sub(low)
        .and_then(|v| v.checked_add(1))
        .context("invalid tableswitch range")?;
    if count < 0 {
        anyhow::bail!("invalid tableswitch range");
    }
    Ok(1 + padding + 12 + (count as usize) * 4)
}

fn lookupswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let npairs = read_i32(code, base + 4)?;
    if npairs < 0 {
        anyhow::bail!("invalid lookupswitch pairs");
    }
    Ok(1 + padding + 8 + (npairs as usize) * 8)
}

fn wide_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = read_u8(code, offset + 1).context("missing wide opcode")?;
    if opcode == IINC { Ok(6) } else { Ok(4) }
}

fn padding(offset: usize) -> usize {
    (4 - ((offset + 1) % 4)) % 4
}

fn read_u8(code: &[u8], offset: usize) -> Result<u8> {
    code.get(offset).copied().context("bytecode u8 out of bounds")
}

fn read_u16(code: &[u8], offset: usize) -> Result<u16> {
    let slice = code
        .get(offset..offset + 2)
        .context("bytecode u16 out of bounds")?;
    Ok(u16::from_be_bytes([slice[0], slice[1]]))
}

fn read_i16(code: &[u8], offset: usize) -> Result<i16> {
    Ok(read_u16(code, offset)? as i16)
}

fn read_i32(code: &[u8], offset: usize) -> Result<i32> {
    let slice = code
        .get(offset..offset + 4)
        .context("bytecode i32 out of bounds")?;
    Ok(i32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

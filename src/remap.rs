//! Deterministic, type-derived names for obfuscated classes and members.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Serialize, Serializer};
use tracing::warn;

use crate::classpath::{ClassMetadata, ClassPath};
use crate::config::Profile;
use crate::descriptor::FieldType;
use crate::disjoint_set::DisjointSet;
use crate::ir::MemberRef;
use crate::unifier::MemberPartitions;

const OBJECT: &str = "java/lang/Object";

/// Old-to-new names. Lookups of unmapped names return the name unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub(crate) struct NameTable {
    pub(crate) classes: BTreeMap<String, String>,
    #[serde(serialize_with = "serialize_members")]
    pub(crate) fields: BTreeMap<MemberRef, String>,
    #[serde(serialize_with = "serialize_members")]
    pub(crate) methods: BTreeMap<MemberRef, String>,
}

fn serialize_members<S>(members: &BTreeMap<MemberRef, String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_map(
        members
            .iter()
            .map(|(member, mapped)| (member.to_string(), mapped)),
    )
}

#[cfg(test)]
impl NameTable {
    pub(crate) fn map_class<'a>(&'a self, name: &'a str) -> &'a str {
        self.classes.get(name).map_or(name, String::as_str)
    }

    pub(crate) fn map_field<'a>(&'a self, owner: &str, name: &'a str, descriptor: &str) -> &'a str {
        self.fields
            .get(&MemberRef::new(owner, name, descriptor))
            .map_or(name, String::as_str)
    }

    pub(crate) fn map_method<'a>(&'a self, owner: &str, name: &'a str, descriptor: &str) -> &'a str {
        self.methods
            .get(&MemberRef::new(owner, name, descriptor))
            .map_or(name, String::as_str)
    }
}

/// Whether a method partition may be renamed or have its signature changed:
/// no member is excluded by name, lives in a dependency, or is native.
pub(crate) fn is_method_partition_renamable(
    classpath: &ClassPath,
    members: &[MemberRef],
    excluded_methods: &BTreeSet<String>,
) -> Result<bool> {
    for member in members {
        if excluded_methods.contains(&member.name) {
            return Ok(false);
        }
        let owner = classpath.get(&member.owner)?;
        if owner.is_dependency() || owner.is_native(classpath, &member.desc())? {
            return Ok(false);
        }
    }
    Ok(true)
}

pub(crate) struct TypedRemapper<'a> {
    classpath: &'a ClassPath,
    profile: &'a Profile,
    prefixes: BTreeMap<String, usize>,
    table: NameTable,
}

impl<'a> TypedRemapper<'a> {
    pub(crate) fn build(
        classpath: &'a ClassPath,
        fields: &DisjointSet<MemberRef>,
        methods: &DisjointSet<MemberRef>,
        profile: &'a Profile,
    ) -> Result<NameTable> {
        let mut remapper = TypedRemapper {
            classpath,
            profile,
            prefixes: BTreeMap::new(),
            table: NameTable::default(),
        };
        for class in classpath.library_classes()? {
            remapper
                .map_class(&class)
                .with_context(|| format!("name class {}", class.name()))?;
        }

        remapper.prefixes.clear();
        remapper.map_fields(&MemberPartitions::from_set(fields))?;
        remapper.map_methods(&MemberPartitions::from_set(methods))?;
        Ok(remapper.table)
    }

    fn generate_name(&mut self, prefix: &str) -> String {
        let counter = self.prefixes.entry(prefix.to_string()).or_insert(0);
        *counter += 1;
        if prefix.ends_with(|c: char| c.is_ascii_digit()) {
            format!("{prefix}_{counter}")
        } else {
            format!("{prefix}{counter}")
        }
    }

    /// Name `class`, superclasses first, and return its new name.
    fn map_class(&mut self, class: &ClassMetadata) -> Result<String> {
        let name = class.name();
        if let Some(mapped) = self.table.classes.get(name) {
            return Ok(mapped.clone());
        }
        if class.is_dependency() {
            return Ok(name.to_string());
        }
        if let Some(mapped) = self.profile.name_map.get(name) {
            self.table.classes.insert(name.to_string(), mapped.clone());
            return Ok(mapped.clone());
        }
        if self.profile.excluded_classes.contains(name) || self.declares_native_method(class)? {
            return Ok(name.to_string());
        }

        let package = &name[..name.rfind('/').map_or(0, |slash| slash + 1)];
        let simple = match class.super_class(self.classpath)? {
            Some(super_class) if super_class.name() != OBJECT => {
                let super_name = self.map_class(&super_class)?;
                let super_simple = simple_name(&super_name).to_string();
                self.generate_name(&format!("{super_simple}_Sub"))
            }
            _ if class.is_interface(self.classpath)? => self.generate_name("Interface"),
            _ => self.generate_name("Class"),
        };
        let mapped = format!("{package}{simple}");
        self.table.classes.insert(name.to_string(), mapped.clone());
        Ok(mapped)
    }

    fn declares_native_method(&self, class: &ClassMetadata) -> Result<bool> {
        for method in class.methods(self.classpath)? {
            if class.is_native(self.classpath, &method)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn map_fields(&mut self, partitions: &MemberPartitions) -> Result<()> {
        for id in 0..partitions.len() {
            let members = partitions.members(id);
            let Some(first) = members.first() else {
                continue;
            };
            if self.in_dependency(members)? {
                continue;
            }
            let mapped = match self.override_for(members) {
                Some(mapped) => mapped,
                None if members
                    .iter()
                    .any(|member| self.profile.excluded_fields.contains(&member.name)) =>
                {
                    continue;
                }
                None => {
                    let prefix = self.field_prefix(&first.descriptor)?;
                    self.generate_name(&prefix)
                }
            };
            for member in members {
                self.table.fields.insert(member.clone(), mapped.clone());
            }
        }
        Ok(())
    }

    /// `int[][]` gives `anIntArrayArray`, a field of class `Class3` gives `aClass3`.
    fn field_prefix(&self, descriptor: &str) -> Result<String> {
        let field_type = FieldType::parse(descriptor)?;
        let arrays = "Array".repeat(field_type.dimensions());
        let element = match field_type.element_type() {
            FieldType::Object(class) => simple_name(self.table.classes.get(class).unwrap_or(class)).to_string(),
            primitive => primitive
                .keyword()
                .with_context(|| format!("field type {descriptor} has no name"))?
                .to_string(),
        };
        let prefix = format!("{element}{arrays}");
        Ok(format!("{}{}", indefinite_article(&prefix), capitalize(&prefix)))
    }

    fn map_methods(&mut self, partitions: &MemberPartitions) -> Result<()> {
        let mut next_id = 0;
        for id in 0..partitions.len() {
            let members = partitions.members(id);
            if self.in_dependency(members)? {
                continue;
            }
            let mapped = match self.override_for(members) {
                Some(mapped) => mapped,
                None => {
                    if !is_method_partition_renamable(
                        self.classpath,
                        members,
                        &self.profile.excluded_methods,
                    )? {
                        continue;
                    }
                    next_id += 1;
                    format!("method{next_id}")
                }
            };
            for member in members {
                self.table.methods.insert(member.clone(), mapped.clone());
            }
        }
        Ok(())
    }

    fn in_dependency(&self, members: &[MemberRef]) -> Result<bool> {
        for member in members {
            if self.classpath.get(&member.owner)?.is_dependency() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn override_for(&self, members: &[MemberRef]) -> Option<String> {
        members
            .iter()
            .find_map(|member| self.profile.name_map.get(&member.to_string()))
            .cloned()
    }
}

fn simple_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn indefinite_article(word: &str) -> &'static str {
    match word.chars().next().map(|c| c.to_ascii_lowercase()) {
        Some('a' | 'e' | 'i' | 'o' | 'u') => "an",
        _ => "a",
    }
}

/// A mapping that renames something which does not look obfuscated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub(crate) struct SuspiciousMapping {
    pub(crate) original: String,
    pub(crate) mapped: String,
}

fn library_prefix() -> &'static Regex {
    static PREFIX: OnceLock<Regex> = OnceLock::new();
    PREFIX.get_or_init(|| Regex::new("^(?:loader|unpacker)_").expect("valid regex"))
}

/// Flag renames of names whose last path segment is longer than
/// `max_obfuscated_len`, ignoring the `loader_` and `unpacker_` prefixes.
/// Never fails.
pub(crate) fn verify(table: &NameTable, max_obfuscated_len: usize) -> Vec<SuspiciousMapping> {
    let names = table
        .classes
        .iter()
        .map(|(name, mapped)| (name.as_str(), mapped))
        .chain(table.fields.iter().map(|(member, mapped)| (member.name.as_str(), mapped)))
        .chain(table.methods.iter().map(|(member, mapped)| (member.name.as_str(), mapped)));

    let mut suspicious = Vec::new();
    for (name, mapped) in names {
        let original = library_prefix().replace(name, "");
        if simple_name(&original).chars().count() > max_obfuscated_len
            && original != mapped.as_str()
        {
            warn!("Remapping probably unobfuscated name {original} to {mapped}");
            suspicious.push(SuspiciousMapping {
                original: original.into_owned(),
                mapped: mapped.clone(),
            });
        }
    }
    suspicious
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AccessFlags, Class, Field, InsnList, Method};
    use crate::library::Library;
    use crate::runtime::RuntimeProvider;
    use crate::unifier::{unify_fields, unify_methods};

    fn method(name: &str, access: AccessFlags) -> Method {
        Method {
            name: name.to_string(),
            descriptor: "()V".to_string(),
            access,
            max_locals: 1,
            instructions: InsnList::new(),
            try_catch_blocks: Vec::new(),
        }
    }

    fn field(name: &str, descriptor: &str) -> Field {
        Field {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access: AccessFlags::empty(),
        }
    }

    fn fixture() -> ClassPath {
        let mut a = Class::new("pkg/a", Some("java/lang/Object"));
        a.methods.push(method("m", AccessFlags::PUBLIC));
        a.methods.push(method("<init>", AccessFlags::PUBLIC));
        a.fields.push(field("f", "[[I"));
        a.fields.push(field("cache", "I"));
        let mut b = Class::new("pkg/b", Some("pkg/a"));
        b.methods.push(method("m", AccessFlags::PUBLIC));
        b.fields.push(field("g", "Lpkg/a;"));
        b.fields.push(field("h", "Z"));
        let mut c = Class::new("c", Some("java/lang/Object"));
        c.access |= AccessFlags::INTERFACE | AccessFlags::ABSTRACT;
        let mut d = Class::new("d", Some("java/lang/Object"));
        d.interfaces.push("java/lang/Runnable".to_string());
        d.methods.push(method("run", AccessFlags::PUBLIC));
        d.methods.push(method("n", AccessFlags::PUBLIC | AccessFlags::NATIVE));
        let client = Class::new("client", Some("pkg/a"));
        let library: Library = vec![a, b, c, d, client].into_iter().collect();
        ClassPath::new(RuntimeProvider::builtin(), Vec::new(), vec![library]).expect("classpath")
    }

    fn build(classpath: &ClassPath, profile: &Profile) -> NameTable {
        let fields = unify_fields(classpath, &profile.excluded_fields).expect("fields");
        let methods = unify_methods(classpath, &profile.excluded_methods).expect("methods");
        TypedRemapper::build(classpath, &fields, &methods, profile).expect("remap")
    }

    #[test]
    fn classes_are_named_after_their_supertypes() {
        let classpath = fixture();
        let table = build(&classpath, &Profile::default());
        assert_eq!(table.map_class("pkg/a"), "pkg/Class1");
        assert_eq!(table.map_class("pkg/b"), "pkg/Class1_Sub1");
        assert_eq!(table.map_class("c"), "Interface1");
        assert_eq!(table.map_class("client"), "client");
        assert_eq!(table.map_class("d"), "d", "classes with native methods keep their name");
        assert_eq!(table.map_class("java/lang/Object"), "java/lang/Object");
    }

    #[test]
    fn fields_are_named_after_their_types() {
        let classpath = fixture();
        let table = build(&classpath, &Profile::default());
        assert_eq!(table.map_field("pkg/a", "f", "[[I"), "anIntArrayArray1");
        assert_eq!(table.map_field("pkg/b", "f", "[[I"), "anIntArrayArray1");
        assert_eq!(table.map_field("pkg/b", "g", "Lpkg/a;"), "aClass1_1");
        assert_eq!(table.map_field("pkg/b", "h", "Z"), "aBoolean1");
        assert_eq!(table.map_field("pkg/a", "cache", "I"), "cache");
    }

    #[test]
    fn overriding_methods_share_one_name() {
        let classpath = fixture();
        let table = build(&classpath, &Profile::default());
        let base = table.map_method("pkg/a", "m", "()V");
        assert!(base.starts_with("method"));
        assert_eq!(table.map_method("pkg/b", "m", "()V"), base);
        assert_eq!(table.map_method("client", "m", "()V"), base);
        assert_eq!(table.map_method("pkg/a", "<init>", "()V"), "<init>");
        assert_eq!(table.map_method("d", "run", "()V"), "run");
        assert_eq!(table.map_method("d", "n", "()V"), "n");
    }

    #[test]
    fn renaming_is_deterministic() {
        let classpath = fixture();
        let profile = Profile::default();
        assert_eq!(build(&classpath, &profile), build(&classpath, &profile));
    }

    #[test]
    fn name_map_overrides_generated_names() {
        let classpath = fixture();
        let mut profile = Profile::default();
        profile.name_map.insert("pkg/a".to_string(), "pkg/Node".to_string());
        profile
            .name_map
            .insert("pkg/b.m ()V".to_string(), "visit".to_string());
        let table = build(&classpath, &profile);
        assert_eq!(table.map_class("pkg/a"), "pkg/Node");
        assert_eq!(table.map_method("pkg/a", "m", "()V"), "visit");
        assert_eq!(table.map_method("pkg/b", "m", "()V"), "visit");
    }

    #[test]
    fn class_overrides_shape_subclass_names() {
        let classpath = fixture();
        let mut profile = Profile::default();
        profile.name_map.insert("pkg/a".to_string(), "pkg/Node".to_string());
        profile.name_map.insert("d".to_string(), "Worker".to_string());
        profile.name_map.insert("client".to_string(), "Client".to_string());
        let table = build(&classpath, &profile);
        assert_eq!(table.map_class("pkg/b"), "pkg/Node_Sub1");
        assert_eq!(table.map_class("d"), "Worker", "native methods do not block an override");
        assert_eq!(table.map_class("client"), "Client", "exclusion does not block an override");
        assert_eq!(table.map_field("pkg/b", "g", "Lpkg/a;"), "aNode1");
    }

    #[test]
    fn verification_flags_long_names_only() {
        let mut table = NameTable::default();
        table.classes.insert("ab".to_string(), "Class1".to_string());
        table.classes.insert("Renderer".to_string(), "Class2".to_string());
        table.classes.insert("loader_a".to_string(), "Class3".to_string());
        table.classes.insert("pkg/a".to_string(), "pkg/Class4".to_string());
        table.classes.insert("pkg/Scene".to_string(), "pkg/Class5".to_string());
        table
            .methods
            .insert(MemberRef::new("x", "unpacker_run", "()V"), "method1".to_string());
        let suspicious = verify(&table, 2);
        assert_eq!(
            suspicious,
            vec![
                SuspiciousMapping {
                    original: "Renderer".to_string(),
                    mapped: "Class2".to_string(),
                },
                SuspiciousMapping {
                    original: "pkg/Scene".to_string(),
                    mapped: "pkg/Class5".to_string(),
                },
                SuspiciousMapping {
                    original: "run".to_string(),
                    mapped: "method1".to_string(),
                },
            ]
        );
    }

    #[test]
    fn member_keys_serialize_as_strings() {
        let mut table = NameTable::default();
        table
            .fields
            .insert(MemberRef::new("a", "b", "I"), "anInt1".to_string());
        let json = serde_json::to_value(&table).expect("json");
        assert_eq!(json["fields"]["a.b I"], "anInt1");
    }
}

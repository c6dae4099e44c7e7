use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use tracing::debug;

use crate::error::DeobError;
use crate::ir::{AccessFlags, Class, MemberDesc};
use crate::library::Library;
use crate::runtime::RuntimeProvider;

/// Immutable snapshot of a class that is never transformed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ExternalClass {
    pub(crate) name: String,
    pub(crate) super_name: Option<String>,
    pub(crate) interfaces: Vec<String>,
    pub(crate) access: AccessFlags,
    pub(crate) fields: Vec<(MemberDesc, AccessFlags)>,
    pub(crate) methods: Vec<(MemberDesc, AccessFlags)>,
}

impl ExternalClass {
    pub(crate) fn from_class(class: &Class) -> Self {
        Self {
            name: class.name.clone(),
            super_name: class.super_name.clone(),
            interfaces: class.interfaces.clone(),
            access: class.access,
            fields: class
                .fields
                .iter()
                .map(|field| (field.desc(), field.access))
                .collect(),
            methods: class
                .methods
                .iter()
                .map(|method| (method.desc(), method.access))
                .collect(),
        }
    }
}

/// Resolved view of one class name.
///
/// Resident metadata reads through to the class in its library, so it always
/// reflects the latest edits. Equality, ordering and hashing use the name only.
#[derive(Clone, Debug)]
pub(crate) enum ClassMetadata {
    Resident { library: usize, name: String },
    External(Arc<ExternalClass>),
}

/// `(name, descriptor, access)` of each declared member.
type Members<'a> = Box<dyn Iterator<Item = (&'a str, &'a str, AccessFlags)> + 'a>;

/// Borrowed shape shared by both metadata variants.
struct Shape<'a> {
    super_name: Option<&'a str>,
    interfaces: &'a [String],
    access: AccessFlags,
    fields: Members<'a>,
    methods: Members<'a>,
}

fn external_members(members: &[(MemberDesc, AccessFlags)]) -> Members<'_> {
    Box::new(
        members
            .iter()
            .map(|(desc, access)| (desc.name.as_str(), desc.descriptor.as_str(), *access)),
    )
}

impl ClassMetadata {
    pub(crate) fn name(&self) -> &str {
        match self {
            ClassMetadata::Resident { name, .. } => name,
            ClassMetadata::External(class) => &class.name,
        }
    }

    /// Dependencies and runtime classes are read-only and never renamed.
    pub(crate) fn is_dependency(&self) -> bool {
        matches!(self, ClassMetadata::External(_))
    }

    fn shape<'a>(&'a self, classpath: &'a ClassPath) -> Result<Shape<'a>> {
        let shape = match self {
            ClassMetadata::Resident { library, name } => {
                let class = classpath
                    .libraries
                    .get(*library)
                    .and_then(|library| library.get(name))
                    .ok_or_else(|| DeobError::UnresolvedClass(name.clone()))?;
                Shape {
                    super_name: class.super_name.as_deref(),
                    interfaces: &class.interfaces,
                    access: class.access,
                    fields: Box::new(class.fields.iter().map(|field| {
                        (field.name.as_str(), field.descriptor.as_str(), field.access)
                    })),
                    methods: Box::new(class.methods.iter().map(|method| {
                        (method.name.as_str(), method.descriptor.as_str(), method.access)
                    })),
                }
            }
            ClassMetadata::External(class) => Shape {
                super_name: class.super_name.as_deref(),
                interfaces: &class.interfaces,
                access: class.access,
                fields: external_members(&class.fields),
                methods: external_members(&class.methods),
            },
        };
        Ok(shape)
    }

    pub(crate) fn is_interface(&self, classpath: &ClassPath) -> Result<bool> {
        Ok(self
            .shape(classpath)?
            .access
            .contains(AccessFlags::INTERFACE))
    }

    pub(crate) fn super_class(&self, classpath: &ClassPath) -> Result<Option<ClassMetadata>> {
        self.shape(classpath)?
            .super_name
            .map(|name| classpath.get(name))
            .transpose()
    }

    pub(crate) fn super_interfaces(&self, classpath: &ClassPath) -> Result<Vec<ClassMetadata>> {
        self.shape(classpath)?
            .interfaces
            .iter()
            .map(|name| classpath.get(name))
            .collect()
    }

    /// Superclass first, then interfaces in declaration order.
    pub(crate) fn super_class_and_interfaces(
        &self,
        classpath: &ClassPath,
    ) -> Result<Vec<ClassMetadata>> {
        let mut supers: Vec<ClassMetadata> = self.super_class(classpath)?.into_iter().collect();
        supers.extend(self.super_interfaces(classpath)?);
        Ok(supers)
    }

    pub(crate) fn fields(&self, classpath: &ClassPath) -> Result<Vec<MemberDesc>> {
        Ok(self
            .shape(classpath)?
            .fields
            .map(|(name, descriptor, _)| MemberDesc::new(name, descriptor))
            .collect())
    }

    pub(crate) fn methods(&self, classpath: &ClassPath) -> Result<Vec<MemberDesc>> {
        Ok(self
            .shape(classpath)?
            .methods
            .map(|(name, descriptor, _)| MemberDesc::new(name, descriptor))
            .collect())
    }

    pub(crate) fn field_access(
        &self,
        classpath: &ClassPath,
        field: &MemberDesc,
    ) -> Result<Option<AccessFlags>> {
        Ok(find_access(self.shape(classpath)?.fields, field))
    }

    pub(crate) fn method_access(
        &self,
        classpath: &ClassPath,
        method: &MemberDesc,
    ) -> Result<Option<AccessFlags>> {
        Ok(find_access(self.shape(classpath)?.methods, method))
    }

    pub(crate) fn is_native(&self, classpath: &ClassPath, method: &MemberDesc) -> Result<bool> {
        Ok(self
            .method_access(classpath, method)?
            .is_some_and(|access| access.contains(AccessFlags::NATIVE)))
    }

    /// Whether some supertype declares `method`.
    pub(crate) fn is_override(&self, classpath: &ClassPath, method: &MemberDesc) -> Result<bool> {
        for ancestor in self.super_class_and_interfaces(classpath)? {
            if ancestor.method_access(classpath, method)?.is_some() {
                return Ok(true);
            }
            if ancestor.is_override(classpath, method)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether a value of `other`'s type can be stored in a variable of this type.
    pub(crate) fn is_assignable_from(
        &self,
        classpath: &ClassPath,
        other: &ClassMetadata,
    ) -> Result<bool> {
        if self == other {
            return Ok(true);
        }
        for ancestor in other.super_class_and_interfaces(classpath)? {
            if self.is_assignable_from(classpath, &ancestor)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Class that declares the field `member` resolves to, following field
    /// lookup order: the class, its interfaces, then its superclass.
    pub(crate) fn resolve_field(
        &self,
        classpath: &ClassPath,
        member: &MemberDesc,
    ) -> Result<Option<ClassMetadata>> {
        if self.field_access(classpath, member)?.is_some() {
            return Ok(Some(self.clone()));
        }
        for interface in self.super_interfaces(classpath)? {
            if let Some(owner) = interface.resolve_field(classpath, member)? {
                return Ok(Some(owner));
            }
        }
        match self.super_class(classpath)? {
            Some(super_class) => super_class.resolve_field(classpath, member),
            None => Ok(None),
        }
    }
}

fn find_access(mut members: Members<'_>, member: &MemberDesc) -> Option<AccessFlags> {
    members
        .find(|(name, descriptor, _)| *name == member.name && *descriptor == member.descriptor)
        .map(|(_, _, access)| access)
}

impl PartialEq for ClassMetadata {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}

impl Eq for ClassMetadata {}

impl PartialOrd for ClassMetadata {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClassMetadata {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name().cmp(other.name())
    }
}

impl Hash for ClassMetadata {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name().hash(state);
    }
}

/// Merged namespace over the libraries being transformed, read-only
/// dependencies and the runtime.
pub(crate) struct ClassPath {
    runtime: RuntimeProvider,
    dependencies: Vec<Library>,
    libraries: Vec<Library>,
    cache: RwLock<BTreeMap<String, ClassMetadata>>,
}

impl ClassPath {
    pub(crate) fn new(
        runtime: RuntimeProvider,
        dependencies: Vec<Library>,
        libraries: Vec<Library>,
    ) -> Result<Self> {
        let mut owners: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for library in &libraries {
            for class in library.iter() {
                owners.entry(&class.name).or_default().push(&library.name);
            }
        }
        let duplicates: Vec<String> = owners
            .iter()
            .filter(|(_, libraries)| libraries.len() > 1)
            .map(|(name, libraries)| format!("{name}: {libraries:?}"))
            .collect();
        if !duplicates.is_empty() {
            anyhow::bail!("duplicate classes found: {}", duplicates.join(", "));
        }
        Ok(Self {
            runtime,
            dependencies,
            libraries,
            cache: RwLock::new(BTreeMap::new()),
        })
    }

    /// Resolve `name`: own libraries, then dependencies, then the runtime.
    pub(crate) fn get(&self, name: &str) -> Result<ClassMetadata> {
        if let Some(metadata) = self.read_cache()?.get(name) {
            return Ok(metadata.clone());
        }
        let metadata = self.resolve(name)?;
        self.cache
            .write()
            .map_err(|_| anyhow::anyhow!("class metadata cache poisoned"))?
            .insert(name.to_string(), metadata.clone());
        Ok(metadata)
    }

    fn read_cache(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, ClassMetadata>>> {
        self.cache
            .read()
            .map_err(|_| anyhow::anyhow!("class metadata cache poisoned"))
    }

    fn resolve(&self, name: &str) -> Result<ClassMetadata> {
        if let Some(library) = self.libraries.iter().position(|library| library.contains(name)) {
            return Ok(ClassMetadata::Resident {
                library,
                name: name.to_string(),
            });
        }
        for library in &self.dependencies {
            if let Some(class) = library.get(name) {
                return Ok(ClassMetadata::External(Arc::new(ExternalClass::from_class(
                    class,
                ))));
            }
        }
        self.runtime
            .get(name)
            .map(ClassMetadata::External)
            .ok_or_else(|| DeobError::UnresolvedClass(name.to_string()).into())
    }

    /// Metadata for every class being transformed, library by library.
    pub(crate) fn library_classes(&self) -> Result<Vec<ClassMetadata>> {
        self.libraries
            .iter()
            .flat_map(Library::iter)
            .map(|class| self.get(&class.name))
            .collect()
    }

    /// Resolve every library class and all of its supertypes so later lookups
    /// only take the read lock.
    pub(crate) fn warm_cache(&self) -> Result<usize> {
        let mut seen = BTreeSet::new();
        let mut pending: Vec<ClassMetadata> = self.library_classes()?;
        while let Some(class) = pending.pop() {
            if !seen.insert(class.name().to_string()) {
                continue;
            }
            pending.extend(
                class
                    .super_class_and_interfaces(self)
                    .with_context(|| format!("resolve supertypes of {}", class.name()))?,
            );
        }
        debug!(classes = seen.len(), "class metadata cache warmed");
        Ok(seen.len())
    }

    pub(crate) fn libraries(&self) -> &[Library] {
        &self.libraries
    }

    pub(crate) fn library_mut(&mut self, index: usize) -> Option<&mut Library> {
        self.libraries.get_mut(index)
    }

    /// Library class by name.
    pub(crate) fn class(&self, name: &str) -> Option<&Class> {
        self.libraries.iter().find_map(|library| library.get(name))
    }

    /// Take a class out of its library so a hook can edit it while holding
    /// shared access to the rest of the class path.
    pub(crate) fn detach(&mut self, library: usize, name: &str) -> Option<Class> {
        let class = self.libraries.get_mut(library)?.remove(name)?;
        self.evict(name);
        Some(class)
    }

    pub(crate) fn attach(&mut self, library: usize, class: Class) {
        let name = class.name.clone();
        if let Some(library) = self.libraries.get_mut(library) {
            library.add(class);
        }
        self.evict(&name);
    }

    /// Drop the memoised resolution of `name`; lookups made while it was
    /// detached must not outlive the detachment.
    fn evict(&mut self, name: &str) {
        match self.cache.get_mut() {
            Ok(cache) => {
                cache.remove(name);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Field, Method};

    fn class(name: &str, super_name: &str, interfaces: &[&str]) -> Class {
        let mut class = Class::new(name, Some(super_name));
        class.interfaces = interfaces.iter().map(|name| name.to_string()).collect();
        class
    }

    fn method(name: &str, descriptor: &str, access: AccessFlags) -> Method {
        Method {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access,
            max_locals: 0,
            instructions: crate::ir::InsnList::new(),
            try_catch_blocks: Vec::new(),
        }
    }

    fn classpath() -> ClassPath {
        let mut client = Library::new("client");
        let mut base = class("a", "java/lang/Object", &["java/lang/Runnable"]);
        base.methods.push(method("run", "()V", AccessFlags::PUBLIC));
        base.fields.push(Field {
            name: "f".to_string(),
            descriptor: "I".to_string(),
            access: AccessFlags::empty(),
        });
        client.add(base);
        client.add(class("b", "a", &[]));
        let mut loader = Library::new("loader");
        loader.add(class("c", "java/applet/Applet", &[]));
        ClassPath::new(RuntimeProvider::builtin(), Vec::new(), vec![client, loader])
            .expect("classpath")
    }

    #[test]
    fn resolution_prefers_libraries_then_runtime() {
        let classpath = classpath();
        let a = classpath.get("a").expect("a");
        assert!(!a.is_dependency());
        assert!(matches!(a, ClassMetadata::Resident { library: 0, .. }));
        let c = classpath.get("c").expect("c");
        assert!(matches!(c, ClassMetadata::Resident { library: 1, .. }));
        let object = classpath.get("java/lang/Object").expect("object");
        assert!(object.is_dependency());
        assert_eq!(object.super_class(&classpath).expect("super"), None);
    }

    #[test]
    fn unknown_classes_are_unresolved() {
        let classpath = classpath();
        let err = classpath.get("missing").expect_err("must fail");
        assert_eq!(
            err.downcast_ref::<DeobError>(),
            Some(&DeobError::UnresolvedClass("missing".to_string()))
        );
    }

    #[test]
    fn hierarchy_queries_follow_supertypes() {
        let classpath = classpath();
        let a = classpath.get("a").expect("a");
        let b = classpath.get("b").expect("b");
        let runnable = classpath.get("java/lang/Runnable").expect("runnable");
        let run = MemberDesc::new("run", "()V");
        assert!(a.is_override(&classpath, &run).expect("override"));
        assert!(b.is_override(&classpath, &run).expect("override"));
        assert!(runnable.is_assignable_from(&classpath, &b).expect("assignable"));
        assert!(!b.is_assignable_from(&classpath, &a).expect("assignable"));
        let field = MemberDesc::new("f", "I");
        assert_eq!(
            b.resolve_field(&classpath, &field).expect("resolve"),
            Some(a.clone())
        );
        assert!(runnable.is_interface(&classpath).expect("interface"));
    }

    #[test]
    fn library_classes_and_warm_cache_cover_supertypes() {
        let classpath = classpath();
        let names: Vec<String> = classpath
            .library_classes()
            .expect("classes")
            .iter()
            .map(|class| class.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        let warmed = classpath.warm_cache().expect("warm");
        assert!(warmed > names.len());
        assert!(
            classpath
                .read_cache()
                .expect("cache")
                .contains_key("java/awt/Component")
        );
    }

    #[test]
    fn detached_classes_can_be_reattached() {
        let mut classpath = classpath();
        let b = classpath.detach(0, "b").expect("detach");
        assert!(classpath.class("b").is_none());
        assert!(classpath.detach(1, "a").is_none());
        classpath.attach(0, b);
        assert_eq!(classpath.class("b").map(|class| class.name.as_str()), Some("b"));
    }

    #[test]
    fn detaching_evicts_the_cached_resolution() {
        let mut classpath = classpath();
        classpath.warm_cache().expect("warm");
        let b = classpath.detach(0, "b").expect("detach");
        assert!(!classpath.read_cache().expect("cache").contains_key("b"));
        let err = classpath.get("b").expect_err("detached class must not resolve");
        assert_eq!(
            err.downcast_ref::<DeobError>(),
            Some(&DeobError::UnresolvedClass("b".to_string()))
        );

        classpath.attach(0, b);
        let b = classpath.get("b").expect("reattached");
        assert!(matches!(b, ClassMetadata::Resident { library: 0, .. }));
        assert!(b.is_override(&classpath, &MemberDesc::new("run", "()V")).expect("override"));
    }

    #[test]
    fn member_queries_read_the_latest_edits() {
        let mut classpath = classpath();
        let a = classpath.get("a").expect("a");
        let run = MemberDesc::new("run", "()V");
        assert_eq!(
            a.method_access(&classpath, &run).expect("access"),
            Some(AccessFlags::PUBLIC)
        );
        classpath
            .library_mut(0)
            .and_then(|library| library.get_mut("a"))
            .and_then(|class| class.method_mut(&run))
            .expect("run")
            .descriptor = "(I)V".to_string();
        assert_eq!(a.method_access(&classpath, &run).expect("access"), None);
        assert_eq!(
            a.methods(&classpath).expect("methods"),
            vec![MemberDesc::new("run", "(I)V")]
        );
        assert!(a.field_access(&classpath, &MemberDesc::new("f", "I")).expect("access").is_some());
    }

    #[test]
    fn duplicate_library_classes_are_rejected() {
        let mut first = Library::new("first");
        first.add(class("a", "java/lang/Object", &[]));
        let mut second = Library::new("second");
        second.add(class("a", "java/lang/Object", &[]));
        let err = ClassPath::new(RuntimeProvider::builtin(), Vec::new(), vec![first, second])
            .err()
            .expect("duplicate class error");
        assert!(format!("{err:#}").contains("duplicate classes"));
    }
}

//! Equivalence classes of members that must share a name across a hierarchy.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use tracing::debug;

use crate::classpath::{ClassMetadata, ClassPath};
use crate::disjoint_set::DisjointSet;
use crate::ir::{AccessFlags, MemberDesc, MemberRef};

/// Immutable snapshot of a member partitioning, numbered in partition order.
///
/// Unlike [`DisjointSet`] it can be shared between worker threads.
#[derive(Clone, Debug, Default)]
pub(crate) struct MemberPartitions {
    index: BTreeMap<MemberRef, usize>,
    members: Vec<Vec<MemberRef>>,
}

impl MemberPartitions {
    pub(crate) fn from_set(set: &DisjointSet<MemberRef>) -> Self {
        let mut partitions = Self::default();
        for (id, partition) in set.partitions().into_iter().enumerate() {
            let mut members: Vec<MemberRef> = set.members(partition).into_iter().cloned().collect();
            members.sort();
            for member in &members {
                partitions.index.insert(member.clone(), id);
            }
            partitions.members.push(members);
        }
        partitions
    }

    pub(crate) fn get(&self, member: &MemberRef) -> Option<usize> {
        self.index.get(member).copied()
    }

    /// Members of partition `id`, sorted.
    pub(crate) fn members(&self, id: usize) -> &[MemberRef] {
        self.members.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum MemberKind {
    Field,
    Method,
}

/// Partition fields so a field inherited without redeclaration shares one set
/// with its declaration. Fields whose name is in `exclusions` stay singletons.
pub(crate) fn unify_fields(
    classpath: &ClassPath,
    exclusions: &BTreeSet<String>,
) -> Result<DisjointSet<MemberRef>> {
    unify(classpath, exclusions, MemberKind::Field)
}

/// Partition methods so overriding and overridden methods share one set.
pub(crate) fn unify_methods(
    classpath: &ClassPath,
    exclusions: &BTreeSet<String>,
) -> Result<DisjointSet<MemberRef>> {
    unify(classpath, exclusions, MemberKind::Method)
}

fn unify(
    classpath: &ClassPath,
    exclusions: &BTreeSet<String>,
    kind: MemberKind,
) -> Result<DisjointSet<MemberRef>> {
    let mut unifier = Unifier {
        classpath,
        exclusions,
        kind,
        set: DisjointSet::new(),
        ancestors: BTreeMap::new(),
    };
    for class in classpath.library_classes()? {
        unifier
            .visit(&class)
            .with_context(|| format!("unify members of {}", class.name()))?;
    }
    debug!(
        members = unifier.set.element_count(),
        partitions = unifier.set.partition_count(),
        fields = kind == MemberKind::Field,
        "unified inherited members"
    );
    Ok(unifier.set)
}

struct Unifier<'a> {
    classpath: &'a ClassPath,
    exclusions: &'a BTreeSet<String>,
    kind: MemberKind,
    set: DisjointSet<MemberRef>,
    /// Members visible from each class, including inherited ones.
    ancestors: BTreeMap<String, BTreeSet<MemberDesc>>,
}

impl Unifier<'_> {
    fn visit(&mut self, class: &ClassMetadata) -> Result<BTreeSet<MemberDesc>> {
        if let Some(visible) = self.ancestors.get(class.name()) {
            return Ok(visible.clone());
        }

        let mut visible = BTreeSet::new();
        for ancestor in class.super_class_and_interfaces(self.classpath)? {
            for member in self.visit(&ancestor)? {
                if self.shadows(class, &member)? {
                    continue;
                }
                if !self.exclusions.contains(&member.name) {
                    let own = self.set.add(MemberRef::of(class.name(), &member));
                    let inherited = self.set.add(MemberRef::of(ancestor.name(), &member));
                    self.set.union(own, inherited);
                }
                visible.insert(member);
            }
        }

        for member in self.members(class)? {
            self.set.add(MemberRef::of(class.name(), &member));
            visible.insert(member);
        }

        self.ancestors
            .insert(class.name().to_string(), visible.clone());
        Ok(visible)
    }

    fn members(&self, class: &ClassMetadata) -> Result<Vec<MemberDesc>> {
        match self.kind {
            MemberKind::Field => class.fields(self.classpath),
            MemberKind::Method => class.methods(self.classpath),
        }
    }

    /// A redeclared field, static method or constructor starts a new chain.
    fn shadows(&self, class: &ClassMetadata, member: &MemberDesc) -> Result<bool> {
        let access = match self.kind {
            MemberKind::Field => class.field_access(self.classpath, member)?,
            MemberKind::Method => class.method_access(self.classpath, member)?,
        };
        Ok(access.is_some_and(|access| {
            self.kind == MemberKind::Field
                || access.contains(AccessFlags::STATIC)
                || member.name == "<init>"
        }))
    }
}

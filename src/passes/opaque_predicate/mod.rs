use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use tracing::info;

use crate::classpath::ClassPath;
use crate::config::Profile;
use crate::ir::{Insn, InsnId, MemberRef, Method};
use crate::matcher::InsnMatcher;
use crate::opcodes::*;
use crate::passes::PassMetadata;
use crate::transform::Transformer;

const FLOW_OBSTRUCTOR_INITIALIZER: &str = "
    (GETSTATIC | ILOAD)
    IFEQ
    (((GETSTATIC ISTORE)? IINC ILOAD) | ((GETSTATIC | ILOAD) IFEQ ICONST GOTO ICONST))
    PUTSTATIC
";
const OPAQUE_PREDICATE: &str = "(GETSTATIC | ILOAD) (IFEQ | IFNE)";
const STORE: &str = "GETSTATIC ISTORE";

struct Matchers {
    initializer: InsnMatcher,
    predicate: InsnMatcher,
    store: InsnMatcher,
}

/// Removes branches on static boolean fields that are written once by an
/// obfuscator-inserted initializer and never hold anything but `false`.
#[derive(Default)]
pub(crate) struct OpaquePredicatePass {
    matchers: Option<Matchers>,
    flow_obstructors: BTreeSet<MemberRef>,
    opaque_predicates: usize,
    stores: usize,
}

crate::register_pass!(OpaquePredicatePass);

impl OpaquePredicatePass {
    pub(crate) fn new(_profile: &Profile) -> Self {
        Self::default()
    }

    fn matchers(&self) -> Result<&Matchers> {
        self.matchers
            .as_ref()
            .context("opaque predicate matchers used before pre-transform")
    }

    fn is_flow_obstructor(&self, insn: Option<&Insn>) -> bool {
        match insn {
            Some(Insn::Field {
                opcode: GETSTATIC,
                member,
            }) => self.flow_obstructors.contains(member),
            _ => false,
        }
    }

    fn is_opaque_predicate(&self, method: &Method, stores: &[Vec<InsnId>], load: InsnId) -> bool {
        let list = &method.instructions;
        match list.get(load) {
            Some(Insn::Field { .. }) => self.is_flow_obstructor(list.get(load)),
            Some(Insn::Var { opcode: ILOAD, var }) => stores.iter().any(|store| {
                self.is_flow_obstructor(list.get(store[0]))
                    && matches!(list.get(store[1]), Some(Insn::Var { var: stored, .. }) if stored == var)
            }),
            _ => false,
        }
    }
}

/// Remove every flow-obstructor initializer in `method`, returning the fields
/// they assigned.
fn remove_initializers(matcher: &InsnMatcher, method: &mut Method) -> Vec<MemberRef> {
    let mut obstructors = Vec::new();
    for found in matcher.match_list(&method.instructions) {
        let Some(Insn::Field { member, .. }) = found.last().and_then(|id| method.instructions.get(*id))
        else {
            continue;
        };
        obstructors.push(member.clone());
        for id in found {
            method.instructions.remove(id);
        }
    }
    obstructors
}

impl Transformer for OpaquePredicatePass {
    fn metadata(&self) -> PassMetadata {
        PassMetadata {
            id: "opaque_predicate",
            name: "Opaque predicates",
            description: "Removes branches on flow-obstructor fields that are always false, together with their initializers and redundant copies into locals",
            order: 10,
        }
    }

    fn pre_transform(&mut self, classpath: &mut ClassPath) -> Result<()> {
        let matchers = Matchers {
            initializer: InsnMatcher::compile(FLOW_OBSTRUCTOR_INITIALIZER)?,
            predicate: InsnMatcher::compile(OPAQUE_PREDICATE)?,
            store: InsnMatcher::compile(STORE)?,
        };
        self.flow_obstructors.clear();
        self.opaque_predicates = 0;
        self.stores = 0;

        for index in 0..classpath.libraries().len() {
            let Some(library) = classpath.library_mut(index) else {
                continue;
            };
            let mut found = Vec::new();
            for name in library.names() {
                let Some(class) = library.get_mut(&name) else {
                    continue;
                };
                for method in class.methods.iter_mut().filter(|method| method.has_code()) {
                    found.extend(remove_initializers(&matchers.initializer, method));
                }
            }
            for member in found {
                if let Some(owner) = library.get_mut(&member.owner) {
                    owner.remove_field(&member.desc());
                }
                self.flow_obstructors.insert(member);
            }
        }

        let obstructors: Vec<String> = self.flow_obstructors.iter().map(ToString::to_string).collect();
        info!("Identified flow obstructors {:?}", obstructors);
        self.matchers = Some(matchers);
        Ok(())
    }

    fn transform_code(
        &mut self,
        _classpath: &ClassPath,
        _owner: &str,
        method: &mut Method,
    ) -> Result<bool> {
        let matchers = self.matchers()?;
        let stores = matchers.store.match_list(&method.instructions);
        let predicates: Vec<Vec<InsnId>> = matchers
            .predicate
            .match_list(&method.instructions)
            .into_iter()
            .filter(|found| self.is_opaque_predicate(method, &stores, found[0]))
            .collect();

        for found in &predicates {
            let (load, branch) = (found[0], found[1]);
            match method.instructions.get(branch) {
                // Always taken.
                Some(Insn::Jump {
                    opcode: IFEQ,
                    target,
                }) => {
                    let target = *target;
                    method.instructions.insert_after(
                        branch,
                        Insn::Jump {
                            opcode: GOTO,
                            target,
                        },
                    );
                    method.instructions.remove(load);
                    method.instructions.remove(branch);
                }
                // Never taken.
                _ => {
                    method.instructions.remove(load);
                    method.instructions.remove(branch);
                }
            }
        }
        self.opaque_predicates += predicates.len();

        let redundant: Vec<Vec<InsnId>> = stores
            .into_iter()
            .filter(|store| self.is_flow_obstructor(method.instructions.get(store[0])))
            .collect();
        for store in &redundant {
            for id in store {
                method.instructions.remove(*id);
            }
        }
        self.stores += redundant.len();

        Ok(false)
    }

    fn post_transform(&mut self, _classpath: &mut ClassPath) -> Result<()> {
        info!(
            "Removed {} opaque predicates and {} redundant stores",
            self.opaque_predicates, self.stores
        );
        Ok(())
    }

    fn counters(&self) -> BTreeMap<&'static str, usize> {
        BTreeMap::from([
            ("flow_obstructors", self.flow_obstructors.len()),
            ("opaque_predicates", self.opaque_predicates),
            ("redundant_stores", self.stores),
        ])
    }
}

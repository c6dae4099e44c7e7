use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::classpath::ClassPath;
use crate::config::Profile;
use crate::dataflow::analyzer::analyze;
use crate::dataflow::const_source::{ConstSourceInterpreter, SourceValue};
use crate::descriptor::MethodType;
use crate::ir::{Insn, InsnId, MemberRef, Method};
use crate::opcodes::*;
use crate::passes::PassMetadata;
use crate::remap::is_method_partition_renamable;
use crate::transform::Transformer;
use crate::unifier::{MemberPartitions, unify_methods};

/// `(method partition, argument index)`.
type ArgRef = (usize, usize);

/// Deletes `int`-like arguments that no implementation reads, from both the
/// declarations and every call site, when all call sites pass a constant.
pub(crate) struct UnusedArgPass {
    excluded_methods: BTreeSet<String>,
    partitions: MemberPartitions,
    renamable: BTreeSet<usize>,
    retained: BTreeSet<ArgRef>,
    removed: usize,
}

crate::register_pass!(UnusedArgPass);

impl UnusedArgPass {
    pub(crate) fn new(profile: &Profile) -> Self {
        Self {
            excluded_methods: profile.excluded_methods.clone(),
            partitions: MemberPartitions::default(),
            renamable: BTreeSet::new(),
            retained: BTreeSet::new(),
            removed: 0,
        }
    }

    fn renamable_partition(&self, member: &MemberRef) -> Option<usize> {
        self.partitions
            .get(member)
            .filter(|partition| self.renamable.contains(partition))
    }

    /// Arguments `method` keeps alive: its own parameters it reads or
    /// overwrites, and arguments it passes that are not a single constant.
    fn retained_args(&self, owner: &str, method: &Method) -> Result<Vec<ArgRef>> {
        let member = MemberRef::new(owner, &method.name, &method.descriptor);
        let partition = self
            .partitions
            .get(&member)
            .with_context(|| format!("{member} is missing from the method partitions"))?;
        let locals = local_to_arg_map(method)?;
        let analysis = analyze(owner, method, &ConstSourceInterpreter)?;

        let mut retained = Vec::new();
        for (index, (_, insn)) in method.instructions.iter().enumerate() {
            match insn {
                Insn::Var {
                    opcode: ILOAD | ISTORE,
                    var,
                }
                | Insn::Iinc { var, .. } => {
                    if let Some(arg) = locals.get(var) {
                        retained.push((partition, *arg));
                    }
                }
                Insn::Method { member, .. } => {
                    let Some(callee) = self.renamable_partition(member) else {
                        continue;
                    };
                    let arguments = MethodType::parse(&member.descriptor)?.arguments.len();
                    // Call sites without a frame are never rewritten.
                    let Some(frame) = analysis.frame(index) else {
                        retained.extend((0..arguments).map(|arg| (callee, arg)));
                        continue;
                    };
                    for arg in 0..arguments {
                        let value = frame
                            .peek(arguments - 1 - arg)
                            .context("invoke argument missing from the operand stack")?;
                        if !matches!(value, SourceValue::Single { .. }) {
                            retained.push((callee, arg));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(retained)
    }

    /// Arguments of `partition` that will be removed, in descending order.
    fn removable_args(&self, partition: usize, descriptor: &str) -> Result<Vec<usize>> {
        if !self.renamable.contains(&partition) {
            return Ok(Vec::new());
        }
        let arguments = MethodType::parse(descriptor)?.arguments;
        Ok((0..arguments.len())
            .rev()
            .filter(|arg| {
                arguments[*arg].is_int_like() && !self.retained.contains(&(partition, *arg))
            })
            .collect())
    }

    fn reduced_descriptor(&self, partition: usize, descriptor: &str) -> Result<String> {
        let mut method_type = MethodType::parse(descriptor)?;
        for arg in self.removable_args(partition, descriptor)? {
            method_type = method_type.without_argument(arg);
        }
        Ok(method_type.to_string())
    }

    /// Keep every argument of partitions whose reduced descriptor would clash
    /// with another method declared by the same class.
    fn retain_clashing(&mut self, classpath: &ClassPath) -> Result<()> {
        loop {
            let mut signatures: BTreeMap<(&str, &str, String), Vec<Option<usize>>> =
                BTreeMap::new();
            for class in classpath.libraries().iter().flat_map(|library| library.iter()) {
                for method in &class.methods {
                    let member = MemberRef::new(&class.name, &method.name, &method.descriptor);
                    let partition = self.partitions.get(&member);
                    let descriptor = match partition {
                        Some(partition) => {
                            self.reduced_descriptor(partition, &method.descriptor)?
                        }
                        None => method.descriptor.clone(),
                    };
                    signatures
                        .entry((class.name.as_str(), method.name.as_str(), descriptor))
                        .or_default()
                        .push(partition);
                }
            }

            let mut clashing = BTreeSet::new();
            for partitions in signatures.values().filter(|partitions| partitions.len() > 1) {
                for partition in partitions.iter().flatten() {
                    let Some(first) = self.partitions.members(*partition).first() else {
                        continue;
                    };
                    if !self.removable_args(*partition, &first.descriptor)?.is_empty() {
                        clashing.insert(*partition);
                    }
                }
            }
            if clashing.is_empty() {
                return Ok(());
            }
            for partition in clashing {
                debug!(partition, "reduced descriptor clashes, keeping arguments");
                let Some(first) = self.partitions.members(partition).first() else {
                    continue;
                };
                let arguments = MethodType::parse(&first.descriptor)?.arguments.len();
                self.retained.extend((0..arguments).map(|arg| (partition, arg)));
            }
        }
    }
}

/// Parameter local slot to argument index.
fn local_to_arg_map(method: &Method) -> Result<BTreeMap<u16, usize>> {
    let arguments = MethodType::parse(&method.descriptor)?.arguments;
    let mut map = BTreeMap::new();
    let mut local = usize::from(!method.is_static());
    for (index, argument) in arguments.iter().enumerate() {
        map.insert(u16::try_from(local)?, index);
        local += argument.size();
    }
    Ok(map)
}

/// Drop argument `index` from `method`'s descriptor and shift every local
/// above it down.
pub(crate) fn remove_argument(method: &mut Method, index: usize) -> Result<()> {
    let method_type = MethodType::parse(&method.descriptor)?;
    let argument = method_type
        .arguments
        .get(index)
        .with_context(|| format!("{} has no argument {index}", method.descriptor))?;
    let size = argument.size();
    let local_index = usize::from(!method.is_static())
        + method_type.arguments[..index]
            .iter()
            .map(|argument| argument.size())
            .sum::<usize>();

    method.descriptor = method_type.without_argument(index).to_string();
    if !method.has_code() {
        return Ok(());
    }
    let size = u16::try_from(size)?;
    let local_index = u16::try_from(local_index)?;
    method.max_locals = method.max_locals.saturating_sub(size);
    for id in method.instructions.ids() {
        match method.instructions.get_mut(id) {
            Some(Insn::Var { var, .. } | Insn::Iinc { var, .. }) if *var >= local_index => {
                *var -= size;
            }
            _ => {}
        }
    }
    Ok(())
}

impl Transformer for UnusedArgPass {
    fn metadata(&self) -> PassMetadata {
        PassMetadata {
            id: "unused_arg",
            name: "Unused arguments",
            description: "Removes int arguments that no implementation reads and that every caller passes as a constant",
            order: 50,
        }
    }

    fn pre_transform(&mut self, classpath: &mut ClassPath) -> Result<()> {
        let methods = unify_methods(classpath, &self.excluded_methods)?;
        self.partitions = MemberPartitions::from_set(&methods);
        self.renamable.clear();
        for id in 0..self.partitions.len() {
            if is_method_partition_renamable(
                classpath,
                self.partitions.members(id),
                &self.excluded_methods,
            )? {
                self.renamable.insert(id);
            }
        }
        self.removed = 0;
        classpath.warm_cache()?;

        let bodies: Vec<(&str, &Method)> = classpath
            .libraries()
            .iter()
            .flat_map(|library| library.iter())
            .flat_map(|class| {
                class
                    .methods
                    .iter()
                    .filter(|method| method.has_code())
                    .map(move |method| (class.name.as_str(), method))
            })
            .collect();
        let retained = bodies
            .par_iter()
            .map(|(owner, method)| {
                self.retained_args(owner, method)
                    .with_context(|| format!("scan {owner}.{}{}", method.name, method.descriptor))
            })
            .collect::<Result<Vec<_>>>()?;
        self.retained = retained.into_iter().flatten().collect();
        self.retain_clashing(classpath)?;
        debug!(retained = self.retained.len(), "collected retained arguments");
        Ok(())
    }

    fn pre_transform_method(
        &mut self,
        _classpath: &ClassPath,
        owner: &str,
        method: &mut Method,
    ) -> Result<bool> {
        if !method.has_code() {
            return Ok(false);
        }
        let analysis = analyze(owner, method, &ConstSourceInterpreter)?;
        let mut dead: Vec<InsnId> = Vec::new();
        let mut rewrites: Vec<(InsnId, String)> = Vec::new();
        for (index, (id, insn)) in method.instructions.iter().enumerate() {
            let Some(frame) = analysis.frame(index) else {
                continue;
            };
            let Insn::Method { member, .. } = insn else {
                continue;
            };
            let Some(callee) = self.renamable_partition(member) else {
                continue;
            };
            let removable = self.removable_args(callee, &member.descriptor)?;
            if removable.is_empty() {
                continue;
            }
            let mut rewritten = MethodType::parse(&member.descriptor)?;
            let arguments = rewritten.arguments.len();
            for arg in removable {
                let source = frame
                    .peek(arguments - 1 - arg)
                    .and_then(SourceValue::source)
                    .with_context(|| format!("argument {arg} of {member} has no single constant source"))?;
                dead.push(source);
                rewritten = rewritten.without_argument(arg);
            }
            rewrites.push((id, rewritten.to_string()));
        }

        for (id, descriptor) in rewrites {
            if let Some(Insn::Method { member, .. }) = method.instructions.get_mut(id) {
                member.descriptor = descriptor;
            }
        }
        for id in dead {
            method.instructions.remove(id);
        }
        Ok(false)
    }

    fn post_transform_method(
        &mut self,
        _classpath: &ClassPath,
        owner: &str,
        method: &mut Method,
    ) -> Result<bool> {
        let member = MemberRef::new(owner, &method.name, &method.descriptor);
        let Some(partition) = self.renamable_partition(&member) else {
            return Ok(false);
        };
        for arg in self.removable_args(partition, &method.descriptor)? {
            remove_argument(method, arg)?;
            self.removed += 1;
        }
        Ok(false)
    }

    fn post_transform(&mut self, _classpath: &mut ClassPath) -> Result<()> {
        info!("Removed {} unused arguments", self.removed);
        Ok(())
    }

    fn counters(&self) -> BTreeMap<&'static str, usize> {
        BTreeMap::from([("arguments_removed", self.removed)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AccessFlags, Class, InsnList, LabelId, MemberDesc};
    use crate::library::Library;
    use crate::runtime::RuntimeProvider;
    use crate::test_harness::{assert_heights_preserved, stack_heights};
    use crate::transform::run;

    fn method(name: &str, descriptor: &str, max_locals: u16, body: Vec<Insn>) -> Method {
        let mut instructions = InsnList::new();
        for insn in body {
            instructions.push(insn);
        }
        Method {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access: AccessFlags::STATIC,
            max_locals,
            instructions,
            try_catch_blocks: Vec::new(),
        }
    }

    fn invoke(name: &str, descriptor: &str) -> Insn {
        Insn::Method {
            opcode: INVOKESTATIC,
            member: MemberRef::new("a", name, descriptor),
            interface: false,
        }
    }

    /// `callee(II)V` only reads its second argument.
    fn methods() -> Vec<Method> {
        vec![
            method(
                "callee",
                "(II)V",
                2,
                vec![
                    Insn::Var { opcode: ILOAD, var: 1 },
                    invoke("sink", "(I)V"),
                    Insn::Simple(RETURN),
                ],
            ),
            method(
                "caller",
                "()V",
                0,
                vec![
                    Insn::Simple(ICONST_3),
                    Insn::Int { opcode: BIPUSH, operand: 9 },
                    invoke("callee", "(II)V"),
                    Insn::Simple(RETURN),
                ],
            ),
            method(
                "sink",
                "(I)V",
                1,
                vec![
                    Insn::Var { opcode: ILOAD, var: 0 },
                    Insn::Simple(POP),
                    Insn::Simple(RETURN),
                ],
            ),
        ]
    }

    fn classpath(methods: Vec<Method>) -> ClassPath {
        let mut class = Class::new("a", Some("java/lang/Object"));
        class.methods = methods;
        let library: Library = std::iter::once(class).collect();
        ClassPath::new(RuntimeProvider::builtin(), Vec::new(), vec![library]).expect("classpath")
    }

    fn find<'a>(classpath: &'a ClassPath, name: &str, descriptor: &str) -> Option<&'a Method> {
        classpath
            .class("a")
            .and_then(|class| class.method(&MemberDesc::new(name, descriptor)))
    }

    fn body(method: &Method) -> Vec<Insn> {
        method.instructions.iter().map(|(_, insn)| insn.clone()).collect()
    }

    #[test]
    fn unread_constant_argument_is_removed_everywhere() {
        let mut classpath = classpath(methods());
        let mut pass = UnusedArgPass::new(&Profile::default());
        let stats = run(&mut pass, &mut classpath).expect("run");
        assert_eq!(stats.counters.get("arguments_removed"), Some(&1));

        let callee = find(&classpath, "callee", "(I)V").expect("callee rewritten");
        assert_eq!(callee.max_locals, 1);
        assert_eq!(
            body(callee),
            vec![
                Insn::Var { opcode: ILOAD, var: 0 },
                invoke("sink", "(I)V"),
                Insn::Simple(RETURN),
            ]
        );
        let caller = find(&classpath, "caller", "()V").expect("caller");
        assert_eq!(
            body(caller),
            vec![
                Insn::Int { opcode: BIPUSH, operand: 9 },
                invoke("callee", "(I)V"),
                Insn::Simple(RETURN),
            ]
        );
        assert!(find(&classpath, "sink", "(I)V").is_some());
    }

    #[test]
    fn non_constant_argument_is_retained() {
        let mut methods = methods();
        methods.push(method(
            "forward",
            "(I)V",
            1,
            vec![
                Insn::Var { opcode: ILOAD, var: 0 },
                Insn::Simple(ICONST_1),
                invoke("callee", "(II)V"),
                Insn::Simple(RETURN),
            ],
        ));
        let mut classpath = classpath(methods);
        let mut pass = UnusedArgPass::new(&Profile::default());
        let stats = run(&mut pass, &mut classpath).expect("run");
        assert_eq!(stats.counters.get("arguments_removed"), Some(&0));
        assert!(find(&classpath, "callee", "(II)V").is_some());
    }

    #[test]
    fn overwritten_parameter_is_retained() {
        let mut methods = methods();
        methods[0] = method(
            "callee",
            "(II)V",
            2,
            vec![
                Insn::Iinc { var: 0, increment: 1 },
                Insn::Var { opcode: ILOAD, var: 1 },
                invoke("sink", "(I)V"),
                Insn::Simple(RETURN),
            ],
        );
        let mut classpath = classpath(methods);
        let mut pass = UnusedArgPass::new(&Profile::default());
        run(&mut pass, &mut classpath).expect("run");
        assert!(find(&classpath, "callee", "(II)V").is_some());
    }

    #[test]
    fn removing_a_wide_argument_shifts_later_locals() {
        let mut method = method(
            "m",
            "(JI)V",
            4,
            vec![
                Insn::Var { opcode: ALOAD, var: 0 },
                Insn::Simple(POP),
                Insn::Var { opcode: ILOAD, var: 3 },
                Insn::Iinc { var: 3, increment: 2 },
                Insn::Simple(RETURN),
            ],
        );
        method.access = AccessFlags::PUBLIC;
        remove_argument(&mut method, 0).expect("remove");
        assert_eq!(method.descriptor, "(I)V");
        assert_eq!(method.max_locals, 2);
        assert_eq!(
            body(&method),
            vec![
                Insn::Var { opcode: ALOAD, var: 0 },
                Insn::Simple(POP),
                Insn::Var { opcode: ILOAD, var: 1 },
                Insn::Iinc { var: 1, increment: 2 },
                Insn::Simple(RETURN),
            ]
        );
    }

    #[test]
    fn unreachable_call_site_keeps_every_argument() {
        let mut methods = methods();
        let skip = LabelId(0);
        methods.push(method(
            "stale",
            "()V",
            0,
            vec![
                Insn::Jump { opcode: GOTO, target: skip },
                Insn::Simple(ICONST_3),
                Insn::Int { opcode: BIPUSH, operand: 9 },
                invoke("callee", "(II)V"),
                Insn::Label(skip),
                Insn::Simple(RETURN),
            ],
        ));
        let mut classpath = classpath(methods);
        let mut pass = UnusedArgPass::new(&Profile::default());
        let stats = run(&mut pass, &mut classpath).expect("run");
        assert_eq!(stats.counters.get("arguments_removed"), Some(&0));
        assert!(find(&classpath, "callee", "(II)V").is_some());
        let stale = find(&classpath, "stale", "()V").expect("stale");
        assert!(body(stale).contains(&invoke("callee", "(II)V")));
        let caller = find(&classpath, "caller", "()V").expect("caller");
        assert!(body(caller).contains(&Insn::Simple(ICONST_3)));
    }

    #[test]
    fn reduced_descriptor_clashing_with_a_sibling_is_kept() {
        let mut classpath = classpath(vec![
            method("m", "(I)V", 1, vec![Insn::Simple(RETURN)]),
            method("m", "()V", 0, vec![Insn::Simple(RETURN)]),
            method(
                "caller",
                "()V",
                0,
                vec![
                    Insn::Simple(ICONST_1),
                    invoke("m", "(I)V"),
                    invoke("m", "()V"),
                    Insn::Simple(RETURN),
                ],
            ),
        ]);
        let mut pass = UnusedArgPass::new(&Profile::default());
        let stats = run(&mut pass, &mut classpath).expect("run");
        assert_eq!(stats.counters.get("arguments_removed"), Some(&0));
        assert!(find(&classpath, "m", "(I)V").is_some());
        assert!(find(&classpath, "m", "()V").is_some());
        let caller = find(&classpath, "caller", "()V").expect("caller");
        assert_eq!(
            body(caller),
            vec![
                Insn::Simple(ICONST_1),
                invoke("m", "(I)V"),
                invoke("m", "()V"),
                Insn::Simple(RETURN),
            ]
        );
    }

    #[test]
    fn removal_beside_a_side_effecting_long_keeps_the_stack_balanced() {
        let mut classpath = classpath(vec![
            method(
                "now",
                "()J",
                0,
                vec![Insn::Simple(LCONST_0), Insn::Simple(LRETURN)],
            ),
            method(
                "first",
                "(JI)V",
                3,
                vec![
                    Insn::Var { opcode: LLOAD, var: 0 },
                    Insn::Simple(POP2),
                    Insn::Simple(RETURN),
                ],
            ),
            method(
                "second",
                "(IJ)V",
                3,
                vec![
                    Insn::Var { opcode: LLOAD, var: 1 },
                    Insn::Simple(POP2),
                    Insn::Simple(RETURN),
                ],
            ),
            method(
                "caller",
                "()V",
                0,
                vec![
                    invoke("now", "()J"),
                    Insn::Int { opcode: BIPUSH, operand: 7 },
                    invoke("first", "(JI)V"),
                    Insn::Int { opcode: BIPUSH, operand: 8 },
                    invoke("now", "()J"),
                    invoke("second", "(IJ)V"),
                    Insn::Simple(RETURN),
                ],
            ),
        ]);
        let caller = find(&classpath, "caller", "()V").expect("caller");
        let before = stack_heights(caller).expect("heights");
        let ids = caller.instructions.ids();

        let mut pass = UnusedArgPass::new(&Profile::default());
        let stats = run(&mut pass, &mut classpath).expect("run");
        assert_eq!(stats.counters.get("arguments_removed"), Some(&2));

        let caller = find(&classpath, "caller", "()V").expect("caller");
        assert_eq!(
            body(caller),
            vec![
                invoke("now", "()J"),
                invoke("first", "(J)V"),
                invoke("now", "()J"),
                invoke("second", "(J)V"),
                Insn::Simple(RETURN),
            ]
        );
        // The second `now` sat above the removed constant.
        assert_heights_preserved(&before, caller, &[ids[2], ids[4], ids[5]]);
        let after = stack_heights(caller).expect("heights");
        assert_eq!(after.get(&ids[2]), Some(&1));
        assert_eq!(after.get(&ids[5]), Some(&1));
        assert_eq!(after.get(&ids[6]), Some(&0));

        let second = find(&classpath, "second", "(J)V").expect("second rewritten");
        assert_eq!(second.max_locals, 2);
        assert_eq!(body(second)[0], Insn::Var { opcode: LLOAD, var: 0 });
    }
}

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use tracing::info;

use crate::classpath::ClassPath;
use crate::config::Profile;
use crate::dataflow::analyzer::analyze;
use crate::dataflow::branch::{BranchResult, evaluate_binary, evaluate_unary};
use crate::dataflow::int_value::{IntInterpreter, IntValue};
use crate::dataflow::interpreter::Value;
use crate::descriptor::MethodType;
use crate::expr::{
    PurityPolicy, create_int_constant, delete_expression, get_argument_expressions, int_constant,
    is_pure, replace_expression,
};
use crate::ir::{Insn, InsnId, MemberRef, Method};
use crate::matcher::InsnMatcher;
use crate::opcodes::*;
use crate::passes::PassMetadata;
use crate::remap::is_method_partition_renamable;
use crate::stack::stack_metadata;
use crate::transform::Transformer;
use crate::unifier::{MemberPartitions, unify_methods};

const CONDITIONAL_CALL: &str = "
    ILOAD
    (IFEQ | IFNE |
        (ICONST | BIPUSH | SIPUSH | LDC)
        (IF_ICMPEQ | IF_ICMPNE | IF_ICMPLT | IF_ICMPGE | IF_ICMPGT | IF_ICMPLE)
    )
    ALOAD?
    (ICONST | FCONST | DCONST | BIPUSH | SIPUSH | LDC | ACONST_NULL CHECKCAST)+
    (INVOKEVIRTUAL | INVOKESTATIC | INVOKEINTERFACE)
";

/// A call guarded by a test on one of the caller's parameters, with constant
/// arguments.
#[derive(Clone, Debug)]
struct ConditionalCall {
    /// Caller parameter slot tested by the guard.
    condition_var: usize,
    condition_opcode: u8,
    /// Right-hand side of an `if_icmp*` guard.
    condition_value: Option<i32>,
    callee: usize,
    /// Constant arguments by callee parameter slot.
    const_args: Vec<Option<i32>>,
}

/// Folds branches on integer parameters that only ever receive constant
/// values, and inlines expressions that always evaluate to one constant.
pub(crate) struct DummyArgPass {
    max_tracked_values: usize,
    excluded_methods: BTreeSet<String>,
    purity: PurityPolicy,
    matcher: Option<InsnMatcher>,
    partitions: MemberPartitions,
    /// Partitions whose every caller is visible, so arguments may be seeded.
    seedable: BTreeSet<usize>,
    /// Values passed for `(callee partition, parameter slot)`, tagged with the
    /// caller partition.
    arg_values: BTreeMap<(usize, usize), Vec<(usize, IntValue)>>,
    conditional_calls: BTreeMap<usize, Vec<ConditionalCall>>,
    const_args: BTreeMap<usize, Vec<Option<BTreeSet<i32>>>>,
    branches_simplified: usize,
    constants_inlined: usize,
}

crate::register_pass!(DummyArgPass);

impl DummyArgPass {
    pub(crate) fn new(profile: &Profile) -> Self {
        Self {
            max_tracked_values: profile.max_tracked_int_values,
            excluded_methods: profile.excluded_methods.clone(),
            purity: profile.purity(),
            matcher: None,
            partitions: MemberPartitions::default(),
            seedable: BTreeSet::new(),
            arg_values: BTreeMap::new(),
            conditional_calls: BTreeMap::new(),
            const_args: BTreeMap::new(),
            branches_simplified: 0,
            constants_inlined: 0,
        }
    }

    fn record_conditional_calls(&mut self, parent: usize, method: &Method) -> Result<()> {
        let matcher = self
            .matcher
            .as_ref()
            .context("conditional call matcher used before pre-transform")?;
        let list = &method.instructions;
        let stored: BTreeSet<u16> = list
            .iter()
            .filter_map(|(_, insn)| match insn {
                Insn::Var { opcode: ISTORE, var } => Some(*var),
                _ => None,
            })
            .collect();
        let receiver = usize::from(!method.is_static());
        let parameter_locals = MethodType::parse(&method.descriptor)?.argument_size() + receiver;

        let mut calls = Vec::new();
        for found in matcher.match_list(list) {
            let insns: Vec<&Insn> = found.iter().filter_map(|id| list.get(*id)).collect();
            let Some(&&Insn::Var { var, .. }) = insns.first() else {
                continue;
            };
            let local = usize::from(var);
            if stored.contains(&var) || local < receiver || local >= parameter_locals {
                continue;
            }
            let Some(Insn::Method { member, .. }) = insns.last() else {
                continue;
            };
            let Some(callee) = self.partitions.get(member) else {
                continue;
            };

            let mut index = 1;
            let (condition_opcode, condition_value) = match insns.get(index).and_then(|insn| insn.opcode()) {
                Some(opcode @ (IFEQ | IFNE)) => {
                    index += 1;
                    (opcode, None)
                }
                _ => {
                    let value = insns.get(index).and_then(|insn| int_constant(insn));
                    let opcode = insns.get(index + 1).and_then(|insn| insn.opcode());
                    index += 2;
                    match (value, opcode) {
                        (Some(value), Some(opcode)) => (opcode, Some(value)),
                        _ => continue,
                    }
                }
            };
            if insns.get(index).and_then(|insn| insn.opcode()) == Some(ALOAD) {
                index += 1;
            }

            let Some(&call) = found.last() else {
                continue;
            };
            let Some(arguments) = get_argument_expressions(list, call, |_| true)? else {
                continue;
            };
            let argument_ids: Vec<InsnId> = arguments
                .iter()
                .flatten()
                .copied()
                .filter(|id| list.get(*id).is_some_and(|insn| !insn.is_pseudo()))
                .collect();
            if found.get(index..found.len() - 1) != Some(argument_ids.as_slice()) {
                continue;
            }

            let mut const_args = Vec::new();
            let types = MethodType::parse(&member.descriptor)?.arguments;
            for (expression, argument) in arguments.iter().zip(&types) {
                let constant = match expression.as_slice() {
                    [single] => list.get(*single).and_then(int_constant),
                    _ => None,
                };
                const_args.push(constant);
                if argument.size() == 2 {
                    const_args.push(None);
                }
            }

            calls.push(ConditionalCall {
                condition_var: local - receiver,
                condition_opcode,
                condition_value,
                callee,
                const_args,
            });
        }
        self.conditional_calls.entry(parent).or_default().extend(calls);
        Ok(())
    }

    /// Whether `source` and `method` call each other under guards that can only
    /// pass for the dummy value, so `value` never reaches `method` in practice.
    fn is_mutually_recursive_dummy(
        &self,
        method: usize,
        arg: usize,
        source: usize,
        value: i32,
    ) -> Result<bool> {
        let no_calls = Vec::new();
        let from_source = self.conditional_calls.get(&source).unwrap_or(&no_calls);
        let from_method = self.conditional_calls.get(&method).unwrap_or(&no_calls);
        for source_to_method in from_source.iter().filter(|call| call.callee == method) {
            for method_to_source in from_method
                .iter()
                .filter(|call| call.callee == source && call.condition_var == arg)
            {
                if guard_skips_call(method_to_source, value)? {
                    continue;
                }
                let Some(Some(const_arg)) = method_to_source
                    .const_args
                    .get(source_to_method.condition_var)
                else {
                    continue;
                };
                if guard_skips_call(source_to_method, *const_arg)? {
                    continue;
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn union(&self, method: usize, arg: usize) -> Result<Option<BTreeSet<i32>>> {
        let Some(values) = self.arg_values.get(&(method, arg)) else {
            return Ok(None);
        };
        let mut set = BTreeSet::new();
        for (source, value) in values {
            let Some(constants) = value.values() else {
                return Ok(None);
            };
            if *source == method {
                continue;
            }
            if let Some(singleton) = value.singleton() {
                if self.is_mutually_recursive_dummy(method, arg, *source, singleton)? {
                    continue;
                }
            }
            set.extend(constants.iter().copied());
        }
        Ok((!set.is_empty()).then_some(set))
    }
}

/// The guard jumps past the call, so the call does not happen for `value`.
fn guard_skips_call(call: &ConditionalCall, value: i32) -> Result<bool> {
    let result = match call.condition_value {
        Some(condition) => evaluate_binary(
            call.condition_opcode,
            &BTreeSet::from([value]),
            &BTreeSet::from([condition]),
        )?,
        None => evaluate_unary(call.condition_opcode, &BTreeSet::from([value]))?,
    };
    Ok(result == BranchResult::AlwaysTaken)
}

impl Transformer for DummyArgPass {
    fn metadata(&self) -> PassMetadata {
        PassMetadata {
            id: "dummy_arg",
            name: "Dummy arguments",
            description: "Propagates constant integer arguments between methods, folds branches whose outcome is fixed and inlines constant expressions",
            order: 20,
        }
    }

    fn pre_transform(&mut self, classpath: &mut ClassPath) -> Result<()> {
        self.matcher = Some(InsnMatcher::compile(CONDITIONAL_CALL)?);
        let methods = unify_methods(classpath, &self.excluded_methods)?;
        self.partitions = MemberPartitions::from_set(&methods);
        self.seedable.clear();
        for id in 0..self.partitions.len() {
            if is_method_partition_renamable(
                classpath,
                self.partitions.members(id),
                &self.excluded_methods,
            )? {
                self.seedable.insert(id);
            }
        }
        self.const_args.clear();
        self.branches_simplified = 0;
        self.constants_inlined = 0;
        Ok(())
    }

    fn pre_pass(&mut self, _classpath: &mut ClassPath) -> Result<()> {
        self.arg_values.clear();
        self.conditional_calls.clear();
        Ok(())
    }

    fn transform_code(
        &mut self,
        _classpath: &ClassPath,
        owner: &str,
        method: &mut Method,
    ) -> Result<bool> {
        let member = MemberRef::new(owner, &method.name, &method.descriptor);
        let parent = self
            .partitions
            .get(&member)
            .with_context(|| format!("{member} is missing from the method partitions"))?;
        self.record_conditional_calls(parent, method)?;

        let parameters = self.const_args.get(&parent).cloned().unwrap_or_default();
        let interpreter = IntInterpreter::new(self.max_tracked_values).with_parameters(parameters);
        let analysis = analyze(owner, method, &interpreter)?;

        let list = &method.instructions;
        let mut always_taken = Vec::new();
        let mut never_taken = Vec::new();
        let mut const_insns: BTreeMap<InsnId, i32> = BTreeMap::new();
        for (index, (id, insn)) in list.iter().enumerate() {
            let Some(frame) = analysis.frame(index) else {
                continue;
            };
            let result = match insn {
                Insn::Method { member, .. } => {
                    let Some(callee) = self.partitions.get(member) else {
                        continue;
                    };
                    let arguments = MethodType::parse(&member.descriptor)?.arguments.len();
                    let mut slot = 0;
                    for depth in (0..arguments).rev() {
                        let value = frame
                            .peek(depth)
                            .context("invoke argument missing from the operand stack")?;
                        self.arg_values
                            .entry((callee, slot))
                            .or_default()
                            .push((parent, value.clone()));
                        slot += value.size();
                    }
                    continue;
                }
                Insn::Jump {
                    opcode: opcode @ (IFEQ..=IFLE),
                    ..
                } => match frame.peek(0).and_then(IntValue::values) {
                    Some(values) => evaluate_unary(*opcode, values)?,
                    None => continue,
                },
                Insn::Jump {
                    opcode: opcode @ (IF_ICMPEQ..=IF_ICMPLE),
                    ..
                } => match (
                    frame.peek(1).and_then(IntValue::values),
                    frame.peek(0).and_then(IntValue::values),
                ) {
                    (Some(values1), Some(values2)) => evaluate_binary(*opcode, values1, values2)?,
                    _ => continue,
                },
                _ => {
                    if !is_pure(insn, self.purity)
                        || int_constant(insn).is_some()
                        || stack_metadata(insn)?.pushes != 1
                    {
                        continue;
                    }
                    let next = list.next_real(id).and_then(|next| list.index_of(next));
                    let value = next
                        .and_then(|next| analysis.frame(next))
                        .and_then(|frame| frame.peek(0))
                        .and_then(IntValue::singleton);
                    if let Some(value) = value {
                        const_insns.insert(id, value);
                    }
                    continue;
                }
            };
            match result {
                BranchResult::AlwaysTaken => always_taken.push(id),
                BranchResult::NeverTaken => never_taken.push(id),
                BranchResult::Unknown => {}
            }
        }

        let purity = self.purity;
        let pure = |insn: &Insn| is_pure(insn, purity);
        let list = &mut method.instructions;
        let mut changed = false;
        for id in always_taken {
            let Some(Insn::Jump { target, .. }) = list.get(id) else {
                continue;
            };
            let goto = Insn::Jump {
                opcode: GOTO,
                target: *target,
            };
            if replace_expression(list, id, goto, pure)? {
                self.branches_simplified += 1;
                changed = true;
            }
        }
        for id in never_taken {
            if delete_expression(list, id, pure)? {
                self.branches_simplified += 1;
                changed = true;
            }
        }
        for (id, value) in const_insns {
            if !list.contains(id) {
                continue;
            }
            if replace_expression(list, id, create_int_constant(value), pure)? {
                self.constants_inlined += 1;
                changed = true;
            }
        }
        Ok(changed)
    }

    fn post_pass(&mut self, _classpath: &mut ClassPath) -> Result<bool> {
        let mut const_args = BTreeMap::new();
        for &id in &self.seedable {
            let Some(first) = self.partitions.members(id).first() else {
                continue;
            };
            let slots = MethodType::parse(&first.descriptor)?.argument_size();
            let mut parameters = Vec::with_capacity(slots);
            for slot in 0..slots {
                parameters.push(self.union(id, slot)?);
            }
            if parameters.iter().any(Option::is_some) {
                const_args.insert(id, parameters);
            }
        }
        let again = const_args != self.const_args;
        self.const_args = const_args;
        Ok(again)
    }

    fn post_transform(&mut self, _classpath: &mut ClassPath) -> Result<()> {
        info!(
            "Simplified {} dummy branches and inlined {} constants",
            self.branches_simplified, self.constants_inlined
        );
        Ok(())
    }

    fn counters(&self) -> BTreeMap<&'static str, usize> {
        BTreeMap::from([
            ("branches_simplified", self.branches_simplified),
            ("constants_inlined", self.constants_inlined),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AccessFlags, Class, InsnList, LabelId, MemberDesc};
    use crate::library::Library;
    use crate::runtime::RuntimeProvider;
    use crate::transform::run;

    fn static_method(name: &str, descriptor: &str, max_locals: u16, list: InsnList) -> Method {
        Method {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access: AccessFlags::STATIC,
            max_locals,
            instructions: list,
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

    /// `static void callee(int flag) { if (flag != 7) return; work(); }`
    fn callee() -> Method {
        let mut list = InsnList::new();
        let done = list.new_label();
        list.push(Insn::Var { opcode: ILOAD, var: 0 });
        list.push(Insn::Int { opcode: BIPUSH, operand: 7 });
        list.push(Insn::Jump { opcode: IF_ICMPNE, target: done });
        list.push(invoke("work", "()V"));
        list.push(Insn::Label(done));
        list.push(Insn::Simple(RETURN));
        static_method("callee", "(I)V", 1, list)
    }

    fn caller() -> Method {
        let mut list = InsnList::new();
        list.push(Insn::Int { opcode: BIPUSH, operand: 7 });
        list.push(invoke("callee", "(I)V"));
        list.push(Insn::Simple(RETURN));
        static_method("caller", "()V", 0, list)
    }

    fn work() -> Method {
        let mut list = InsnList::new();
        list.push(Insn::Simple(RETURN));
        static_method("work", "()V", 0, list)
    }

    fn classpath(methods: Vec<Method>) -> ClassPath {
        let mut class = Class::new("a", Some("java/lang/Object"));
        class.methods = methods;
        let library: Library = std::iter::once(class).collect();
        ClassPath::new(RuntimeProvider::builtin(), Vec::new(), vec![library]).expect("classpath")
    }

    fn body(classpath: &ClassPath, name: &str, descriptor: &str) -> Vec<Insn> {
        classpath
            .class("a")
            .and_then(|class| class.method(&MemberDesc::new(name, descriptor)))
            .expect("method")
            .instructions
            .iter()
            .map(|(_, insn)| insn.clone())
            .collect()
    }

    #[test]
    fn constant_argument_folds_guard_in_callee() {
        let mut classpath = classpath(vec![callee(), caller(), work()]);
        let mut pass = DummyArgPass::new(&Profile::default());
        let stats = run(&mut pass, &mut classpath).expect("run");
        let body = body(&classpath, "callee", "(I)V");
        assert_eq!(
            body,
            vec![invoke("work", "()V"), Insn::Label(LabelId(0)), Insn::Simple(RETURN)]
        );
        assert_eq!(stats.counters.get("branches_simplified"), Some(&1));
    }

    #[test]
    fn unknown_arguments_leave_guards_alone() {
        let mut list = InsnList::new();
        list.push(Insn::Var { opcode: ILOAD, var: 0 });
        list.push(invoke("callee", "(I)V"));
        list.push(Insn::Simple(RETURN));
        let forwarding = static_method("forward", "(I)V", 1, list);
        let mut classpath = classpath(vec![callee(), caller(), forwarding, work()]);
        let mut pass = DummyArgPass::new(&Profile::default());
        run(&mut pass, &mut classpath).expect("run");
        assert_eq!(body(&classpath, "callee", "(I)V").len(), 6);
    }

    #[test]
    fn local_constant_branches_and_expressions_fold() {
        let mut list = InsnList::new();
        let skip = list.new_label();
        list.push(Insn::Simple(ICONST_2));
        list.push(Insn::Var { opcode: ISTORE, var: 0 });
        list.push(Insn::Var { opcode: ILOAD, var: 0 });
        list.push(Insn::Jump { opcode: IFEQ, target: skip });
        list.push(Insn::Var { opcode: ILOAD, var: 0 });
        list.push(Insn::Simple(ICONST_3));
        list.push(Insn::Simple(IMUL));
        list.push(Insn::Simple(IRETURN));
        list.push(Insn::Label(skip));
        list.push(Insn::Simple(ICONST_0));
        list.push(Insn::Simple(IRETURN));
        let method = static_method("fold", "()I", 1, list);
        let mut classpath = classpath(vec![method]);
        let mut pass = DummyArgPass::new(&Profile::default());
        let stats = run(&mut pass, &mut classpath).expect("run");
        let opcodes: Vec<u8> = body(&classpath, "fold", "()I")
            .iter()
            .filter_map(Insn::opcode)
            .collect();
        assert_eq!(
            opcodes,
            vec![ICONST_2, ISTORE, BIPUSH, IRETURN, ICONST_0, IRETURN]
        );
        assert_eq!(stats.counters.get("branches_simplified"), Some(&1));
        assert!(stats.counters.get("constants_inlined").is_some_and(|count| *count >= 1));
    }

    #[test]
    fn guarded_calls_record_constant_arguments() {
        let mut list = InsnList::new();
        let skip = list.new_label();
        list.push(Insn::Var { opcode: ILOAD, var: 0 });
        list.push(Insn::Jump { opcode: IFEQ, target: skip });
        list.push(Insn::Simple(ACONST_NULL));
        list.push(Insn::Type {
            opcode: CHECKCAST,
            class: "java/lang/String".to_string(),
        });
        list.push(Insn::Int { opcode: BIPUSH, operand: 9 });
        list.push(Insn::Simple(DCONST_0));
        list.push(invoke("target", "(Ljava/lang/String;ID)V"));
        list.push(Insn::Label(skip));
        list.push(Insn::Simple(RETURN));
        let guarded = static_method("guarded", "(I)V", 1, list);
        let mut body = InsnList::new();
        body.push(Insn::Simple(RETURN));
        let target = static_method("target", "(Ljava/lang/String;ID)V", 4, body);

        let mut classpath = classpath(vec![guarded.clone(), target]);
        let mut pass = DummyArgPass::new(&Profile::default());
        pass.pre_transform(&mut classpath).expect("pre-transform");
        let parent = pass
            .partitions
            .get(&MemberRef::new("a", "guarded", "(I)V"))
            .expect("partition");
        pass.record_conditional_calls(parent, &guarded).expect("record");

        let calls = &pass.conditional_calls[&parent];
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].condition_opcode, IFEQ);
        assert_eq!(calls[0].condition_value, None);
        assert_eq!(calls[0].const_args, vec![None, Some(9), None, None]);
    }

    #[test]
    fn guards_evaluate_single_values() {
        let call = ConditionalCall {
            condition_var: 0,
            condition_opcode: IF_ICMPNE,
            condition_value: Some(7),
            callee: 0,
            const_args: vec![Some(1)],
        };
        assert!(guard_skips_call(&call, 3).expect("evaluate"));
        assert!(!guard_skips_call(&call, 7).expect("evaluate"));
        let unary = ConditionalCall {
            condition_opcode: IFEQ,
            condition_value: None,
            ..call
        };
        assert!(guard_skips_call(&unary, 0).expect("evaluate"));
    }

    #[test]
    fn mutually_recursive_dummy_values_are_ignored() {
        let mut pass = DummyArgPass::new(&Profile::default());
        // Partition 0 calls 1 with 5 unless its parameter is 0; partition 1
        // calls 0 with 1 only when its parameter is 5.
        pass.conditional_calls.insert(
            0,
            vec![ConditionalCall {
                condition_var: 0,
                condition_opcode: IFEQ,
                condition_value: None,
                callee: 1,
                const_args: vec![Some(5)],
            }],
        );
        pass.conditional_calls.insert(
            1,
            vec![ConditionalCall {
                condition_var: 0,
                condition_opcode: IF_ICMPNE,
                condition_value: Some(5),
                callee: 0,
                const_args: vec![Some(1)],
            }],
        );
        assert!(pass.is_mutually_recursive_dummy(1, 0, 0, 5).expect("check"));
        assert!(!pass.is_mutually_recursive_dummy(1, 0, 0, 3).expect("check"));
    }
}

//! Fixed-point driver for bytecode transformation passes.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::debug;

use crate::classpath::ClassPath;
use crate::ir::{Class, Field, InsnList, MemberDesc, Method};
use crate::passes::PassMetadata;
use crate::telemetry::{Telemetry, record_pass, with_span};

/// A transformation pass. Every hook defaults to a no-op.
///
/// Element hooks receive shared access to the class path and exclusive access
/// to one element, and return whether they changed anything. While
/// `transform_class` runs, the class is detached from its library and cannot be
/// resolved through the class path. While a method hook runs, its owner stays
/// resolvable but the method's instructions are only visible through the hook's
/// argument.
pub(crate) trait Transformer {
    fn metadata(&self) -> PassMetadata;

    fn pre_transform(&mut self, _classpath: &mut ClassPath) -> Result<()> {
        Ok(())
    }

    fn pre_pass(&mut self, _classpath: &mut ClassPath) -> Result<()> {
        Ok(())
    }

    fn transform_class(&mut self, _classpath: &ClassPath, _class: &mut Class) -> Result<bool> {
        Ok(false)
    }

    fn transform_field(
        &mut self,
        _classpath: &ClassPath,
        _owner: &str,
        _field: &mut Field,
    ) -> Result<bool> {
        Ok(false)
    }

    fn pre_transform_method(
        &mut self,
        _classpath: &ClassPath,
        _owner: &str,
        _method: &mut Method,
    ) -> Result<bool> {
        Ok(false)
    }

    /// Only called for methods with a body.
    fn transform_code(
        &mut self,
        _classpath: &ClassPath,
        _owner: &str,
        _method: &mut Method,
    ) -> Result<bool> {
        Ok(false)
    }

    fn post_transform_method(
        &mut self,
        _classpath: &ClassPath,
        _owner: &str,
        _method: &mut Method,
    ) -> Result<bool> {
        Ok(false)
    }

    /// Returns true when state gathered during the pass needs another
    /// iteration even if no element changed.
    fn post_pass(&mut self, _classpath: &mut ClassPath) -> Result<bool> {
        Ok(false)
    }

    fn post_transform(&mut self, _classpath: &mut ClassPath) -> Result<()> {
        Ok(())
    }

    /// Named totals reported once the pass finishes.
    fn counters(&self) -> BTreeMap<&'static str, usize> {
        BTreeMap::new()
    }
}

/// Outcome of one pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub(crate) struct TransformStats {
    pub(crate) pass: String,
    pub(crate) iterations: usize,
    /// Element hooks that reported a change.
    pub(crate) changes: usize,
    pub(crate) counters: BTreeMap<String, usize>,
}

/// Run `transformer` to a fixed point over every library class.
pub(crate) fn run(transformer: &mut dyn Transformer, classpath: &mut ClassPath) -> Result<TransformStats> {
    let metadata = transformer.metadata();
    let id = metadata.id;
    debug!(pass = id, "{}: {}", metadata.name, metadata.description);
    let mut stats = TransformStats {
        pass: id.to_string(),
        ..TransformStats::default()
    };

    transformer
        .pre_transform(classpath)
        .with_context(|| format!("{id}: pre-transform"))?;
    loop {
        stats.iterations += 1;
        transformer
            .pre_pass(classpath)
            .with_context(|| format!("{id}: pre-pass"))?;
        let mut changes = 0;
        for library in 0..classpath.libraries().len() {
            for name in classpath.libraries()[library].names() {
                changes += visit_class(transformer, classpath, library, &name)
                    .with_context(|| format!("{id}: transform {name}"))?;
            }
        }
        let again = transformer
            .post_pass(classpath)
            .with_context(|| format!("{id}: post-pass"))?;
        debug!(pass = id, iteration = stats.iterations, changes, again, "pass iteration finished");
        stats.changes += changes;
        if changes == 0 && !again {
            break;
        }
    }
    transformer
        .post_transform(classpath)
        .with_context(|| format!("{id}: post-transform"))?;

    stats.counters = transformer
        .counters()
        .into_iter()
        .map(|(name, count)| (name.to_string(), count))
        .collect();
    Ok(stats)
}

/// Run each pass in turn, one telemetry span per pass.
pub(crate) fn run_all(
    transformers: &mut [Box<dyn Transformer>],
    classpath: &mut ClassPath,
    telemetry: Option<&Telemetry>,
) -> Result<Vec<TransformStats>> {
    let mut results = Vec::with_capacity(transformers.len());
    for transformer in transformers.iter_mut() {
        let id = transformer.metadata().id;
        let attributes = [KeyValue::new("jdeob.pass_id", id)];
        let stats = with_span(telemetry, &format!("pass:{id}"), &attributes, || {
            let stats = run(transformer.as_mut(), classpath)?;
            record_pass(&stats);
            Ok::<_, anyhow::Error>(stats)
        })?;
        results.push(stats);
    }
    Ok(results)
}

fn visit_class(
    transformer: &mut dyn Transformer,
    classpath: &mut ClassPath,
    library: usize,
    name: &str,
) -> Result<usize> {
    let Some(mut class) = classpath.detach(library, name) else {
        return Ok(0);
    };
    let changed = transformer.transform_class(classpath, &mut class);
    let name = class.name.clone();
    let fields: Vec<MemberDesc> = class.fields.iter().map(Field::desc).collect();
    let methods: Vec<MemberDesc> = class.methods.iter().map(Method::desc).collect();
    classpath.attach(library, class);
    let mut changes = usize::from(changed?);

    for desc in fields {
        let Some(mut field) = classpath
            .libraries()
            .get(library)
            .and_then(|library| library.get(&name))
            .and_then(|class| class.field(&desc))
            .cloned()
        else {
            continue;
        };
        let changed = transformer.transform_field(classpath, &name, &mut field)?;
        if let Some(slot) = field_slot(classpath, library, &name, &desc) {
            *slot = field;
        }
        changes += usize::from(changed);
    }

    for desc in methods {
        let Some(mut method) = take_method(classpath, library, &name, &desc) else {
            continue;
        };
        let result = visit_method(transformer, classpath, &name, &mut method);
        if let Some(class) = classpath
            .library_mut(library)
            .and_then(|library| library.get_mut(&name))
        {
            if let Some(slot) = class.method_mut(&desc) {
                *slot = method;
            }
        }
        changes += result
            .with_context(|| format!("method {}{}", desc.name, desc.descriptor))?;
    }
    Ok(changes)
}

fn visit_method(
    transformer: &mut dyn Transformer,
    classpath: &ClassPath,
    owner: &str,
    method: &mut Method,
) -> Result<usize> {
    let mut changes = usize::from(transformer.pre_transform_method(classpath, owner, method)?);
    if method.has_code() {
        changes += usize::from(transformer.transform_code(classpath, owner, method)?);
    }
    changes += usize::from(transformer.post_transform_method(classpath, owner, method)?);
    Ok(changes)
}

fn field_slot<'a>(
    classpath: &'a mut ClassPath,
    library: usize,
    owner: &str,
    desc: &MemberDesc,
) -> Option<&'a mut Field> {
    classpath
        .library_mut(library)?
        .get_mut(owner)?
        .fields
        .iter_mut()
        .find(|field| field.desc() == *desc)
}

/// Swap the method for a body-less copy of its header so its owner keeps
/// answering metadata queries while a hook edits the real method.
fn take_method(
    classpath: &mut ClassPath,
    library: usize,
    owner: &str,
    desc: &MemberDesc,
) -> Option<Method> {
    let slot = classpath
        .library_mut(library)?
        .get_mut(owner)?
        .method_mut(desc)?;
    let header = Method {
        name: slot.name.clone(),
        descriptor: slot.descriptor.clone(),
        access: slot.access,
        max_locals: slot.max_locals,
        instructions: InsnList::new(),
        try_catch_blocks: Vec::new(),
    };
    Some(std::mem::replace(slot, header))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AccessFlags, Insn};
    use crate::library::Library;
    use crate::opcodes::*;
    use crate::runtime::RuntimeProvider;

    /// Deletes one `nop` per code visit and records the hook order.
    #[derive(Default)]
    struct NopStripper {
        log: Vec<String>,
        removed: usize,
    }

    impl Transformer for NopStripper {
        fn metadata(&self) -> PassMetadata {
            PassMetadata {
                id: "nop_stripper",
                name: "Nop stripper",
                description: "test pass",
                order: 0,
            }
        }

        fn pre_transform(&mut self, _classpath: &mut ClassPath) -> Result<()> {
            self.log.push("pre_transform".to_string());
            Ok(())
        }

        fn pre_pass(&mut self, _classpath: &mut ClassPath) -> Result<()> {
            self.log.push("pre_pass".to_string());
            Ok(())
        }

        fn transform_class(&mut self, classpath: &ClassPath, class: &mut Class) -> Result<bool> {
            assert!(classpath.class(&class.name).is_none(), "class must be detached");
            self.log.push(format!("class {}", class.name));
            Ok(false)
        }

        fn transform_field(
            &mut self,
            _classpath: &ClassPath,
            owner: &str,
            field: &mut Field,
        ) -> Result<bool> {
            self.log.push(format!("field {owner}.{}", field.name));
            Ok(false)
        }

        fn transform_code(
            &mut self,
            classpath: &ClassPath,
            owner: &str,
            method: &mut Method,
        ) -> Result<bool> {
            let header = classpath
                .class(owner)
                .and_then(|class| class.method(&method.desc()))
                .expect("owner stays resolvable");
            assert!(header.instructions.ids().is_empty());
            self.log.push(format!("code {owner}.{}", method.name));
            let nop = method
                .instructions
                .iter()
                .find(|(_, insn)| **insn == Insn::Simple(NOP))
                .map(|(id, _)| id);
            match nop {
                Some(id) => {
                    method.instructions.remove(id);
                    self.removed += 1;
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        fn post_pass(&mut self, _classpath: &mut ClassPath) -> Result<bool> {
            self.log.push("post_pass".to_string());
            Ok(false)
        }

        fn post_transform(&mut self, _classpath: &mut ClassPath) -> Result<()> {
            self.log.push("post_transform".to_string());
            Ok(())
        }

        fn counters(&self) -> BTreeMap<&'static str, usize> {
            BTreeMap::from([("nops_removed", self.removed)])
        }
    }

    fn method(name: &str, access: AccessFlags, body: &[u8]) -> Method {
        let mut instructions = InsnList::new();
        for opcode in body {
            instructions.push(Insn::Simple(*opcode));
        }
        Method {
            name: name.to_string(),
            descriptor: "()V".to_string(),
            access,
            max_locals: 1,
            instructions,
            try_catch_blocks: Vec::new(),
        }
    }

    fn classpath() -> ClassPath {
        let mut b = Class::new("B", Some("java/lang/Object"));
        b.methods.push(method("run", AccessFlags::PUBLIC, &[NOP, NOP, RETURN]));
        b.methods.push(method("stub", AccessFlags::NATIVE, &[]));
        let mut a = Class::new("A", Some("java/lang/Object"));
        a.fields.push(Field {
            name: "f".to_string(),
            descriptor: "I".to_string(),
            access: AccessFlags::empty(),
        });
        let library: Library = vec![b, a].into_iter().collect();
        ClassPath::new(RuntimeProvider::builtin(), Vec::new(), vec![library]).expect("classpath")
    }

    #[test]
    fn driver_repeats_until_no_hook_reports_a_change() {
        let mut classpath = classpath();
        let mut pass = NopStripper::default();
        let stats = run(&mut pass, &mut classpath).expect("run");
        assert_eq!(stats.iterations, 3);
        assert_eq!(stats.changes, 2);
        assert_eq!(stats.counters.get("nops_removed"), Some(&2));
        let body = &classpath
            .class("B")
            .and_then(|class| class.method(&MemberDesc::new("run", "()V")))
            .expect("method")
            .instructions;
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn hooks_run_in_declaration_order_classes_by_name() {
        let mut classpath = classpath();
        let mut pass = NopStripper::default();
        run(&mut pass, &mut classpath).expect("run");
        let first_iteration: Vec<&str> = pass.log.iter().take(6).map(String::as_str).collect();
        assert_eq!(
            first_iteration,
            vec!["pre_transform", "pre_pass", "class A", "field A.f", "class B", "code B.run"]
        );
        assert_eq!(pass.log.last().map(String::as_str), Some("post_transform"));
        assert!(!pass.log.iter().any(|entry| entry == "code B.stub"));
    }

    #[test]
    fn run_all_collects_stats_per_pass() {
        let mut classpath = classpath();
        let mut passes: Vec<Box<dyn Transformer>> = vec![Box::new(NopStripper::default())];
        let stats = run_all(&mut passes, &mut classpath, None).expect("run");
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].pass, "nop_stripper");
    }
}

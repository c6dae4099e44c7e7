use crate::config::Profile;
use crate::transform::Transformer;

// Pass modules are auto-discovered by build.rs; do not edit manually.
include!(concat!(env!("OUT_DIR"), "/pass_modules.rs"));

/// Metadata describing a transformation pass.
#[derive(Clone, Debug)]
pub(crate) struct PassMetadata {
    pub(crate) id: &'static str,
    pub(crate) name: &'static str,
    pub(crate) description: &'static str,
    /// Passes run in ascending order, ties broken by id.
    pub(crate) order: u32,
}

/// Wrapper struct for pass factory functions to enable inventory collection.
pub(crate) struct PassFactory(pub fn(&Profile) -> Box<dyn Transformer>);

inventory::collect!(PassFactory);

/// Macro to register a pass implementation.
///
/// Usage: `register_pass!(PassName);`, where `PassName::new(&Profile)` builds
/// the pass.
#[macro_export]
macro_rules! register_pass {
    ($pass_type:ty) => {
        inventory::submit! {
            $crate::passes::PassFactory(|profile| Box::new(<$pass_type>::new(profile)))
        }
    };
}

/// Returns every registered pass in execution order.
pub(crate) fn all_passes(profile: &Profile) -> Vec<Box<dyn Transformer>> {
    let mut passes: Vec<Box<dyn Transformer>> = inventory::iter::<PassFactory>
        .into_iter()
        .map(|factory| (factory.0)(profile))
        .collect();
    passes.sort_by_key(|pass| {
        let metadata = pass.metadata();
        (metadata.order, metadata.id)
    });
    passes
}

/// Registered passes the profile enables, in execution order.
pub(crate) fn enabled_passes(profile: &Profile) -> Vec<Box<dyn Transformer>> {
    all_passes(profile)
        .into_iter()
        .filter(|pass| profile.pass_enabled(pass.metadata().id))
        .collect()
}

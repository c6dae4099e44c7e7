use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::dataflow::int_value::DEFAULT_MAX_TRACKED_VALUES;
use crate::expr::PurityPolicy;

/// Deobfuscation profile for one client build.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct Profile {
    /// Classes that keep their names.
    pub(crate) excluded_classes: BTreeSet<String>,
    /// Method names that are never renamed or have arguments removed.
    pub(crate) excluded_methods: BTreeSet<String>,
    /// Field names that are never renamed.
    pub(crate) excluded_fields: BTreeSet<String>,
    /// Names up to this length are assumed to be obfuscated.
    pub(crate) max_obfuscated_name_len: usize,
    pub(crate) max_tracked_int_values: usize,
    /// Whether `idiv`/`irem` (and the wide forms) may be deleted as dead code.
    pub(crate) division_is_pure: bool,
    /// Pass ids to run; empty runs every registered pass.
    pub(crate) passes: Vec<String>,
    /// Explicit renames, keyed by class name, `owner.name descriptor` for
    /// members.
    pub(crate) name_map: BTreeMap<String, String>,
}

impl Default for Profile {
    fn default() -> Self {
        let set = |names: &[&str]| names.iter().map(|name| name.to_string()).collect();
        Self {
            excluded_classes: set(&[
                "client",
                "jagex3/jagmisc/jagmisc",
                "loader",
                "unpack",
                "unpackclass",
            ]),
            excluded_methods: set(&["<clinit>", "<init>", "main", "providesignlink", "quit"]),
            excluded_fields: set(&["cache"]),
            max_obfuscated_name_len: 2,
            max_tracked_int_values: DEFAULT_MAX_TRACKED_VALUES,
            division_is_pure: true,
            passes: Vec::new(),
            name_map: BTreeMap::new(),
        }
    }
}

impl Profile {
    pub(crate) fn load(path: &Path) -> Result<Profile> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read profile {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("invalid profile {}", path.display()))
    }

    pub(crate) fn parse(contents: &str) -> Result<Profile> {
        let deserializer = &mut serde_json::Deserializer::from_str(contents);
        let profile: Profile = serde_path_to_error::deserialize(deserializer)
            .map_err(|err| anyhow::anyhow!("{}: {}", err.path(), err.inner()))?;
        if profile.max_tracked_int_values == 0 {
            anyhow::bail!("max_tracked_int_values must be at least 1");
        }
        Ok(profile)
    }

    pub(crate) fn purity(&self) -> PurityPolicy {
        PurityPolicy {
            division_is_pure: self.division_is_pure,
        }
    }

    pub(crate) fn pass_enabled(&self, id: &str) -> bool {
        self.passes.is_empty() || self.passes.iter().any(|pass| pass == id)
    }
}

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Every directory under `src/passes/` that holds a `mod.rs` is a pass module.
fn pass_modules(passes_dir: &Path) -> Vec<(String, PathBuf)> {
    let entries = fs::read_dir(passes_dir)
        .unwrap_or_else(|err| panic!("read {}: {err}", passes_dir.display()));
    let mut modules: Vec<(String, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path().join("mod.rs"))
        .filter(|module| module.is_file())
        .filter_map(|module| {
            let name = module.parent()?.file_name()?.to_str()?.to_string();
            Some((name, module))
        })
        .collect();
    modules.sort();
    modules
}

fn main() {
    println!("cargo:rerun-if-changed=src/passes/");

    let manifest_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR is set by cargo");
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR is set by cargo");

    let mut content = String::new();
    for (name, module) in pass_modules(&Path::new(&manifest_dir).join("src/passes")) {
        content.push_str(&format!("#[path = {module:?}]\npub(crate) mod {name};\n"));
    }
    fs::write(Path::new(&out_dir).join("pass_modules.rs"), content)
        .expect("write pass_modules.rs");
}

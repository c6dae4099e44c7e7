mod classpath;
mod config;
mod dataflow;
mod descriptor;
mod disjoint_set;
mod error;
mod expr;
mod ir;
mod library;
mod matcher;
mod opcodes;
mod passes;
mod remap;
mod runtime;
mod scan;
mod stack;
mod telemetry;
#[cfg(test)]
mod test_harness;
mod transform;
mod unifier;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::info;

use crate::classpath::ClassPath;
use crate::config::Profile;
use crate::passes::enabled_passes;
use crate::remap::{NameTable, SuspiciousMapping, TypedRemapper, verify};
use crate::runtime::RuntimeProvider;
use crate::scan::{load_inputs, load_library};
use crate::telemetry::{Telemetry, init_logging, with_span};
use crate::transform::{TransformStats, run_all};
use crate::unifier::{unify_fields, unify_methods};

/// CLI arguments for jdeob execution.
#[derive(Parser, Debug)]
#[command(
    name = "jdeob",
    about = "Deobfuscates JVM class files and JAR files and derives a type-aware rename table.",
    version
)]
struct Cli {
    /// Class file, class directory or jar to transform. Each one is a library.
    #[arg(long, value_name = "PATH", required = true)]
    input: Vec<PathBuf>,
    /// Read-only library the inputs link against.
    #[arg(long, value_name = "PATH")]
    dependency: Vec<PathBuf>,
    /// Runtime classes layered over the built-in platform table.
    #[arg(long, value_name = "PATH")]
    runtime: Option<PathBuf>,
    /// JSON deobfuscation profile.
    #[arg(long, value_name = "PATH")]
    profile: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
    /// OTLP/HTTP endpoint for trace export.
    #[arg(long, value_name = "URL")]
    otel: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if !cli.quiet {
        init_logging();
    }
    let telemetry = cli
        .otel
        .as_ref()
        .map(|endpoint| Telemetry::new(endpoint))
        .transpose()?;
    let result = run(&cli, telemetry.as_ref());
    if let Some(telemetry) = &telemetry {
        telemetry.shutdown()?;
    }
    result
}

fn run(cli: &Cli, telemetry: Option<&Telemetry>) -> Result<()> {
    for input in &cli.input {
        if !input.exists() {
            anyhow::bail!("input not found: {}", input.display());
        }
    }
    for entry in &cli.dependency {
        if !entry.exists() {
            anyhow::bail!("dependency not found: {}", entry.display());
        }
    }
    let profile = match &cli.profile {
        Some(path) => Profile::load(path)?,
        None => Profile::default(),
    };

    let started_at = Instant::now();
    let report = with_span(telemetry, "jdeob.run", &[], || {
        deobfuscate(
            &cli.input,
            &cli.dependency,
            cli.runtime.as_deref(),
            &profile,
            telemetry,
        )
    })?;

    let mut writer = output_writer(cli.output.as_deref())?;
    serde_json::to_writer_pretty(&mut writer, &report).context("failed to serialize report")?;
    writer.write_all(b"\n").context("failed to write report")?;

    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} load_ms={} classes={} renamed_classes={}",
            started_at.elapsed().as_millis(),
            report.load_ms,
            report.class_count,
            report.names.classes.len()
        );
    }

    Ok(())
}

fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(
            File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Ok(Box::new(io::stdout())),
    }
}

/// Everything a run produces.
#[derive(Debug, Serialize)]
struct Report {
    class_count: usize,
    #[serde(skip)]
    load_ms: u128,
    passes: Vec<TransformStats>,
    names: NameTable,
    warnings: Vec<SuspiciousMapping>,
}

/// Load, run the enabled passes to their fixed points, then name what is left.
fn deobfuscate(
    inputs: &[PathBuf],
    dependencies: &[PathBuf],
    runtime: Option<&Path>,
    profile: &Profile,
    telemetry: Option<&Telemetry>,
) -> Result<Report> {
    let load_started_at = Instant::now();
    let loaded = with_span(telemetry, "phase:load", &[], || {
        load_inputs(inputs, dependencies, telemetry)
    })?;
    let mut provider = RuntimeProvider::builtin();
    if let Some(path) = runtime {
        let library = load_library(path, telemetry)
            .with_context(|| format!("failed to load runtime {}", path.display()))?;
        provider = provider.with_library(&library);
    }
    let class_count: usize = loaded.libraries.iter().map(|library| library.len()).sum();
    let mut classpath = ClassPath::new(provider, loaded.dependencies, loaded.libraries)?;
    let resolved = classpath.warm_cache()?;
    let load_ms = load_started_at.elapsed().as_millis();
    info!("Loaded {class_count} classes ({resolved} resolved with supertypes)");

    let mut passes = enabled_passes(profile);
    let stats = run_all(&mut passes, &mut classpath, telemetry)?;

    let attributes = [KeyValue::new("jdeob.class_count", class_count as i64)];
    let names = with_span(telemetry, "phase:remap", &attributes, || -> Result<NameTable> {
        let fields = unify_fields(&classpath, &profile.excluded_fields)?;
        let methods = unify_methods(&classpath, &profile.excluded_methods)?;
        TypedRemapper::build(&classpath, &fields, &methods, profile)
    })?;
    info!(
        "Mapped {} classes, {} fields and {} methods",
        names.classes.len(),
        names.fields.len(),
        names.methods.len()
    );
    let warnings = verify(&names, profile.max_obfuscated_name_len);

    Ok(Report {
        class_count,
        load_ms,
        passes: stats,
        names,
        warnings,
    })
}

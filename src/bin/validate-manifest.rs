use anyhow::{Context, Result};
use clap::Parser;
use jsonschema::JSONSchema;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use analytics_pipeline::constants::MANIFEST_FILE;

/// Check Silver manifests against the manifest v1 schema.
#[derive(Parser, Debug)]
#[command(name = "validate-manifest", version, about = "Validate Silver manifests against their schema")]
struct Cli {
    /// manifest.json files, partition directories, or a Silver root holding partitions
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Schema file
    #[arg(long, default_value = "schemas/silver_manifest.v1.json")]
    schema: PathBuf,
}

fn load_json(path: &Path) -> Result<Value> {
    let data = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("Failed to parse JSON in {}", path.display()))
}

/// Expand one argument into the manifest files it names
fn manifests_under(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }
    let own = path.join(MANIFEST_FILE);
    if own.is_file() {
        return Ok(vec![own]);
    }
    let mut found: Vec<PathBuf> = fs::read_dir(path)
        .with_context(|| format!("Failed to list {}", path.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| !p.file_name().map(|n| n.to_string_lossy().starts_with('.')).unwrap_or(true))
        .map(|p| p.join(MANIFEST_FILE))
        .filter(|p| p.is_file())
        .collect();
    found.sort();
    Ok(found)
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // jsonschema 0.17 borrows the schema for 'static; leak it for the process lifetime
    let schema: &'static Value = Box::leak(Box::new(load_json(&args.schema)?));
    let compiled = JSONSchema::options()
        .compile(schema)
        .context("Failed to compile JSON Schema")?;

    let mut manifests = Vec::new();
    for path in &args.paths {
        manifests.extend(manifests_under(path)?);
    }
    if manifests.is_empty() {
        anyhow::bail!("no manifest found");
    }

    let mut invalid = 0;
    for manifest in &manifests {
        let instance = load_json(manifest)?;
        let result = compiled.validate(&instance);
        match result {
            Ok(()) => println!("valid\t{}", manifest.display()),
            Err(errors) => {
                invalid += 1;
                eprintln!("invalid\t{}", manifest.display());
                for error in errors {
                    eprintln!("  - {} at {}", error, error.instance_path);
                }
            }
        }
    }

    if invalid > 0 {
        eprintln!("{} of {} manifests invalid", invalid, manifests.len());
        std::process::exit(1);
    }
    Ok(())
}

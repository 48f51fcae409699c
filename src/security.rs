use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::artifact::BuildReport;
use crate::tree::{sha256_file, tree_digest};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Bom {
    bom_format: &'static str,
    spec_version: &'static str,
    version: u32,
    metadata: BomMetadata,
    components: Vec<Component>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BomMetadata {
    timestamp: String,
    tools: Vec<Tool>,
    component: Component,
}

#[derive(Debug, Serialize)]
struct Tool {
    name: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct Component {
    #[serde(rename = "type")]
    component_type: &'static str,
    name: String,
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    purl: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    hashes: Vec<Hash>,
}

#[derive(Debug, Serialize)]
struct Hash {
    alg: &'static str,
    content: String,
}

fn sha256(content: &str) -> Vec<Hash> {
    vec![Hash {
        alg: "SHA-256",
        content: content.trim_start_matches("sha256:").to_string(),
    }]
}

/// Write a CycloneDX SBOM for the artifact in `artifact_dir`, listing the
/// interpreter, base layer and every installed package.
pub fn generate_sbom(artifact_dir: &Path, output: &Path) -> Result<()> {
    let report = BuildReport::load(artifact_dir)
        .with_context(|| format!("Failed to load build report from {}", artifact_dir.display()))?;
    write_sbom(&report, output)
}

fn write_sbom(report: &BuildReport, output: &Path) -> Result<()> {
    let timestamp = chrono::Utc::now().to_rfc3339();
    let mut components = vec![
        Component {
            component_type: "application",
            name: report.interpreter.name.clone(),
            version: Some(report.interpreter.version.clone()),
            purl: None,
            hashes: Vec::new(),
        },
        Component {
            component_type: "container",
            name: report
                .base
                .split_once('@')
                .map(|(name, _)| name.to_string())
                .unwrap_or_else(|| report.base.clone()),
            version: None,
            purl: None,
            hashes: report
                .base
                .split_once('@')
                .map(|(_, digest)| sha256(digest))
                .unwrap_or_default(),
        },
    ];

    for package in &report.packages {
        components.push(Component {
            component_type: "library",
            name: package.name.clone(),
            version: Some(package.version.to_string()),
            purl: Some(format!(
                "pkg:pypi/{name}@{version}",
                name = package.name,
                version = package.version
            )),
            hashes: sha256(&package.digest),
        });
    }

    let bom = Bom {
        bom_format: "CycloneDX",
        spec_version: "1.5",
        version: 1,
        metadata: BomMetadata {
            timestamp,
            tools: vec![Tool {
                name: "slimstage",
                version: env!("CARGO_PKG_VERSION"),
            }],
            component: Component {
                component_type: "container",
                name: report.artifact_id.clone(),
                version: None,
                purl: None,
                hashes: sha256(&report.artifact_id),
            },
        },
        components,
    };

    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create SBOM directory: {}", parent.display()))?;
    }

    let file = File::create(output)
        .with_context(|| format!("Failed to create SBOM file: {}", output.display()))?;
    serde_json::to_writer_pretty(file, &bom)
        .with_context(|| format!("Failed to write SBOM JSON: {}", output.display()))?;

    Ok(())
}

/// SHA256 of a file, or the tree digest when `path` is a directory.
pub fn compute_sha256(path: &Path) -> Result<String> {
    if path.is_dir() {
        return tree_digest(path)
            .with_context(|| format!("Failed to hash directory: {}", path.display()));
    }
    sha256_file(path).with_context(|| format!("Failed to open file for hashing: {}", path.display()))
}

/// Write the SHA256 digest of `path` into the `output` file.
pub fn write_sha256(path: &Path, output: &Path) -> Result<String> {
    let digest = compute_sha256(path)?;
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create digest directory: {}", parent.display()))?;
    }
    let mut file = File::create(output)
        .with_context(|| format!("Failed to create digest file: {}", output.display()))?;
    writeln!(file, "{}  {}", digest, path.display()).with_context(|| {
        format!(
            "Failed to write digest for '{}' into '{}'.",
            path.display(),
            output.display()
        )
    })?;
    Ok(digest)
}

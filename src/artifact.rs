//! On-disk form of a runtime artifact: root filesystem, deterministic layer
//! archive, runtime config, build report and content-addressed identifier.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tar::{Builder, EntryType, Header};
use tracing::{debug, info};

use crate::audit::{AuditReport, audit_artifact};
use crate::error::{BuildError, BuildResult};
use crate::identity::{ExecutionIdentity, OwnershipTable};
use crate::invoke::{DeclaredArtifact, RuntimeConfig};
use crate::recipe::InterpreterSpec;
use crate::resolver::ResolvedPackage;
use crate::tree::{EntryKind, PRIVILEGE_BITS, scan_tree, sha256_file};

pub const ROOTFS_DIR: &str = "rootfs";
pub const LAYER_FILE: &str = "layer.tar";
pub const CONFIG_FILE: &str = "config.json";
pub const REPORT_FILE: &str = "build-report.json";
pub const DIGEST_FILE: &str = "artifact.digest";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    pub artifact_id: String,
    pub base: String,
    pub interpreter: InterpreterReport,
    pub identity: IdentityReport,
    pub cmd: Vec<String>,
    pub packages: Vec<ResolvedPackage>,
    pub declared: Vec<String>,
    #[serde(default)]
    pub build_tools: Vec<String>,
    pub environment_digest: String,
    pub layer_digest: String,
    pub files_copied: usize,
    #[serde(default)]
    pub stripped: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpreterReport {
    pub name: String,
    pub version: String,
}

impl From<&InterpreterSpec> for InterpreterReport {
    fn from(spec: &InterpreterSpec) -> Self {
        Self {
            name: spec.name.clone(),
            version: spec.version.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityReport {
    pub user: String,
    pub uid: u32,
    pub gid: u32,
}

impl From<&ExecutionIdentity> for IdentityReport {
    fn from(identity: &ExecutionIdentity) -> Self {
        Self {
            user: identity.user().to_string(),
            uid: identity.uid(),
            gid: identity.gid(),
        }
    }
}

impl BuildReport {
    pub fn load(dir: &Path) -> BuildResult<Self> {
        read_json(&dir.join(REPORT_FILE))
    }
}

pub fn load_config(dir: &Path) -> BuildResult<RuntimeConfig> {
    read_json(&dir.join(CONFIG_FILE))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> BuildResult<T> {
    let content = fs::read(path)
        .map_err(|err| BuildError::io(format!("Failed to read {}", path.display()), err))?;
    serde_json::from_slice(&content).map_err(|err| {
        BuildError::Configuration(format!("Failed to parse {}: {err}", path.display()))
    })
}

/// Everything written for one finished build.
#[derive(Debug, Clone)]
pub struct RuntimeArtifact {
    pub dir: PathBuf,
    pub artifact_id: String,
    pub config: RuntimeConfig,
    pub report: BuildReport,
}

/// Write the layer archive, config, report and identifier next to the
/// root filesystem in `dir`.
pub fn write_artifact(declared: &DeclaredArtifact, dir: &Path) -> BuildResult<RuntimeArtifact> {
    let owned = &declared.owned;
    let image = &owned.image;

    let layer_path = dir.join(LAYER_FILE);
    let layer_digest = write_layer(&image.rootfs, &owned.ownership, &layer_path)?;
    let config_bytes = declared.config.to_json()?;
    write_file(&dir.join(CONFIG_FILE), &config_bytes)?;

    let artifact_id = artifact_id(&layer_digest, &config_bytes);
    let report = BuildReport {
        artifact_id: artifact_id.clone(),
        base: image.base.to_string(),
        interpreter: InterpreterReport::from(&image.interpreter),
        identity: IdentityReport::from(&owned.identity),
        cmd: declared.config.cmd().to_vec(),
        packages: image.packages.clone(),
        declared: image.declared.clone(),
        build_tools: image.build_tools.clone(),
        environment_digest: image.environment_digest.clone(),
        layer_digest,
        files_copied: image.files_copied,
        stripped: image.stripped.clone(),
    };
    let mut report_bytes = serde_json::to_vec_pretty(&report)
        .map_err(|err| BuildError::Assembly(format!("Failed to serialize build report: {err}")))?;
    report_bytes.push(b'\n');
    write_file(&dir.join(REPORT_FILE), &report_bytes)?;
    write_file(&dir.join(DIGEST_FILE), format!("{artifact_id}\n").as_bytes())?;

    info!(artifact = %artifact_id, layer = %layer_path.display(), "Artifact written");
    Ok(RuntimeArtifact {
        dir: dir.to_path_buf(),
        artifact_id,
        config: declared.config.clone(),
        report,
    })
}

/// `sha256:` over the layer digest followed by the exact config bytes.
pub fn artifact_id(layer_digest: &str, config: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(layer_digest.as_bytes());
    hasher.update(config);
    format!("sha256:{:x}", hasher.finalize())
}

/// Archive `rootfs` with sorted paths, zero timestamps and ownership taken
/// from `ownership`. Returns the archive's sha256.
pub fn write_layer(rootfs: &Path, ownership: &OwnershipTable, dest: &Path) -> BuildResult<String> {
    let entries = scan_tree(rootfs)
        .map_err(|err| BuildError::io(format!("Failed to scan {}", rootfs.display()), err))?;
    let file = File::create(dest)
        .map_err(|err| BuildError::io(format!("Failed to create {}", dest.display()), err))?;
    let mut builder = Builder::new(BufWriter::new(file));

    let layer_err = |err: io::Error| BuildError::io(format!("Failed to write {}", dest.display()), err);
    for entry in &entries {
        let owner = ownership.owner_of(&entry.path);
        let mut header = Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(u64::from(owner.uid));
        header.set_gid(u64::from(owner.gid));
        header.set_mode(entry.mode & !PRIVILEGE_BITS);
        match entry.kind {
            EntryKind::Dir => {
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                builder
                    .append_data(&mut header, &entry.path, io::empty())
                    .map_err(layer_err)?;
            }
            EntryKind::File => {
                let host = rootfs.join(&entry.path);
                let data = File::open(&host).map_err(layer_err)?;
                let size = data.metadata().map_err(layer_err)?.len();
                header.set_entry_type(EntryType::Regular);
                header.set_size(size);
                builder
                    .append_data(&mut header, &entry.path, data)
                    .map_err(layer_err)?;
            }
            EntryKind::Symlink => {
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                header
                    .set_link_name(entry.target.as_deref().unwrap_or_default())
                    .map_err(layer_err)?;
                builder
                    .append_data(&mut header, &entry.path, io::empty())
                    .map_err(layer_err)?;
            }
        }
    }
    let mut writer = builder.into_inner().map_err(layer_err)?;
    writer.flush().map_err(layer_err)?;
    drop(writer);

    debug!(entries = entries.len(), layer = %dest.display(), "Layer archived");
    sha256_file(dest).map_err(layer_err)
}

fn write_file(path: &Path, bytes: &[u8]) -> BuildResult<()> {
    fs::write(path, bytes)
        .map_err(|err| BuildError::io(format!("Failed to write {}", path.display()), err))
}

/// Re-check a finished artifact directory: identifier, identity and tooling.
pub fn verify_artifact(dir: &Path) -> BuildResult<AuditReport> {
    let config = load_config(dir)?;
    let report = BuildReport::load(dir)?;
    let recorded = fs::read_to_string(dir.join(DIGEST_FILE))
        .map_err(|err| BuildError::io(format!("Failed to read {DIGEST_FILE}"), err))?;

    let layer_digest = sha256_file(&dir.join(LAYER_FILE))
        .map_err(|err| BuildError::io(format!("Failed to hash {LAYER_FILE}"), err))?;
    let config_bytes = fs::read(dir.join(CONFIG_FILE))
        .map_err(|err| BuildError::io(format!("Failed to read {CONFIG_FILE}"), err))?;
    let expected = artifact_id(&layer_digest, &config_bytes);

    let mut audit = audit_artifact(&dir.join(ROOTFS_DIR), &config, &report.build_tools)?;
    if recorded.trim() != expected {
        audit.violations.push(format!(
            "{DIGEST_FILE} records {} but the contents hash to {expected}",
            recorded.trim()
        ));
    }
    if report.artifact_id != expected {
        audit
            .violations
            .push(format!("{REPORT_FILE} does not match the artifact contents"));
    }
    Ok(audit)
}

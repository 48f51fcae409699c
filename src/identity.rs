//! Execution identity and file ownership of the runtime artifact.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::assemble::AssembledImage;
use crate::error::{BuildError, BuildResult};
use crate::tree::rootfs_path;

pub const ROOT_USER: &str = "root";

/// Non-privileged user/group the artifact runs as. The only constructor
/// refuses uid 0, gid 0 and the `root` name, so a privileged identity cannot
/// exist anywhere in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionIdentity {
    user: String,
    uid: u32,
    gid: u32,
}

impl ExecutionIdentity {
    pub fn new(user: &str, uid: u32, gid: u32) -> BuildResult<Self> {
        let user = user.trim();
        if user.is_empty() {
            return Err(BuildError::Configuration(
                "execution identity needs a user name".into(),
            ));
        }
        if user == ROOT_USER || uid == 0 || gid == 0 {
            return Err(BuildError::Configuration(format!(
                "execution identity {user} ({uid}:{gid}) is privileged; artifacts never run as root"
            )));
        }
        if user.contains([':', '/', '\n']) || user.chars().any(char::is_whitespace) {
            return Err(BuildError::Configuration(format!(
                "execution identity name '{user}' contains invalid characters"
            )));
        }
        Ok(Self {
            user: user.to_string(),
            uid,
            gid,
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// `uid:gid`, the form written into the runtime config.
    pub fn spec(&self) -> String {
        format!("{}:{}", self.uid, self.gid)
    }
}

impl fmt::Display for ExecutionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.user, self.uid, self.gid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    pub const ROOT: Owner = Owner { uid: 0, gid: 0 };
}

/// Owner per in-image path; anything not listed belongs to root.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OwnershipTable {
    owners: BTreeMap<String, Owner>,
}

impl OwnershipTable {
    pub fn assign(&mut self, path: &str, owner: Owner) {
        self.owners
            .insert(path.trim_matches('/').to_string(), owner);
    }

    pub fn owner_of(&self, path: &str) -> Owner {
        self.owners
            .get(path.trim_matches('/'))
            .copied()
            .unwrap_or(Owner::ROOT)
    }
}

/// Assembled image after privilege reduction.
#[derive(Debug)]
pub struct OwnedImage {
    pub image: AssembledImage,
    pub identity: ExecutionIdentity,
    pub ownership: OwnershipTable,
}

pub fn reduce_privileges(image: AssembledImage, identity: &ExecutionIdentity) -> BuildResult<OwnedImage> {
    let entry = rootfs_path(&image.rootfs, &image.entrypoint);
    if !entry.is_file() {
        return Err(BuildError::Assembly(format!(
            "entry point {} is missing from the assembled image",
            image.entrypoint
        )));
    }

    let owner = Owner {
        uid: identity.uid(),
        gid: identity.gid(),
    };
    let mut ownership = OwnershipTable::default();
    ownership.assign(&image.workdir, owner);
    ownership.assign(&image.entrypoint, owner);

    register_account(
        &image.rootfs.join("etc/passwd"),
        identity.user(),
        &format!(
            "{user}:x:{uid}:{gid}:{user}:/nonexistent:/sbin/nologin",
            user = identity.user(),
            uid = identity.uid(),
            gid = identity.gid()
        ),
        |fields| fields.get(2) == Some(&identity.uid().to_string().as_str())
            && fields.get(3) == Some(&identity.gid().to_string().as_str()),
    )?;
    register_account(
        &image.rootfs.join("etc/group"),
        identity.user(),
        &format!("{}:x:{}:", identity.user(), identity.gid()),
        |fields| fields.get(2) == Some(&identity.gid().to_string().as_str()),
    )?;

    info!(identity = %identity, entrypoint = %image.entrypoint, "Ownership assigned");
    Ok(OwnedImage {
        image,
        identity: identity.clone(),
        ownership,
    })
}

/// Append `line` to a passwd-style database unless an entry named `name`
/// already exists. An existing entry must agree with the requested ids.
fn register_account<F>(path: &Path, name: &str, line: &str, agrees: F) -> BuildResult<()>
where
    F: Fn(&[&str]) -> bool,
{
    let existing = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(BuildError::io(format!("Failed to read {}", path.display()), err));
        }
    };

    for record in existing.lines() {
        let fields: Vec<&str> = record.split(':').collect();
        if fields.first() == Some(&name) {
            if agrees(&fields) {
                return Ok(());
            }
            return Err(BuildError::Assembly(format!(
                "{} already defines '{name}' with different ids: {record}",
                path.display()
            )));
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| BuildError::io(format!("Failed to create {}", parent.display()), err))?;
    }
    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(line);
    content.push('\n');
    fs::write(path, content)
        .map_err(|err| BuildError::io(format!("Failed to write {}", path.display()), err))
}

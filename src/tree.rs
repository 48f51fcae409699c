//! Deterministic directory traversal, hashing and copying.
//!
//! Every walk is sorted by file name so listings, digests and archives are
//! stable across runs. Timestamps never participate in a digest.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

impl EntryKind {
    fn tag(&self) -> &'static str {
        match self {
            EntryKind::File => "F",
            EntryKind::Dir => "D",
            EntryKind::Symlink => "L",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Path relative to the tree root, `/`-separated.
    pub path: String,
    pub kind: EntryKind,
    pub mode: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl TreeEntry {
    fn digest_line(&self) -> String {
        let payload = self
            .digest
            .as_deref()
            .or(self.target.as_deref())
            .unwrap_or("");
        format!(
            "{}:{}:{:o}:{}",
            self.kind.tag(),
            self.path,
            self.mode,
            payload
        )
    }

    /// Final path component.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

#[derive(Debug, Default, Clone)]
pub struct CopyStats {
    pub files: usize,
    pub skipped: Vec<String>,
}

/// Setuid and setgid bits. They never survive a copy into an image.
pub const PRIVILEGE_BITS: u32 = 0o6000;

pub fn sha256_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// List every entry below `root` (the root itself excluded), sorted by path.
pub fn scan_tree(root: &Path) -> io::Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let rel = relative_path(root, entry.path());
        if rel.is_empty() {
            continue;
        }
        let metadata = entry.path().symlink_metadata()?;
        let file_type = metadata.file_type();
        let mode = file_mode(&metadata);
        let tree_entry = if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            TreeEntry {
                path: rel,
                kind: EntryKind::Symlink,
                mode,
                digest: None,
                target: Some(target.to_string_lossy().into_owned()),
            }
        } else if file_type.is_dir() {
            TreeEntry {
                path: rel,
                kind: EntryKind::Dir,
                mode,
                digest: None,
                target: None,
            }
        } else {
            TreeEntry {
                path: rel,
                kind: EntryKind::File,
                mode,
                digest: Some(sha256_file(entry.path())?),
                target: None,
            }
        };
        entries.push(tree_entry);
    }
    Ok(entries)
}

/// Digest of an entry listing. Identical trees always produce the same value.
pub fn digest_entries(entries: &[TreeEntry]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.digest_line().as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

pub fn tree_digest(root: &Path) -> io::Result<String> {
    Ok(digest_entries(&scan_tree(root)?))
}

/// Copy the tree under `src` into `dest`, skipping any entry for which
/// `skip` returns true (a skipped directory prunes its whole subtree). A
/// path that already exists in `dest` is an `AlreadyExists` error.
pub fn copy_tree<F>(src: &Path, dest: &Path, skip: F) -> io::Result<CopyStats>
where
    F: Fn(&str) -> bool,
{
    let mut stats = CopyStats::default();
    fs::create_dir_all(dest)?;

    let mut walker = WalkDir::new(src).sort_by_file_name().into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(io::Error::other)?;
        let rel = relative_path(src, entry.path());
        if rel.is_empty() {
            continue;
        }
        if skip(&rel) {
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            stats.skipped.push(rel);
            continue;
        }

        let target = dest.join(&rel);
        let metadata = entry.path().symlink_metadata()?;
        let file_type = metadata.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            set_unprivileged_mode(&target, &metadata)?;
            continue;
        }

        if target.symlink_metadata().is_ok() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("'{rel}' is provided more than once"),
            ));
        }

        if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            make_symlink(&link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            set_unprivileged_mode(&target, &metadata)?;
            stats.files += 1;
        }
    }

    Ok(stats)
}

/// Map an absolute in-image path (`/opt/venv`) onto a directory on the host.
pub fn rootfs_path(rootfs: &Path, image_path: &str) -> PathBuf {
    let trimmed = image_path.trim_start_matches('/');
    if trimmed.is_empty() {
        rootfs.to_path_buf()
    } else {
        rootfs.join(trimmed)
    }
}

pub fn relative_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
pub fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub fn file_mode(metadata: &fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
fn set_unprivileged_mode(target: &Path, source: &fs::Metadata) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = file_mode(source) & !PRIVILEGE_BITS;
    fs::set_permissions(target, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_unprivileged_mode(target: &Path, source: &fs::Metadata) -> io::Result<()> {
    fs::set_permissions(target, source.permissions())
}

#[cfg(unix)]
fn make_symlink(link: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn make_symlink(link: &Path, target: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!(
            "cannot recreate symlink {} -> {} on this platform",
            target.display(),
            link.display()
        ),
    ))
}

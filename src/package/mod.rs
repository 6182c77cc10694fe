//! Package loading.
//!
//! A package reference is either a directory with a manifest at its root
//! or a zip archive of the same layout. Loading validates the manifest and
//! derives a content fingerprint; materialization into a per-lease
//! workspace happens later, so leases never share extracted files.

pub mod manifest;

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::PackageError;
pub use manifest::{FailurePolicy, Manifest, TopicConfig, TopicSpec, MANIFEST_FILE};

/// Path components excluded when a directory package is materialized:
/// VCS metadata, bytecode caches, build output, and prior run artifacts.
const IGNORED_COMPONENTS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "__pycache__",
    ".venv",
    ".cache",
    "target",
    "node_modules",
];

/// File names excluded at the package root (artifacts of earlier runs).
const IGNORED_FILES: &[&str] = &["log.html", "output.xml", "report.html"];

/// How the package is stored on disk.
#[derive(Debug, Clone)]
enum PackageSource {
    Directory(PathBuf),
    Archive(PathBuf),
}

/// A validated package: manifest plus content fingerprint.
#[derive(Debug, Clone)]
pub struct Package {
    source: PackageSource,
    manifest: Manifest,
    fingerprint: String,
}

impl Package {
    /// Load and validate a package reference. Fatal errors here abort
    /// startup before any fetch loop runs.
    pub fn load(path: &Path) -> Result<Self, PackageError> {
        if path.is_dir() {
            Self::load_directory(path)
        } else if path.is_file() {
            Self::load_archive(path)
        } else {
            Err(PackageError::NotFound(path.to_path_buf()))
        }
    }

    fn load_directory(path: &Path) -> Result<Self, PackageError> {
        let manifest_path = path.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(PackageError::ManifestMissing {
                path: path.to_path_buf(),
                manifest: MANIFEST_FILE.to_string(),
            });
        }
        let manifest =
            Manifest::parse(&fs::read_to_string(&manifest_path)?).map_err(|e| {
                PackageError::ManifestInvalid {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }
            })?;
        let fingerprint = fingerprint_directory(path)?;
        Ok(Self {
            source: PackageSource::Directory(path.to_path_buf()),
            manifest,
            fingerprint,
        })
    }

    fn load_archive(path: &Path) -> Result<Self, PackageError> {
        let file = fs::File::open(path)?;
        let mut archive =
            zip::ZipArchive::new(file).map_err(|e| PackageError::Archive {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let manifest_text = {
            let mut entry = archive.by_name(MANIFEST_FILE).map_err(|_| {
                PackageError::ManifestMissing {
                    path: path.to_path_buf(),
                    manifest: MANIFEST_FILE.to_string(),
                }
            })?;
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            text
        };
        let manifest =
            Manifest::parse(&manifest_text).map_err(|e| PackageError::ManifestInvalid {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        let fingerprint = fingerprint_archive(&mut archive, path)?;
        Ok(Self {
            source: PackageSource::Archive(path.to_path_buf()),
            manifest,
            fingerprint,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// SHA-256 over sorted file names and contents; diagnostic identity.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// The path the package was loaded from.
    pub fn path(&self) -> &Path {
        match &self.source {
            PackageSource::Directory(p) | PackageSource::Archive(p) => p,
        }
    }

    /// Manifest name, falling back to the file name.
    pub fn display_name(&self) -> String {
        self.manifest
            .package
            .name
            .clone()
            .unwrap_or_else(|| {
                self.path()
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| self.path().display().to_string())
            })
    }

    /// Copy or extract the package into `dest`. Called once per lease;
    /// blocking filesystem work, so runners call it off the async path.
    pub fn materialize(&self, dest: &Path) -> Result<(), PackageError> {
        match &self.source {
            PackageSource::Directory(src) => copy_tree(src, dest),
            PackageSource::Archive(src) => extract_archive(src, dest),
        }
    }
}

fn is_ignored(relative: &Path) -> bool {
    let mut components = relative.components().peekable();
    let mut first = true;
    while let Some(component) = components.next() {
        let name = component.as_os_str().to_string_lossy();
        if IGNORED_COMPONENTS.contains(&name.as_ref()) {
            return true;
        }
        if name.ends_with(".pyc") {
            return true;
        }
        if first && components.peek().is_none() && IGNORED_FILES.contains(&name.as_ref()) {
            return true;
        }
        first = false;
    }
    false
}

fn copy_tree(src: &Path, dest: &Path) -> Result<(), PackageError> {
    for relative in walk_sorted(src)? {
        if is_ignored(&relative) {
            continue;
        }
        let from = src.join(&relative);
        let to = dest.join(&relative);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&from, &to)?;
    }
    Ok(())
}

fn extract_archive(src: &Path, dest: &Path) -> Result<(), PackageError> {
    let file = fs::File::open(src)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| PackageError::Archive {
        path: src.to_path_buf(),
        reason: e.to_string(),
    })?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|e| PackageError::Archive {
            path: src.to_path_buf(),
            reason: e.to_string(),
        })?;
        // enclosed_name rejects entries escaping the destination root.
        let Some(relative) = entry.enclosed_name() else {
            return Err(PackageError::Archive {
                path: src.to_path_buf(),
                reason: format!("entry '{}' escapes the package root", entry.name()),
            });
        };
        let to = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&to)?;
            continue;
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&to)?;
        std::io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

/// Relative paths of all files under `root`, sorted for stable hashing.
fn walk_sorted(root: &Path) -> Result<Vec<PathBuf>, PackageError> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                let relative = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .to_path_buf();
                files.push(relative);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn fingerprint_directory(root: &Path) -> Result<String, PackageError> {
    let mut hasher = Sha256::new();
    for relative in walk_sorted(root)? {
        if is_ignored(&relative) {
            continue;
        }
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0]);
        hasher.update(fs::read(root.join(&relative))?);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn fingerprint_archive(
    archive: &mut zip::ZipArchive<fs::File>,
    path: &Path,
) -> Result<String, PackageError> {
    let mut names: Vec<String> = archive.file_names().map(String::from).collect();
    names.sort();

    let mut hasher = Sha256::new();
    for name in names {
        let mut entry = archive.by_name(&name).map_err(|e| PackageError::Archive {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if entry.is_dir() {
            continue;
        }
        hasher.update(name.as_bytes());
        hasher.update([0]);
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        hasher.update(&contents);
    }
    Ok(hex::encode(hasher.finalize()))
}

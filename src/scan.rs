// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Local tree scanning.
//!
//! Walk a local directory and sort its entries into regular files and
//! symbolic links. Symbolic links are never followed by the plain walk.
//! Instead, each link is resolved separately, and links that point at
//! directories are scanned on their own so that their files still count
//! toward the total number of files a deployment will upload.
//!
//! A link whose target contains a directory that is still being scanned
//! would make the scan endless, so it fails with [`ScanError::Cycle`].

use std::{
    fs::{canonicalize, metadata, read_link},
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};
use walkdir::WalkDir;

/// Result of scanning a local tree.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanResult {
    /// Regular files, including files found behind directory symlinks.
    pub files: Vec<PathBuf>,

    /// Symbolic links found in the tree.
    pub symlinks: Vec<SymlinkEntry>,
}

impl ScanResult {
    /// Number of files an upload of this tree is expected to transfer.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Check if path is a symlink of this scan, or lives below one.
    pub fn is_covered_by_symlink(&self, path: impl AsRef<Path>) -> bool {
        self.symlinks
            .iter()
            .any(|link| path.as_ref().starts_with(&link.path))
    }

    /// Symlinks whose target is a directory.
    pub fn directory_symlinks(&self) -> impl Iterator<Item = &SymlinkEntry> {
        self.symlinks.iter().filter(|link| link.target_is_dir)
    }
}

/// Symbolic link found while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymlinkEntry {
    /// Path of link itself.
    pub path: PathBuf,

    /// File name of link.
    pub name: String,

    /// Resolved path the link points to.
    pub target: PathBuf,

    /// Link target is a directory.
    pub target_is_dir: bool,

    /// Scan of link target if it is a directory.
    pub nested: Option<Box<ScanResult>>,
}

/// Scan local tree.
///
/// The filter is applied to the full path of every entry, and entries that
/// fail it are left out. Links are resolved through [`read_link`], and a
/// relative link value is resolved against the directory holding the link.
/// The target of a directory link is scanned with the same filter, and the
/// files found there are merged into the parent's file list.
///
/// # Errors
///
/// - Return [`ScanError::Walk`] if root cannot be walked.
/// - Return [`ScanError::ReadLink`] if a link value cannot be read.
/// - Return [`ScanError::Target`] if a link target cannot be inspected.
/// - Return [`ScanError::Cycle`] if a directory link leads back into a
///   directory that is being scanned.
#[instrument(skip(root, filter), level = "debug")]
pub fn scan<F>(root: impl AsRef<Path>, filter: &F) -> Result<ScanResult>
where
    F: Fn(&Path) -> bool + ?Sized,
{
    let root = root.as_ref();

    // INVARIANT: Root must exist, even though it is not listed.
    let canonical = canonicalize(root).map_err(|err| ScanError::Root {
        source: err,
        path: root.to_path_buf(),
    })?;

    scan_tree(root, filter, &mut vec![canonical])
}

/// Scan tree whose canonical path is the last entry of `ancestors`.
fn scan_tree<F>(root: &Path, filter: &F, ancestors: &mut Vec<PathBuf>) -> Result<ScanResult>
where
    F: Fn(&Path) -> bool + ?Sized,
{
    debug!("scan {}", root.display());

    let mut result = ScanResult::default();
    let mut links = Vec::new();

    for entry in WalkDir::new(root).follow_links(false).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|err| ScanError::Walk {
            path: err
                .path()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| root.to_path_buf()),
            source: err,
        })?;

        if !filter(entry.path()) {
            debug!("exclude {}", entry.path().display());
            continue;
        }

        let kind = entry.file_type();
        if kind.is_symlink() {
            links.push(entry.into_path());
        } else if kind.is_file() {
            result.files.push(entry.into_path());
        }
    }

    for path in links {
        let value = read_link(&path).map_err(|err| ScanError::ReadLink {
            source: err,
            path: path.clone(),
        })?;
        let target = match path.parent() {
            Some(parent) if value.is_relative() => parent.join(&value),
            _ => value,
        };
        let target_is_dir = metadata(&target)
            .map_err(|err| ScanError::Target {
                source: err,
                link: path.clone(),
                target: target.clone(),
            })?
            .is_dir();

        let nested = if target_is_dir {
            let canonical = canonicalize(&target).map_err(|err| ScanError::Target {
                source: err,
                link: path.clone(),
                target: target.clone(),
            })?;

            // INVARIANT: Target must not contain any directory still being scanned.
            if ancestors.iter().any(|dir| dir.starts_with(&canonical)) {
                return Err(ScanError::Cycle {
                    link: path,
                    target: canonical,
                });
            }

            ancestors.push(canonical);
            let child = scan_tree(&target, filter, ancestors);
            ancestors.pop();

            let child = child?;
            result.files.extend(child.files.iter().cloned());
            Some(Box::new(child))
        } else {
            None
        };

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!("symlink {} -> {}", path.display(), target.display());
        result.symlinks.push(SymlinkEntry {
            path,
            name,
            target,
            target_is_dir,
            nested,
        });
    }

    Ok(result)
}

/// Local scan error types.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// Scan root is missing or unreadable.
    #[error("cannot scan {:?}", path.display())]
    Root {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Directory walk failed.
    #[error("failed to walk {:?}", path.display())]
    Walk {
        #[source]
        source: walkdir::Error,
        path: PathBuf,
    },

    /// Symbolic link value cannot be read.
    #[error("failed to read symlink {:?}", path.display())]
    ReadLink {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Symbolic link target cannot be inspected.
    #[error("symlink {:?} points at unreadable target {:?}", link.display(), target.display())]
    Target {
        #[source]
        source: std::io::Error,
        link: PathBuf,
        target: PathBuf,
    },

    /// Directory link leads back into a directory being scanned.
    #[error("symlink {:?} loops back into {:?}", link.display(), target.display())]
    Cycle { link: PathBuf, target: PathBuf },
}

/// Friendly result alias :3
pub type Result<T, E = ScanError> = std::result::Result<T, E>;

// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote file store access.
//!
//! A __remote file store__ is a hierarchical filesystem on some other host
//! that relkit can only reach through a session oriented transport. The
//! deployment logic never talks to a transport directly. It goes through the
//! [`RemoteFileStore`] trait instead, so the same deployment sequence can run
//! against a real SFTP server, or an in-memory store for dry runs and tests.
//!
//! # Paths
//!
//! Remote paths are POSIX strings. Use [`crate::path::remote_join`] to build
//! them.
//!
//! # Failures
//!
//! Every operation is fallible on its own. Transport failures that happen
//! outside of a call surface on the next call as its error, so callers only
//! ever deal with returned results.

pub mod memory;
pub mod sftp;

use crate::path::{remote_join, to_remote_segment};

use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Kind of remote entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Directory,
    Other,
}

/// Entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Name of entry without its parent path.
    pub name: String,

    /// Kind of entry.
    pub kind: EntryKind,
}

/// File was uploaded to the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadEvent {
    /// Local source path.
    pub source: PathBuf,

    /// Remote destination path.
    pub destination: String,
}

/// Operations relkit needs from a remote filesystem.
///
/// All operations block until the remote side answered.
pub trait RemoteFileStore {
    /// Open session.
    fn connect(&mut self) -> Result<()>;

    /// Close session. Closing a store that is not connected does nothing.
    fn disconnect(&mut self) -> Result<()>;

    /// Kind of entry at path, or [`None`] if nothing is there.
    fn exists(&mut self, path: &str) -> Result<Option<EntryKind>>;

    /// List immediate children of directory.
    fn list(&mut self, path: &str) -> Result<Vec<RemoteEntry>>;

    /// Create directory, including missing parents if recursive.
    fn mkdir(&mut self, path: &str, recursive: bool) -> Result<()>;

    /// Remove directory, including its contents if recursive.
    fn rmdir(&mut self, path: &str, recursive: bool) -> Result<()>;

    /// Remove file. Missing files are fine when forced.
    fn delete_file(&mut self, path: &str, force: bool) -> Result<()>;

    /// Rename entry.
    fn rename(&mut self, from: &str, to: &str) -> Result<()>;

    /// Change permission bits of entry.
    fn chmod(&mut self, path: &str, mode: u32) -> Result<()>;

    /// Upload local file to remote path.
    fn upload_file(&mut self, local: &Path, remote: &str) -> Result<()>;

    /// Upload local directory tree to remote directory.
    ///
    /// Walks local tree without following symlinks. Entries rejected by the
    /// filter are skipped, and directories are created as they are found.
    /// Symlinks are never uploaded, whatever they point at.
    /// The listener receives one [`UploadEvent`] per uploaded file. Returns
    /// number of uploaded files.
    fn upload_dir(
        &mut self,
        local: &Path,
        remote: &str,
        filter: &dyn Fn(&Path) -> bool,
        on_upload: &mut dyn FnMut(&UploadEvent),
    ) -> Result<usize> {
        if self.exists(remote)? != Some(EntryKind::Directory) {
            debug!("mkdir {remote}");
            self.mkdir(remote, true)?;
        }

        let mut count = 0;
        let mut walker = WalkDir::new(local)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry.map_err(|err| RemoteError::LocalWalk {
                path: local.to_path_buf(),
                source: err,
            })?;

            // INVARIANT: Rejected directories take their whole subtree with them.
            if !filter(entry.path()) {
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }

            let relative = entry.path().strip_prefix(local).unwrap_or(entry.path());
            let destination = remote_join(remote, [to_remote_segment(relative)]);
            let kind = entry.file_type();
            if kind.is_dir() {
                if self.exists(&destination)? != Some(EntryKind::Directory) {
                    debug!("mkdir {destination}");
                    self.mkdir(&destination, false)?;
                }
            } else if kind.is_file() {
                self.upload_file(entry.path(), &destination)?;
                count += 1;
                on_upload(&UploadEvent {
                    source: entry.path().to_path_buf(),
                    destination,
                });
            } else {
                debug!("skip non-regular entry {}", entry.path().display());
            }
        }

        Ok(count)
    }
}

/// Remote file store error types.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Session cannot be opened, authenticated, or kept alive.
    #[error("transport failure: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Operation was attempted without an open session.
    #[error("remote session is not connected")]
    NotConnected,

    /// Remote filesystem rejected an operation.
    #[error("remote {op} failed at {path:?}")]
    Filesystem {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Local file for upload cannot be read.
    #[error("failed to read local file {:?}", path.display())]
    LocalRead {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Local tree for upload cannot be walked.
    #[error("failed to walk local directory {:?}", path.display())]
    LocalWalk {
        #[source]
        source: walkdir::Error,
        path: PathBuf,
    },
}

impl RemoteError {
    /// Construct new filesystem error.
    pub fn filesystem(op: &'static str, path: impl Into<String>, source: impl Into<std::io::Error>) -> Self {
        Self::Filesystem {
            op,
            path: path.into(),
            source: source.into(),
        }
    }

    /// Check if error came from transport rather than remote filesystem.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::NotConnected)
    }
}

/// Friendly result alias :3
pub type Result<T, E = RemoteError> = std::result::Result<T, E>;

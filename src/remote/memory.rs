// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! In-memory remote file store.
//!
//! Behaves like a strict SFTP server: renames never overwrite, directories
//! must be empty to be removed non-recursively, and parents must exist. Every
//! mutating call is recorded in a journal, and failures can be injected for
//! any operation on any path. Clones share the same state, so a caller can
//! hand one clone to a deployment and inspect the other afterwards.

use crate::{
    path::{remote_file_name, remote_join, remote_parent},
    remote::{EntryKind, RemoteEntry, RemoteError, RemoteFileStore, Result},
};

use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::read,
    io::{Error as IoError, ErrorKind},
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

/// Default permission bits of new entries.
const DEFAULT_MODE: u32 = 0o755;

/// Node of the in-memory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Directory { mode: u32 },
    File { content: Vec<u8>, mode: u32 },
}

/// Recorded remote operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOp {
    Connect,
    Disconnect,
    Mkdir(String),
    Rmdir(String),
    Delete(String),
    Rename { from: String, to: String },
    Chmod { path: String, mode: u32 },
    Upload(String),
}

impl Display for RemoteOp {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Connect => write!(fmt, "connect"),
            Self::Disconnect => write!(fmt, "disconnect"),
            Self::Mkdir(path) => write!(fmt, "mkdir {path}"),
            Self::Rmdir(path) => write!(fmt, "rmdir {path}"),
            Self::Delete(path) => write!(fmt, "delete {path}"),
            Self::Rename { from, to } => write!(fmt, "rename {from} -> {to}"),
            Self::Chmod { path, mode } => write!(fmt, "chmod {mode:o} {path}"),
            Self::Upload(path) => write!(fmt, "upload {path}"),
        }
    }
}

/// Operation kinds failures can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Connect,
    Exists,
    List,
    Mkdir,
    Rmdir,
    Delete,
    Rename,
    Chmod,
    Upload,
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    journal: Vec<RemoteOp>,
    faults: Vec<Fault>,
    connected: bool,
}

#[derive(Debug)]
struct Fault {
    op: OpKind,
    path: String,
    once: bool,
}

impl State {
    fn check_fault(&mut self, op: OpKind, path: &str) -> Result<()> {
        let hit = self
            .faults
            .iter()
            .position(|fault| fault.op == op && fault.path == path);
        if let Some(index) = hit {
            if self.faults[index].once {
                self.faults.remove(index);
            }

            let source = IoError::other("injected failure");
            return Err(match op {
                OpKind::Connect => RemoteError::Transport {
                    message: format!("cannot reach {path}"),
                    source: Some(source),
                },
                _ => RemoteError::filesystem(op_name(op), path, source),
            });
        }

        Ok(())
    }

    fn ensure_connected(&self) -> Result<()> {
        if !self.connected {
            return Err(RemoteError::NotConnected);
        }

        Ok(())
    }

    fn children(&self, path: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|key| remote_parent(key) == Some(path))
            .cloned()
            .collect()
    }

    fn descendants(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.nodes
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect()
    }

    fn require_parent_dir(&self, op: OpKind, path: &str) -> Result<()> {
        match remote_parent(path) {
            None | Some("/") => Ok(()),
            Some(parent) => match self.nodes.get(parent) {
                Some(Node::Directory { .. }) => Ok(()),
                _ => Err(not_found(op, path)),
            },
        }
    }
}

/// Remote file store that lives in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// Construct new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed directory, creating missing parents.
    pub fn seed_dir(&self, path: &str) {
        let mut state = self.lock();
        let mut current = String::from("/");
        for part in path.split('/').filter(|part| !part.is_empty()) {
            current = remote_join(&current, [part]);
            state
                .nodes
                .entry(current.clone())
                .or_insert(Node::Directory { mode: DEFAULT_MODE });
        }
    }

    /// Seed file with content, creating missing parents.
    pub fn seed_file(&self, path: &str, content: impl Into<Vec<u8>>) {
        if let Some(parent) = remote_parent(path) {
            self.seed_dir(parent);
        }

        self.lock().nodes.insert(
            path.to_string(),
            Node::File {
                content: content.into(),
                mode: 0o644,
            },
        );
    }

    /// Make every future call of an operation on a path fail.
    pub fn fail_on(&self, op: OpKind, path: impl Into<String>) {
        self.lock().faults.push(Fault {
            op,
            path: path.into(),
            once: false,
        });
    }

    /// Make only the next call of an operation on a path fail.
    pub fn fail_once(&self, op: OpKind, path: impl Into<String>) {
        self.lock().faults.push(Fault {
            op,
            path: path.into(),
            once: true,
        });
    }

    /// Stop injecting failures.
    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Node at path.
    pub fn node(&self, path: &str) -> Option<Node> {
        self.lock().nodes.get(path).cloned()
    }

    /// Check if directory exists at path.
    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.node(path), Some(Node::Directory { .. }))
    }

    /// Content of file at path.
    pub fn file_content(&self, path: &str) -> Option<Vec<u8>> {
        match self.node(path) {
            Some(Node::File { content, .. }) => Some(content),
            _ => None,
        }
    }

    /// Paths of every file below directory, relative to it, sorted.
    pub fn files_under(&self, path: &str) -> Vec<String> {
        let state = self.lock();
        let prefix = format!("{}/", path.trim_end_matches('/'));
        state
            .nodes
            .iter()
            .filter(|(key, node)| key.starts_with(&prefix) && matches!(node, Node::File { .. }))
            .map(|(key, _)| key[prefix.len()..].to_string())
            .collect()
    }

    /// Recorded operations, oldest first.
    pub fn journal(&self) -> Vec<RemoteOp> {
        self.lock().journal.clone()
    }

    /// Check if store is connected.
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // INVARIANT: A poisoned lock only means some test panicked midway.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RemoteFileStore for MemoryStore {
    fn connect(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.check_fault(OpKind::Connect, "")?;
        state.connected = true;
        state.journal.push(RemoteOp::Connect);

        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        let mut state = self.lock();
        if state.connected {
            state.connected = false;
            state.journal.push(RemoteOp::Disconnect);
        }

        Ok(())
    }

    fn exists(&mut self, path: &str) -> Result<Option<EntryKind>> {
        let mut state = self.lock();
        state.ensure_connected()?;
        state.check_fault(OpKind::Exists, path)?;

        Ok(state.nodes.get(path).map(|node| match node {
            Node::Directory { .. } => EntryKind::Directory,
            Node::File { .. } => EntryKind::File,
        }))
    }

    fn list(&mut self, path: &str) -> Result<Vec<RemoteEntry>> {
        let mut state = self.lock();
        state.ensure_connected()?;
        state.check_fault(OpKind::List, path)?;

        let is_root = path == "/";
        if !is_root && !matches!(state.nodes.get(path), Some(Node::Directory { .. })) {
            return Err(not_found(OpKind::List, path));
        }

        Ok(state
            .children(path)
            .into_iter()
            .map(|child| RemoteEntry {
                name: remote_file_name(&child).to_string(),
                kind: match state.nodes.get(&child) {
                    Some(Node::Directory { .. }) => EntryKind::Directory,
                    _ => EntryKind::File,
                },
            })
            .collect())
    }

    fn mkdir(&mut self, path: &str, recursive: bool) -> Result<()> {
        let mut state = self.lock();
        state.ensure_connected()?;
        state.check_fault(OpKind::Mkdir, path)?;

        if state.nodes.contains_key(path) {
            if recursive && matches!(state.nodes.get(path), Some(Node::Directory { .. })) {
                return Ok(());
            }
            return Err(RemoteError::filesystem(
                "mkdir",
                path,
                IoError::from(ErrorKind::AlreadyExists),
            ));
        }

        if recursive {
            let mut current = if path.starts_with('/') { "/".to_string() } else { String::new() };
            for part in path.split('/').filter(|part| !part.is_empty()) {
                current = remote_join(&current, [part]);
                match state.nodes.get(&current) {
                    Some(Node::Directory { .. }) => continue,
                    Some(Node::File { .. }) => {
                        return Err(RemoteError::filesystem(
                            "mkdir",
                            current.as_str(),
                            IoError::from(ErrorKind::AlreadyExists),
                        ))
                    }
                    None => {
                        state
                            .nodes
                            .insert(current.clone(), Node::Directory { mode: DEFAULT_MODE });
                    }
                }
            }
        } else {
            state.require_parent_dir(OpKind::Mkdir, path)?;
            state
                .nodes
                .insert(path.to_string(), Node::Directory { mode: DEFAULT_MODE });
        }

        state.journal.push(RemoteOp::Mkdir(path.to_string()));
        Ok(())
    }

    fn rmdir(&mut self, path: &str, recursive: bool) -> Result<()> {
        let mut state = self.lock();
        state.ensure_connected()?;
        state.check_fault(OpKind::Rmdir, path)?;

        if !matches!(state.nodes.get(path), Some(Node::Directory { .. })) {
            return Err(not_found(OpKind::Rmdir, path));
        }

        let descendants = state.descendants(path);
        if !descendants.is_empty() && !recursive {
            return Err(RemoteError::filesystem(
                "rmdir",
                path,
                IoError::other("directory not empty"),
            ));
        }

        for descendant in descendants {
            state.nodes.remove(&descendant);
        }
        state.nodes.remove(path);
        state.journal.push(RemoteOp::Rmdir(path.to_string()));

        Ok(())
    }

    fn delete_file(&mut self, path: &str, force: bool) -> Result<()> {
        let mut state = self.lock();
        state.ensure_connected()?;
        state.check_fault(OpKind::Delete, path)?;

        match state.nodes.get(path) {
            Some(Node::File { .. }) => {
                state.nodes.remove(path);
                state.journal.push(RemoteOp::Delete(path.to_string()));
                Ok(())
            }
            None if force => Ok(()),
            _ => Err(not_found(OpKind::Delete, path)),
        }
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let mut state = self.lock();
        state.ensure_connected()?;
        state.check_fault(OpKind::Rename, from)?;

        if !state.nodes.contains_key(from) {
            return Err(not_found(OpKind::Rename, from));
        }
        if state.nodes.contains_key(to) {
            return Err(RemoteError::filesystem(
                "rename",
                from,
                IoError::from(ErrorKind::AlreadyExists),
            ));
        }
        state.require_parent_dir(OpKind::Rename, to)?;

        let mut moved = state
            .descendants(from)
            .into_iter()
            .map(|key| {
                let renamed = format!("{to}{}", &key[from.len()..]);
                (key, renamed)
            })
            .collect::<Vec<_>>();
        moved.push((from.to_string(), to.to_string()));

        for (old, new) in moved {
            if let Some(node) = state.nodes.remove(&old) {
                state.nodes.insert(new, node);
            }
        }
        state.journal.push(RemoteOp::Rename {
            from: from.to_string(),
            to: to.to_string(),
        });

        Ok(())
    }

    fn chmod(&mut self, path: &str, mode: u32) -> Result<()> {
        let mut state = self.lock();
        state.ensure_connected()?;
        state.check_fault(OpKind::Chmod, path)?;

        match state.nodes.get_mut(path) {
            Some(Node::Directory { mode: current }) | Some(Node::File { mode: current, .. }) => {
                *current = mode;
            }
            None => return Err(not_found(OpKind::Chmod, path)),
        }
        state.journal.push(RemoteOp::Chmod {
            path: path.to_string(),
            mode,
        });

        Ok(())
    }

    fn upload_file(&mut self, local: &Path, remote: &str) -> Result<()> {
        let content = read(local).map_err(|err| RemoteError::LocalRead {
            source: err,
            path: local.to_path_buf(),
        })?;

        let mut state = self.lock();
        state.ensure_connected()?;
        state.check_fault(OpKind::Upload, remote)?;
        state.require_parent_dir(OpKind::Upload, remote)?;
        if matches!(state.nodes.get(remote), Some(Node::Directory { .. })) {
            return Err(RemoteError::filesystem(
                "upload",
                remote,
                IoError::other("is a directory"),
            ));
        }

        state
            .nodes
            .insert(remote.to_string(), Node::File { content, mode: 0o644 });
        state.journal.push(RemoteOp::Upload(remote.to_string()));

        Ok(())
    }
}

fn op_name(op: OpKind) -> &'static str {
    match op {
        OpKind::Connect => "connect",
        OpKind::Exists => "stat",
        OpKind::List => "readdir",
        OpKind::Mkdir => "mkdir",
        OpKind::Rmdir => "rmdir",
        OpKind::Delete => "unlink",
        OpKind::Rename => "rename",
        OpKind::Chmod => "chmod",
        OpKind::Upload => "upload",
    }
}

fn not_found(op: OpKind, path: &str) -> RemoteError {
    RemoteError::filesystem(op_name(op), path, IoError::from(ErrorKind::NotFound))
}

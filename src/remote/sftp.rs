// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote file store over SFTP.
//!
//! Uses libssh2 through the [`ssh2`] crate. Git access in relkit already goes
//! through libssh2 via libgit2, so both share one SSH implementation.
//!
//! # Authentication
//!
//! Authentication methods are tried in this order:
//!
//! 1. Private key file, with optional passphrase.
//! 2. Password.
//! 3. Running SSH agent.
//! 4. Interactive password prompt.
//!
//! # Timeouts
//!
//! When a timeout is configured, it bounds the TCP connect as well as every
//! blocking call made on the session afterwards. A call that runs out of time
//! fails like any other transport error.

use crate::{
    config::ConnectionSettings,
    remote::{EntryKind, RemoteEntry, RemoteError, RemoteFileStore, Result},
    path::remote_join,
};

use inquire::Password;
use ssh2::{ErrorCode, FileStat, Session, Sftp};
use std::{
    fs::File,
    io::copy,
    net::{TcpStream, ToSocketAddrs},
    path::Path,
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// SFTP status code for a missing file.
const FX_NO_SUCH_FILE: i32 = 2;

/// Permission bits for directories created by [`SftpStore::mkdir`].
const DEFAULT_DIR_MODE: i32 = 0o755;

/// Remote file store reached over SFTP.
pub struct SftpStore {
    settings: ConnectionSettings,
    session: Option<(Session, Sftp)>,
}

impl SftpStore {
    /// Construct new store. Nothing is opened until [`RemoteFileStore::connect`].
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            session: None,
        }
    }

    fn sftp(&self) -> Result<&Sftp> {
        self.session
            .as_ref()
            .map(|(_, sftp)| sftp)
            .ok_or(RemoteError::NotConnected)
    }

    fn open_tcp(&self) -> Result<TcpStream> {
        let address = format!("{}:{}", self.settings.host, self.settings.port);
        let Some(timeout) = self.settings.timeout_secs.map(Duration::from_secs) else {
            return TcpStream::connect(&address).map_err(|err| transport(format!("cannot reach {address}"), err));
        };

        let mut last_error = None;
        let addrs = address
            .to_socket_addrs()
            .map_err(|err| transport(format!("cannot resolve {address}"), err))?;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_error = Some(err),
            }
        }

        Err(RemoteError::Transport {
            message: format!("cannot reach {address}"),
            source: last_error,
        })
    }

    #[instrument(skip(self, session), level = "debug")]
    fn authenticate(&self, session: &Session) -> Result<()> {
        let user = self.settings.username.as_str();

        if let Some(key) = &self.settings.private_key {
            debug!("authenticate {user} with key {}", key.display());
            session
                .userauth_pubkey_file(user, None, key, self.settings.passphrase.as_deref())
                .map_err(|err| transport("key authentication failed", err))?;
        } else if let Some(password) = &self.settings.password {
            debug!("authenticate {user} with password");
            session
                .userauth_password(user, password)
                .map_err(|err| transport("password authentication failed", err))?;
        } else if let Err(err) = session.userauth_agent(user) {
            warn!("ssh agent authentication failed: {err}");
            let password = Password::new(&format!("password for {user}@{}", self.settings.host))
                .without_confirmation()
                .prompt()
                .map_err(|err| RemoteError::Transport {
                    message: format!("no password given: {err}"),
                    source: None,
                })?;
            session
                .userauth_password(user, &password)
                .map_err(|err| transport("password authentication failed", err))?;
        }

        if !session.authenticated() {
            return Err(RemoteError::Transport {
                message: format!("server did not accept credentials for {user}"),
                source: None,
            });
        }

        Ok(())
    }

    fn remove_tree(&self, path: &str) -> Result<()> {
        let sftp = self.sftp()?;
        let entries = sftp
            .readdir(Path::new(path))
            .map_err(|err| RemoteError::filesystem("readdir", path, err))?;

        for (child, stat) in entries {
            let child = child.to_string_lossy().into_owned();
            match entry_kind(&stat) {
                EntryKind::Directory => self.remove_tree(&child)?,
                _ => sftp
                    .unlink(Path::new(&child))
                    .map_err(|err| RemoteError::filesystem("unlink", child.as_str(), err))?,
            }
        }

        sftp.rmdir(Path::new(path))
            .map_err(|err| RemoteError::filesystem("rmdir", path, err))
    }
}

impl RemoteFileStore for SftpStore {
    #[instrument(skip(self), level = "debug")]
    fn connect(&mut self) -> Result<()> {
        info!(
            "connect to {}@{}:{}",
            self.settings.username, self.settings.host, self.settings.port
        );
        let tcp = self.open_tcp()?;
        let mut session = Session::new().map_err(|err| transport("cannot create session", err))?;
        session.set_tcp_stream(tcp);
        if let Some(secs) = self.settings.timeout_secs {
            session.set_timeout(u32::try_from(secs.saturating_mul(1000)).unwrap_or(u32::MAX));
        }
        session
            .handshake()
            .map_err(|err| transport("ssh handshake failed", err))?;
        self.authenticate(&session)?;

        let sftp = session
            .sftp()
            .map_err(|err| transport("cannot open sftp channel", err))?;
        self.session = Some((session, sftp));

        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        let Some((session, sftp)) = self.session.take() else {
            return Ok(());
        };

        drop(sftp);
        session
            .disconnect(None, "relkit done", None)
            .map_err(|err| transport("disconnect failed", err))
    }

    fn exists(&mut self, path: &str) -> Result<Option<EntryKind>> {
        match self.sftp()?.lstat(Path::new(path)) {
            Ok(stat) => Ok(Some(entry_kind(&stat))),
            Err(err) if err.code() == ErrorCode::SFTP(FX_NO_SUCH_FILE) => Ok(None),
            Err(err) => Err(RemoteError::filesystem("stat", path, err)),
        }
    }

    fn list(&mut self, path: &str) -> Result<Vec<RemoteEntry>> {
        let entries = self
            .sftp()?
            .readdir(Path::new(path))
            .map_err(|err| RemoteError::filesystem("readdir", path, err))?;

        Ok(entries
            .into_iter()
            .filter_map(|(child, stat)| {
                child.file_name().map(|name| RemoteEntry {
                    name: name.to_string_lossy().into_owned(),
                    kind: entry_kind(&stat),
                })
            })
            .collect())
    }

    fn mkdir(&mut self, path: &str, recursive: bool) -> Result<()> {
        if !recursive {
            return self
                .sftp()?
                .mkdir(Path::new(path), DEFAULT_DIR_MODE)
                .map_err(|err| RemoteError::filesystem("mkdir", path, err));
        }

        let mut current = if path.starts_with('/') { "/".to_string() } else { String::new() };
        for part in path.split('/').filter(|part| !part.is_empty()) {
            current = remote_join(&current, [part]);
            if self.exists(&current)? == Some(EntryKind::Directory) {
                continue;
            }

            self.sftp()?
                .mkdir(Path::new(&current), DEFAULT_DIR_MODE)
                .map_err(|err| RemoteError::filesystem("mkdir", current.as_str(), err))?;
        }

        Ok(())
    }

    fn rmdir(&mut self, path: &str, recursive: bool) -> Result<()> {
        if recursive {
            return self.remove_tree(path);
        }

        self.sftp()?
            .rmdir(Path::new(path))
            .map_err(|err| RemoteError::filesystem("rmdir", path, err))
    }

    fn delete_file(&mut self, path: &str, force: bool) -> Result<()> {
        match self.sftp()?.unlink(Path::new(path)) {
            Err(err) if force && err.code() == ErrorCode::SFTP(FX_NO_SUCH_FILE) => Ok(()),
            result => result.map_err(|err| RemoteError::filesystem("unlink", path, err)),
        }
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.sftp()?
            .rename(Path::new(from), Path::new(to), None)
            .map_err(|err| RemoteError::filesystem("rename", from, err))
    }

    fn chmod(&mut self, path: &str, mode: u32) -> Result<()> {
        let stat = FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: Some(mode),
            atime: None,
            mtime: None,
        };

        self.sftp()?
            .setstat(Path::new(path), stat)
            .map_err(|err| RemoteError::filesystem("chmod", path, err))
    }

    fn upload_file(&mut self, local: &Path, remote: &str) -> Result<()> {
        let mut source = File::open(local).map_err(|err| RemoteError::LocalRead {
            source: err,
            path: local.to_path_buf(),
        })?;
        let mut destination = self
            .sftp()?
            .create(Path::new(remote))
            .map_err(|err| RemoteError::filesystem("create", remote, err))?;

        copy(&mut source, &mut destination)
            .map_err(|err| RemoteError::filesystem("write", remote, err))?;

        Ok(())
    }
}

impl Drop for SftpStore {
    fn drop(&mut self) {
        if let Err(err) = self.disconnect() {
            warn!("{err}");
        }
    }
}

fn entry_kind(stat: &FileStat) -> EntryKind {
    if stat.is_dir() {
        EntryKind::Directory
    } else if stat.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    }
}

fn transport(message: impl Into<String>, source: impl Into<std::io::Error>) -> RemoteError {
    RemoteError::Transport {
        message: message.into(),
        source: Some(source.into()),
    }
}

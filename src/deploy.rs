// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Staged deployment with rollback.
//!
//! Deploys a local build tree into a remote application directory without
//! ever leaving a half uploaded tree live. Three sibling directories under
//! the remote root take part:
//!
//! - `{app}` is the live application directory.
//! - `{app}-deploy` is the __staging__ directory receiving the new upload.
//! - `{app}-backup` is the __backup__ directory holding the previous release
//!   while the new one is promoted.
//!
//! # Deployment Sequence
//!
//! 1. __Connect__ to the remote store. Failure here touches nothing.
//! 2. __Stage__ the local tree into a fresh staging directory.
//! 3. __Promote__ by renaming live to backup, then staging to live.
//! 4. Run __post-promote__ side effects: extra files, extra directories, and
//!    the after-promote hook.
//! 5. __Clean up__ the backup directory, or everything not on a skip list.
//! 6. Disconnect, which happens no matter how the run ends.
//!
//! # Failure Modes
//!
//! Any failure in steps 2 through 4 triggers __recovery__, a best-effort
//! compensating rename that puts the previous release back in place. What
//! recovery does depends on where the slots stood when the failure hit,
//! which the orchestrator tracks itself in [`RemoteDeployState`] instead of
//! asking the remote side:
//!
//! | Layout | Recovery |
//! |---|---|
//! | [`SlotLayout::Original`] | Nothing. Staging is left behind for inspection. |
//! | [`SlotLayout::BackedUp`] | Backup renamed to live, failed staging upload removed. |
//! | [`SlotLayout::Promoted`] | Live renamed to staging, backup renamed to live. |
//!
//! Promotion is two renames, and there is a window between them where no
//! live directory exists at all. A crash inside that window leaves the
//! previous release in the backup slot, and the next run will not restore it
//! on its own. SFTP has no multi-path transaction to close that window.
//!
//! Recovery itself can fail, e.g., when the connection is already gone. The
//! run then reports both errors through [`DeployError::Recovery`], and the
//! remote host stays wherever it got to.
//!
//! # Existence Checks
//!
//! An existence check that fails is treated as "nothing there". This keeps
//! a metadata blip from halting a run, at the cost of skipping a removal a
//! retry would have done. Each such failure is logged at warn level.

use crate::{
    path::{first_path_part, remote_join, remote_parent, to_remote_segment},
    progress::{DeployEvent, ProgressReporter},
    remote::{EntryKind, RemoteError, RemoteFileStore, UploadEvent},
    scan::{scan, ScanError, ScanResult},
};

use std::{
    collections::HashSet,
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
};
use tracing::{debug, error, info, instrument, warn};

/// Permission bits for directories created explicitly by a deployment.
pub const DIRECTORY_MODE: u32 = 0o755;

/// Progress label of the final tick.
const UPLOAD_DONE: &str = "Upload done";

/// Exclusion predicate. Paths for which it returns `false` are skipped.
pub type PathFilter = Box<dyn Fn(&Path) -> bool + Send + Sync>;

/// Callback run once the new release is live.
pub type AfterPromoteHook = Box<dyn FnMut() -> anyhow::Result<()> + Send>;

/// What to remove after a successful promotion.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CleanupMode {
    /// Remove backup directory only.
    #[default]
    RemoveBackupOnly,

    /// Remove every top-level remote root entry not on the skip list.
    RemoveAllExceptSkipList,
}

/// Deployment configuration for one run.
pub struct DeployConfig {
    pub remote_root: String,
    pub local_root: PathBuf,
    pub app_name: String,
    pub staging_dir_name: String,
    pub backup_dir_name: String,
    pub full_deploy: bool,
    pub upload_symlink_targets: bool,
    pub extra_files: Vec<String>,
    pub extra_files_root: PathBuf,
    pub post_deploy_directories: Vec<String>,
    pub cleanup_mode: CleanupMode,
    pub remove_skip_list: HashSet<String>,
    pub path_filter: Option<PathFilter>,
    pub after_promote_hook: Option<AfterPromoteHook>,
}

impl DeployConfig {
    /// Construct new configuration with derived defaults.
    ///
    /// Staging and backup directory names default to `{app}-deploy` and
    /// `{app}-backup`. Full deployment is on, and cleanup only removes the
    /// backup directory.
    pub fn new(
        remote_root: impl Into<String>,
        local_root: impl Into<PathBuf>,
        app_name: impl Into<String>,
    ) -> Self {
        let app_name = app_name.into();
        let local_root = local_root.into();

        Self {
            remote_root: remote_root.into(),
            extra_files_root: local_root.clone(),
            local_root,
            staging_dir_name: format!("{app_name}-deploy"),
            backup_dir_name: format!("{app_name}-backup"),
            app_name,
            full_deploy: true,
            upload_symlink_targets: false,
            extra_files: Vec::new(),
            post_deploy_directories: Vec::new(),
            cleanup_mode: CleanupMode::RemoveBackupOnly,
            remove_skip_list: HashSet::new(),
            path_filter: None,
            after_promote_hook: None,
        }
    }

    /// Check if path passes exclusion filter.
    pub fn accepts(&self, path: &Path) -> bool {
        self.path_filter.as_ref().is_none_or(|filter| filter(path))
    }
}

impl std::fmt::Debug for DeployConfig {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.debug_struct("DeployConfig")
            .field("remote_root", &self.remote_root)
            .field("local_root", &self.local_root)
            .field("app_name", &self.app_name)
            .field("staging_dir_name", &self.staging_dir_name)
            .field("backup_dir_name", &self.backup_dir_name)
            .field("full_deploy", &self.full_deploy)
            .field("upload_symlink_targets", &self.upload_symlink_targets)
            .field("extra_files", &self.extra_files)
            .field("post_deploy_directories", &self.post_deploy_directories)
            .field("cleanup_mode", &self.cleanup_mode)
            .field("path_filter", &self.path_filter.is_some())
            .field("after_promote_hook", &self.after_promote_hook.is_some())
            .finish_non_exhaustive()
    }
}

/// Which release sits in which slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotLayout {
    /// Previous release, if any, is live. New release, if any, is staged.
    Original,

    /// Previous release moved to backup. Nothing is live.
    BackedUp,

    /// New release is live. Previous release is in backup if there was one.
    Promoted { backup: bool },
}

/// Remote slot paths and what each one currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDeployState {
    pub app_path: String,
    pub staging_path: String,
    pub backup_path: String,
    pub layout: SlotLayout,
}

impl RemoteDeployState {
    /// Compute slot paths from configuration.
    pub fn new(config: &DeployConfig) -> Self {
        Self {
            app_path: remote_join(&config.remote_root, [&config.app_name]),
            staging_path: remote_join(&config.remote_root, [&config.staging_dir_name]),
            backup_path: remote_join(&config.remote_root, [&config.backup_dir_name]),
            layout: SlotLayout::Original,
        }
    }

    /// Path of the slot that holds the live release, if any does.
    pub fn live_path(&self) -> Option<&str> {
        match self.layout {
            SlotLayout::Original | SlotLayout::Promoted { .. } => Some(&self.app_path),
            SlotLayout::BackedUp => None,
        }
    }

    /// Check if a previous release was moved into the backup slot.
    pub fn holds_backup(&self) -> bool {
        matches!(
            self.layout,
            SlotLayout::BackedUp | SlotLayout::Promoted { backup: true }
        )
    }
}

/// Phase of a deployment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployPhase {
    Idle,
    Connected,
    Staged,
    Promoted,
    Cleaned,
    ErrorRecovery,
    Done,
}

impl Display for DeployPhase {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Idle => "idle",
            Self::Connected => "connected",
            Self::Staged => "staged",
            Self::Promoted => "promoted",
            Self::Cleaned => "cleaned",
            Self::ErrorRecovery => "error recovery",
            Self::Done => "done",
        };
        fmt.write_str(name)
    }
}

/// Drive one deployment run against a remote file store.
pub struct DeployOrchestrator<S, R>
where
    S: RemoteFileStore,
    R: ProgressReporter,
{
    config: DeployConfig,
    store: S,
    reporter: R,
    state: RemoteDeployState,
    phase: DeployPhase,
}

impl<S, R> DeployOrchestrator<S, R>
where
    S: RemoteFileStore,
    R: ProgressReporter,
{
    /// Construct new orchestrator.
    pub fn new(config: DeployConfig, store: S, reporter: R) -> Self {
        let state = RemoteDeployState::new(&config);
        Self {
            config,
            store,
            reporter,
            state,
            phase: DeployPhase::Idle,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> DeployPhase {
        self.phase
    }

    /// Current slot state.
    pub fn state(&self) -> &RemoteDeployState {
        &self.state
    }

    /// Remote store in use.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Give back remote store.
    pub fn into_store(self) -> S {
        self.store
    }

    /// Run deployment.
    ///
    /// The local tree is scanned before anything remote happens, so a bad
    /// local tree never touches the remote host. The remote session is
    /// closed on every exit path once it was opened.
    ///
    /// # Errors
    ///
    /// - Return [`DeployError::Scan`] if local tree cannot be scanned.
    /// - Return [`DeployError::Connect`] if remote session cannot be opened.
    /// - Return [`DeployError::Remote`] if a remote step fails.
    /// - Return [`DeployError::Hook`] if after-promote hook fails.
    /// - Return [`DeployError::Recovery`] if restoring previous release fails
    ///   after any of the above.
    #[instrument(skip(self), fields(app = %self.config.app_name), level = "debug")]
    pub fn run(&mut self) -> Result<()> {
        let filter = |path: &Path| self.config.accepts(path);
        let scanned = scan(&self.config.local_root, &filter)?;
        self.reporter.start(scanned.file_count() as u64 + 1);

        if let Err(err) = self.store.connect() {
            error!("connection failed: {err}");
            self.reporter.interrupt(&format!("Connection error: {err}"));
            return Err(DeployError::Connect(err));
        }
        self.enter(DeployPhase::Connected);

        let result = self.execute(&scanned);

        if let Err(err) = self.store.disconnect() {
            warn!("failed to close remote session: {err}");
        }
        self.enter(DeployPhase::Done);

        match &result {
            Ok(()) => info!("deployed {} to {}", self.config.local_root.display(), self.state.app_path),
            Err(err) => error!("deploy failed: {err}"),
        }

        result
    }

    /// Restore previous release after a failure.
    ///
    /// Acts on tracked slot layout only, and becomes a no-op once the
    /// previous release is back in place. Calling it twice is safe. Requires
    /// an open session.
    ///
    /// # Errors
    ///
    /// - Return [`RemoteError`] if a compensating rename fails.
    #[instrument(skip(self), level = "debug")]
    pub fn recover(&mut self) -> Result<(), RemoteError> {
        if !self.state.holds_backup() {
            debug!("no backup taken, nothing to restore");
            return Ok(());
        }

        let RemoteDeployState {
            app_path,
            staging_path,
            backup_path,
            layout,
        } = self.state.clone();

        // INVARIANT: Unlike removal checks, a failed check here fails recovery.
        if self.store.exists(&backup_path)? != Some(EntryKind::Directory) {
            warn!("backup {backup_path} is gone, nothing to restore");
            self.state.layout = SlotLayout::Original;
            return Ok(());
        }

        match layout {
            SlotLayout::Promoted { .. } => {
                self.rename(&app_path, &staging_path)?;
                self.rename(&backup_path, &app_path)?;
            }
            SlotLayout::BackedUp => {
                self.rename(&backup_path, &app_path)?;
                self.state.layout = SlotLayout::Original;
                self.remove_if_exists(&staging_path)?;
            }
            SlotLayout::Original => {}
        }

        self.state.layout = SlotLayout::Original;
        self.reporter.event(&DeployEvent::Restored);
        info!("restored previous release at {app_path}");

        Ok(())
    }

    fn execute(&mut self, scanned: &ScanResult) -> Result<()> {
        if !self.config.full_deploy {
            let app_path = self.state.app_path.clone();

            // INVARIANT: Live directory was written in place, nothing to restore.
            if let Err(err) = self.upload_tree(scanned, &app_path) {
                self.report_failure(&err);
                return Err(err);
            }

            return Ok(());
        }

        if let Err(err) = self.stage_and_promote(scanned) {
            return Err(self.handle_failure(err));
        }

        self.cleanup()?;
        self.enter(DeployPhase::Cleaned);

        Ok(())
    }

    fn stage_and_promote(&mut self, scanned: &ScanResult) -> Result<()> {
        self.stage(scanned)?;
        self.enter(DeployPhase::Staged);

        self.promote()?;
        self.enter(DeployPhase::Promoted);

        self.post_promote()
    }

    fn handle_failure(&mut self, err: DeployError) -> DeployError {
        self.enter(DeployPhase::ErrorRecovery);
        self.report_failure(&err);

        match self.recover() {
            Ok(()) => err,
            Err(recovery) => {
                error!("recovery failed: {recovery}");
                DeployError::Recovery {
                    original: Box::new(err),
                    recovery,
                }
            }
        }
    }

    fn report_failure(&mut self, err: &DeployError) {
        match err {
            DeployError::Remote(remote) if remote.is_transport() => {
                error!("remote session failed: {err}");
                self.reporter.interrupt(&format!("Transport error: {err}"));
            }
            _ => {
                error!("deploy error: {err}");
                self.reporter.interrupt(&format!("Deploy error: {err}"));
            }
        }
    }

    #[instrument(skip(self, scanned), level = "debug")]
    fn stage(&mut self, scanned: &ScanResult) -> Result<()> {
        let staging_path = self.state.staging_path.clone();
        self.remove_if_exists(&staging_path)?;
        debug!("mkdir {staging_path}");
        self.store.mkdir(&staging_path, true)?;
        self.upload_tree(scanned, &staging_path)
    }

    fn upload_tree(&mut self, scanned: &ScanResult, destination: &str) -> Result<()> {
        info!(
            "deploy from {} to {destination}",
            self.config.local_root.display()
        );

        let Self {
            config,
            store,
            reporter,
            ..
        } = self;
        let local_root = config.local_root.as_path();
        let filter = |path: &Path| !scanned.is_covered_by_symlink(path) && config.accepts(path);
        let mut on_upload = |event: &UploadEvent| {
            let label = event.source.strip_prefix(local_root).unwrap_or(&event.source);
            reporter.advance(&to_remote_segment(label));
        };

        store.upload_dir(local_root, destination, &filter, &mut on_upload)?;

        if config.upload_symlink_targets {
            for link in scanned.directory_symlinks() {
                let relative = link.path.strip_prefix(local_root).unwrap_or(&link.path);
                let remote = remote_join(destination, [to_remote_segment(relative)]);
                debug!("upload symlink target {} to {remote}", link.target.display());

                store.mkdir(&remote, true)?;
                store.chmod(&remote, DIRECTORY_MODE)?;
                store.upload_dir(&link.target, &remote, &|path: &Path| config.accepts(path), &mut on_upload)?;
            }
        }

        for link in scanned.symlinks.iter().filter(|link| !link.target_is_dir) {
            warn!("skip file symlink {}", link.path.display());
        }

        reporter.finish(UPLOAD_DONE);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn promote(&mut self) -> Result<()> {
        let RemoteDeployState {
            app_path,
            staging_path,
            backup_path,
            ..
        } = self.state.clone();

        let had_live = self.lookup(&app_path) == Some(EntryKind::Directory);
        if had_live {
            self.remove_if_exists(&backup_path)?;
            self.rename(&app_path, &backup_path)?;
            self.state.layout = SlotLayout::BackedUp;
        }

        // INVARIANT: Nothing is live between these two renames.
        self.rename(&staging_path, &app_path)?;
        self.state.layout = SlotLayout::Promoted { backup: had_live };

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn post_promote(&mut self) -> Result<()> {
        let app_path = self.state.app_path.clone();

        for relative in self.resolve_extra_files()? {
            let source = self.config.extra_files_root.join(&relative);
            let destination = remote_join(&app_path, [to_remote_segment(&relative)]);
            if let Some(parent) = remote_parent(&destination) {
                if parent != app_path {
                    self.store.mkdir(parent, true)?;
                }
            }

            info!("upload {} to {destination}", source.display());
            self.store.upload_file(&source, &destination)?;
            self.reporter.event(&DeployEvent::ExtraUploaded(destination));
        }

        for directory in self.config.post_deploy_directories.clone() {
            let path = remote_join(&app_path, [directory.as_str()]);
            info!("create {path}");
            self.store.mkdir(&path, true)?;
            self.store.chmod(&path, DIRECTORY_MODE)?;
            self.reporter.event(&DeployEvent::Created(path));
        }

        if let Some(hook) = self.config.after_promote_hook.as_mut() {
            debug!("run after-promote hook");
            hook().map_err(DeployError::Hook)?;
        }

        Ok(())
    }

    fn resolve_extra_files(&self) -> Result<Vec<PathBuf>> {
        let root = &self.config.extra_files_root;
        let mut files = Vec::new();

        for pattern in &self.config.extra_files {
            let full = root.join(pattern);
            let paths = glob::glob(&full.to_string_lossy()).map_err(|err| DeployError::ExtraFile {
                pattern: pattern.clone(),
                reason: err.to_string(),
            })?;

            let before = files.len();
            for path in paths {
                let path = path.map_err(|err| DeployError::ExtraFile {
                    pattern: pattern.clone(),
                    reason: err.to_string(),
                })?;
                if path.is_file() {
                    files.push(path.strip_prefix(root).unwrap_or(&path).to_path_buf());
                }
            }

            if files.len() == before {
                return Err(DeployError::ExtraFile {
                    pattern: pattern.clone(),
                    reason: "no matching files".into(),
                });
            }
        }

        Ok(files)
    }

    #[instrument(skip(self), level = "debug")]
    fn cleanup(&mut self) -> Result<()> {
        match self.config.cleanup_mode {
            CleanupMode::RemoveBackupOnly => {
                let backup_path = self.state.backup_path.clone();
                self.remove_if_exists(&backup_path)?;
                self.state.layout = SlotLayout::Promoted { backup: false };
            }
            CleanupMode::RemoveAllExceptSkipList => {
                let root = self.config.remote_root.clone();
                let skip = self
                    .config
                    .remove_skip_list
                    .iter()
                    .map(|name| name.to_lowercase())
                    .collect::<HashSet<_>>();
                if !skip.contains(&self.config.app_name.to_lowercase()) {
                    warn!("{} is not on skip list and will be removed", self.config.app_name);
                }

                for entry in self.store.list(&root)? {
                    let path = remote_join(&root, [entry.name.as_str()]);
                    if skip.contains(&first_path_part(&path, &root)) {
                        debug!("keep {path}");
                        continue;
                    }

                    self.remove(&path, entry.kind)?;
                    if path == self.state.backup_path {
                        self.state.layout = SlotLayout::Promoted { backup: false };
                    }
                }
            }
        }

        Ok(())
    }

    fn enter(&mut self, phase: DeployPhase) {
        debug!("{} -> {phase}", self.phase);
        self.phase = phase;
        self.reporter.event(&DeployEvent::Phase(phase));
    }

    fn lookup(&mut self, path: &str) -> Option<EntryKind> {
        match self.store.exists(path) {
            Ok(kind) => kind,
            Err(err) => {
                // FIXME: Treating a failed check as absence may hide real errors.
                warn!("existence check of {path} failed, assuming absent: {err}");
                None
            }
        }
    }

    fn remove_if_exists(&mut self, path: &str) -> Result<(), RemoteError> {
        match self.lookup(path) {
            Some(kind) => self.remove(path, kind),
            None => Ok(()),
        }
    }

    fn remove(&mut self, path: &str, kind: EntryKind) -> Result<(), RemoteError> {
        info!("removing {path}");
        self.reporter.event(&DeployEvent::Removing(path.to_string()));
        match kind {
            EntryKind::Directory => self.store.rmdir(path, true),
            EntryKind::File | EntryKind::Other => self.store.delete_file(path, true),
        }
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), RemoteError> {
        info!("rename {from} to {to}");
        self.store.rename(from, to)?;
        self.reporter.event(&DeployEvent::Renamed {
            from: from.to_string(),
            to: to.to_string(),
        });

        Ok(())
    }
}

/// Deployment error types.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// Local tree cannot be scanned. Nothing remote was touched.
    #[error(transparent)]
    Scan(#[from] ScanError),

    /// Remote session cannot be opened. Nothing remote was touched.
    #[error("cannot connect to remote host")]
    Connect(#[source] RemoteError),

    /// Remote step failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Extra file pattern is invalid or matches nothing.
    #[error("extra file pattern {pattern:?}: {reason}")]
    ExtraFile { pattern: String, reason: String },

    /// After-promote hook failed.
    #[error("after-promote hook failed: {0:#}")]
    Hook(anyhow::Error),

    /// Restoring previous release failed after another failure.
    #[error("{original}; restoring previous release also failed: {recovery}")]
    Recovery {
        original: Box<DeployError>,
        #[source]
        recovery: RemoteError,
    },
}

/// Friendly result alias :3
pub type Result<T, E = DeployError> = std::result::Result<T, E>;

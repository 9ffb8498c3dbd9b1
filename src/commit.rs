// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Version commit ritual.
//!
//! After a release bumps a package version, the new version has to land in
//! git. The ritual is always the same:
//!
//! 1. Copy version files into the git directory when it is separate from the
//!    working directory.
//! 2. Commit tracked changes on the main branch.
//! 3. Checkout the release branch and pull it from `origin`.
//! 4. Merge the main branch into the release branch with a merge commit, even
//!    when a fast-forward would do.
//! 5. Tag the result as `v.{version}`.
//! 6. Return to the main branch.
//!
//! Any git failure stops the ritual right where it happened.

use crate::{config::CommitSettings, path::dir_key};

use auth_git2::{GitAuthenticator, Prompter};
use git2::{
    build::CheckoutBuilder, BranchType, Commit, Config, ErrorCode, FetchOptions, ObjectType,
    RemoteCallbacks, Repository,
};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Password, Text};
use serde_json::Value;
use std::{
    env,
    fs::{copy, read_to_string},
    path::{Path, PathBuf},
    time,
};
use tracing::{debug, info, instrument, warn};

/// Environment variable naming the git directory.
pub const GIT_DIR_ENV: &str = "PROJECT_GIT_DIR";

/// Commit new package version into git.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionCommit {
    pub work_dir: PathBuf,
    pub git_dir: PathBuf,
    pub version_files: Vec<PathBuf>,
    pub package_name: Option<String>,
    pub main_branch: String,
    pub release_branch: String,
}

impl VersionCommit {
    /// Construct new version commit from settings.
    ///
    /// Git directory comes from settings, then [`GIT_DIR_ENV`], then falls back
    /// to the working directory itself.
    pub fn from_settings(settings: &CommitSettings, work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        let git_dir = settings
            .git_dir
            .clone()
            .or_else(|| env::var_os(GIT_DIR_ENV).map(PathBuf::from))
            .unwrap_or_else(|| work_dir.clone());

        Self {
            work_dir,
            git_dir,
            version_files: settings.version_files.clone(),
            package_name: settings.package_name.clone(),
            main_branch: settings.main_branch.clone(),
            release_branch: settings.release_branch.clone(),
        }
    }

    /// Path to package manifest holding the version.
    pub fn manifest_path(&self) -> PathBuf {
        match &self.package_name {
            Some(name) => self
                .work_dir
                .join("packages")
                .join(name)
                .join("package.json"),
            None => self.work_dir.join("package.json"),
        }
    }

    /// Run the whole ritual, returning the committed version.
    ///
    /// Progress of the pull is drawn on `bar`. Credential prompts suspend it.
    ///
    /// # Errors
    ///
    /// - Return [`CommitError::CopyVersionFile`] if version file cannot be
    ///   copied.
    /// - Return [`CommitError::Manifest`] if package version cannot be read.
    /// - Return [`CommitError::MergeConflict`] if branches do not merge
    ///   cleanly.
    /// - Return [`CommitError::Git2`] if libgit2 operations fail.
    #[instrument(skip(self, bar), level = "debug")]
    pub fn run(&self, bar: &ProgressBar) -> Result<String> {
        self.copy_version_files()?;
        let version = read_package_version(self.manifest_path())?;
        info!("commit version {version} in {}", self.git_dir.display());

        let repo = Repository::open(&self.git_dir)?;
        commit_tracked(&repo, &format!("Updated version to {version}"))?;
        checkout_branch(&repo, &self.release_branch)?;
        pull(&repo, &self.release_branch, bar)?;

        let main = repo
            .find_branch(&self.main_branch, BranchType::Local)?
            .get()
            .peel_to_commit()?;
        merge_no_ff(&repo, &main, &format!("Version {version}"))?;

        let head = repo.head()?.peel(ObjectType::Commit)?;
        let signature = repo.signature()?;
        repo.tag(
            &format!("v.{version}"),
            &head,
            &signature,
            &format!("Version {version}"),
            false,
        )?;
        info!("tagged v.{version}");

        checkout_branch(&repo, &self.main_branch)?;

        Ok(version)
    }

    fn copy_version_files(&self) -> Result<()> {
        if dir_key(&self.work_dir) == dir_key(&self.git_dir) {
            return Ok(());
        }

        for file in &self.version_files {
            let from = self.work_dir.join(file);
            let to = self.git_dir.join(file);
            debug!("copy {} to {}", from.display(), to.display());

            if let Some(parent) = to.parent() {
                mkdirp::mkdirp(parent).map_err(|err| CommitError::CopyVersionFile {
                    source: err,
                    path: parent.to_path_buf(),
                })?;
            }
            copy(&from, &to).map_err(|err| CommitError::CopyVersionFile {
                source: err,
                path: from.clone(),
            })?;
        }

        Ok(())
    }
}

/// Read `version` field of package manifest.
///
/// # Errors
///
/// - Return [`CommitError::Manifest`] if manifest cannot be read, is not
///   valid JSON, or carries no string version.
pub fn read_package_version(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let manifest_error = |reason: String| CommitError::Manifest {
        path: path.to_path_buf(),
        reason,
    };

    let content = read_to_string(path).map_err(|err| manifest_error(err.to_string()))?;
    let manifest: Value =
        serde_json::from_str(&content).map_err(|err| manifest_error(err.to_string()))?;

    manifest
        .get("version")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| manifest_error("no version field".into()))
}

fn commit_tracked(repo: &Repository, message: &str) -> Result<()> {
    let mut index = repo.index()?;
    index.update_all(["*"], None)?;
    index.write()?;
    let tree = repo.find_tree(index.write_tree()?)?;

    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit()?),
        Err(err) if err.code() == ErrorCode::UnbornBranch => None,
        Err(err) => return Err(err.into()),
    };

    if parent.as_ref().is_some_and(|parent| parent.tree_id() == tree.id()) {
        info!("nothing to commit");
        return Ok(());
    }

    let signature = repo.signature()?;
    let parents = parent.iter().collect::<Vec<_>>();
    repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;
    info!("{message}");

    Ok(())
}

fn checkout_branch(repo: &Repository, name: &str) -> Result<()> {
    let branch = repo.find_branch(name, BranchType::Local)?;
    let reference = branch.get();
    let refname = reference
        .name()
        .ok_or_else(|| CommitError::InvalidBranch(name.into()))?
        .to_string();
    let target = reference.peel(ObjectType::Commit)?;

    repo.checkout_tree(&target, Some(CheckoutBuilder::new().safe()))?;
    repo.set_head(&refname)?;
    debug!("checked out {name}");

    Ok(())
}

#[instrument(skip(repo, bar), level = "debug")]
fn pull(repo: &Repository, branch: &str, bar: &ProgressBar) -> Result<()> {
    let mut remote = match repo.find_remote("origin") {
        Ok(remote) => remote,
        Err(err) if err.code() == ErrorCode::NotFound => {
            warn!("no origin remote, skip pull of {branch}");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    let style = ProgressStyle::with_template(
        "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}]",
    )?
    .progress_chars("-Cco.");
    bar.set_style(style);
    bar.set_message(format!("pull origin/{branch}"));

    let prompter = IndicatifPrompter::new(bar.clone());
    let authenticator = GitAuthenticator::default().set_prompter(prompter.clone());
    let config = Config::open_default()?;

    let mut throttle = time::Instant::now();
    let mut rc = RemoteCallbacks::new();
    rc.credentials(authenticator.credentials(&config));
    rc.transfer_progress(|progress| {
        if throttle.elapsed() > time::Duration::from_millis(10) {
            throttle = time::Instant::now();
            prompter.bar.set_length(progress.total_objects() as u64);
            prompter.bar.set_position(progress.received_objects() as u64);
        }
        true
    });

    let mut fo = FetchOptions::new();
    fo.remote_callbacks(rc);
    remote.fetch(&[branch], Some(&mut fo), None)?;
    bar.finish_and_clear();

    let fetch_head = repo.find_reference("FETCH_HEAD")?;
    let incoming = repo.reference_to_annotated_commit(&fetch_head)?;
    let (analysis, _) = repo.merge_analysis(&[&incoming])?;

    if analysis.is_up_to_date() {
        info!("{branch} is up to date with origin");
    } else if analysis.is_fast_forward() {
        let target = repo.find_object(incoming.id(), None)?;
        repo.checkout_tree(&target, Some(CheckoutBuilder::new().safe()))?;
        repo.head()?
            .set_target(incoming.id(), &format!("pull: fast-forward {branch}"))?;
        info!("fast-forwarded {branch}");
    } else {
        let theirs = repo.find_commit(incoming.id())?;
        merge_commit(repo, &theirs, &format!("Merge origin/{branch} into {branch}"))?;
    }

    Ok(())
}

/// Merge commit into HEAD, always producing a merge commit.
fn merge_no_ff(repo: &Repository, theirs: &Commit<'_>, message: &str) -> Result<()> {
    let incoming = repo.find_annotated_commit(theirs.id())?;
    let (analysis, _) = repo.merge_analysis(&[&incoming])?;
    if analysis.is_up_to_date() {
        info!("already up to date, skip merge");
        return Ok(());
    }

    merge_commit(repo, theirs, message)
}

fn merge_commit(repo: &Repository, theirs: &Commit<'_>, message: &str) -> Result<()> {
    let ours = repo.head()?.peel_to_commit()?;
    let mut index = repo.merge_commits(&ours, theirs, None)?;
    if index.has_conflicts() {
        return Err(CommitError::MergeConflict {
            ours: ours.id().to_string(),
            theirs: theirs.id().to_string(),
        });
    }

    // INVARIANT: Tree must be written into this repository's object database.
    let tree = repo.find_tree(index.write_tree_to(repo)?)?;
    let signature = repo.signature()?;
    repo.commit(
        Some("HEAD"),
        &signature,
        &signature,
        message,
        &tree,
        &[&ours, theirs],
    )?;
    repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
    info!("{message}");

    Ok(())
}

/// Git2 authentication prompter for progress bar.
#[derive(Debug, Clone)]
pub struct IndicatifPrompter {
    pub(crate) bar: ProgressBar,
}

impl IndicatifPrompter {
    /// Construct new progress bar authenticator.
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl Prompter for IndicatifPrompter {
    #[instrument(skip(self, url, _config), level = "debug")]
    fn prompt_username_password(
        &mut self,
        url: &str,
        _config: &git2::Config,
    ) -> Option<(String, String)> {
        info!("authentication required at {url}");
        self.bar.suspend(|| -> Option<(String, String)> {
            let username = Text::new("username").prompt().ok()?;
            let password = Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()?;
            Some((username, password))
        })
    }

    #[instrument(skip(self, username, url, _config), level = "debug")]
    fn prompt_password(
        &mut self,
        username: &str,
        url: &str,
        _config: &git2::Config,
    ) -> Option<String> {
        info!("authentication required at {url} for user {username}");
        self.bar.suspend(|| {
            Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }

    #[instrument(skip(self, ssh_key_path, _config), level = "debug")]
    fn prompt_ssh_key_passphrase(
        &mut self,
        ssh_key_path: &Path,
        _config: &git2::Config,
    ) -> Option<String> {
        info!(
            "authentication required with ssh key at {}",
            ssh_key_path.display()
        );
        self.bar.suspend(|| {
            Password::new("passphrase")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }
}

/// Version commit error types.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// Version file cannot be copied into git directory.
    #[error("failed to copy version file {path:?}")]
    CopyVersionFile {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Package manifest cannot provide a version.
    #[error("cannot read version from {path:?}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    /// Branch reference name is not valid UTF-8.
    #[error("branch {0:?} has no usable reference name")]
    InvalidBranch(String),

    /// Merge produced conflicts.
    #[error("merge of {theirs} into {ours} has conflicts")]
    MergeConflict { ours: String, theirs: String },

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
pub type Result<T, E = CommitError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("PROJECT_GIT_DIR", "/srv/site")])]
    fn git_dir_falls_back_to_environment() {
        let commit = VersionCommit::from_settings(&CommitSettings::default(), "/work");
        assert_eq!(commit.git_dir, PathBuf::from("/srv/site"));

        let settings = CommitSettings {
            git_dir: Some("/repo".into()),
            ..Default::default()
        };
        let commit = VersionCommit::from_settings(&settings, "/work");
        assert_eq!(commit.git_dir, PathBuf::from("/repo"));
    }

    #[test]
    fn manifest_path_follows_package_name() {
        let mut commit = VersionCommit::from_settings(
            &CommitSettings {
                git_dir: Some("/repo".into()),
                ..Default::default()
            },
            "/work",
        );
        assert_eq!(commit.manifest_path(), PathBuf::from("/work/package.json"));

        commit.package_name = Some("widgets".into());
        assert_eq!(
            commit.manifest_path(),
            PathBuf::from("/work/packages/widgets/package.json")
        );
    }

    #[test]
    fn manifest_without_version_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("package.json");
        std::fs::write(&path, r#"{ "name": "tools" }"#)?;

        let result = read_package_version(&path);
        assert!(matches!(result, Err(CommitError::Manifest { .. })));

        std::fs::write(&path, r#"{ "name": "tools", "version": "3.1.0" }"#)?;
        assert_eq!(read_package_version(&path)?, "3.1.0");

        Ok(())
    }
}

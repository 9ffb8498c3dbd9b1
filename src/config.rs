// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the `relkit.toml` configuration file to simplify the
//! process of serialization and deserialization. The file is split into three
//! tables, one for each workflow relkit drives: `[release]`, `[commit]`, and
//! `[deploy]`. Every table is optional, so a project that only deploys never
//! needs to say anything about releases.
//!
//! # Shell Expansion
//!
//! Path-like values and secrets are shell expanded after parsing. Thus,
//! `~/.ssh/id_ed25519` and `$SFTP_PASSWORD` both work as expected, which
//! keeps credentials out of the configuration file itself.

use crate::{
    deploy::{CleanupMode, DeployConfig},
    path::home_dir,
};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, instrument};

/// Whole configuration file layout.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct RelkitConfig {
    /// Release sequence settings.
    #[serde(default)]
    pub release: ReleaseSettings,

    /// Version commit settings.
    #[serde(default)]
    pub commit: CommitSettings,

    /// Deployment settings.
    pub deploy: Option<DeploySettings>,
}

impl RelkitConfig {
    /// Load configuration from file.
    ///
    /// A missing file is not an error, it just means defaults are used.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file exists but cannot be read.
    /// - Return [`ConfigError::Deserialize`] if file content is invalid.
    #[instrument(skip(path), level = "debug")]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("no configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = read_to_string(path).map_err(|err| ConfigError::Read {
            source: err,
            path: path.to_path_buf(),
        })?;

        content.parse()
    }
}

impl FromStr for RelkitConfig {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: RelkitConfig = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every path-like or secret field.
        config.commit.git_dir = config.commit.git_dir.map(expand_path).transpose()?;
        if let Some(deploy) = config.deploy.as_mut() {
            deploy.local_root = expand_path(&deploy.local_root)?;
            deploy.extra_files_root = deploy.extra_files_root.as_ref().map(expand_path).transpose()?;

            let connection = &mut deploy.connection;
            connection.password = connection.password.as_deref().map(expand).transpose()?;
            connection.passphrase = connection.passphrase.as_deref().map(expand).transpose()?;
            connection.private_key = connection.private_key.as_ref().map(expand_path).transpose()?;
        }

        Ok(config)
    }
}

impl Display for RelkitConfig {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Release sequence settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReleaseSettings {
    /// Name of the package whose release also commits and deploys.
    pub main_package: Option<String>,

    /// Command used to deploy after a main package release.
    pub deploy_command: String,

    /// Command used to commit version updates after a main package release.
    pub commit_command: String,

    /// Publish package to registry.
    pub publish: bool,

    /// Extra commands to run after building the main package.
    pub before_commit: Vec<String>,
}

impl Default for ReleaseSettings {
    fn default() -> Self {
        Self {
            main_package: None,
            deploy_command: "npm run deploy".into(),
            commit_command: "npm run commit-version".into(),
            publish: true,
            before_commit: Vec::new(),
        }
    }
}

/// Version commit settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CommitSettings {
    /// Git working directory to commit into.
    pub git_dir: Option<PathBuf>,

    /// Workspace package whose manifest carries the version.
    pub package_name: Option<String>,

    /// Development branch.
    pub main_branch: String,

    /// Branch that receives release merges.
    pub release_branch: String,

    /// Files copied into the git directory before committing.
    pub version_files: Vec<PathBuf>,
}

impl Default for CommitSettings {
    fn default() -> Self {
        Self {
            git_dir: None,
            package_name: None,
            main_branch: "main".into(),
            release_branch: "release".into(),
            version_files: Vec::new(),
        }
    }
}

/// Deployment settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct DeploySettings {
    /// Name of live application directory under remote root.
    pub app_name: String,

    /// Remote directory holding the application directory.
    pub remote_root: String,

    /// Local directory to upload.
    pub local_root: PathBuf,

    /// Override for staging directory name.
    pub staging_dir: Option<String>,

    /// Override for backup directory name.
    pub backup_dir: Option<String>,

    /// Stage, promote, and clean up. Otherwise upload straight to live path.
    #[serde(default = "default_true")]
    pub full_deploy: bool,

    /// Upload contents of directory symlinks.
    #[serde(default)]
    pub upload_symlink_targets: bool,

    /// Gitignore style exclusion rules applied relative to local root.
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Glob patterns uploaded directly into live path after promotion.
    #[serde(default)]
    pub extra_files: Vec<String>,

    /// Root the extra file patterns are relative to.
    pub extra_files_root: Option<PathBuf>,

    /// Directories created under live path after promotion.
    #[serde(default)]
    pub post_deploy_directories: Vec<String>,

    /// What to remove once promotion succeeds.
    #[serde(default)]
    pub cleanup: CleanupKind,

    /// Top-level remote root entries protected from cleanup.
    #[serde(default)]
    pub remove_skip_list: Vec<String>,

    /// Local shell command to run after promotion.
    pub after_promote: Option<String>,

    /// SFTP connection settings.
    pub connection: ConnectionSettings,
}

impl DeploySettings {
    /// Build runtime deployment configuration.
    ///
    /// Exclusion rules are compiled into a gitignore matcher rooted at the
    /// local root. The after-promote command, if any, becomes a hook that
    /// runs through the system shell.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Exclude`] if an exclusion rule is invalid.
    pub fn to_deploy_config(&self) -> Result<DeployConfig> {
        let mut config = DeployConfig::new(&self.remote_root, &self.local_root, &self.app_name);
        if let Some(staging) = &self.staging_dir {
            config.staging_dir_name = staging.clone();
        }
        if let Some(backup) = &self.backup_dir {
            config.backup_dir_name = backup.clone();
        }

        config.full_deploy = self.full_deploy;
        config.upload_symlink_targets = self.upload_symlink_targets;
        config.extra_files = self.extra_files.clone();
        config.extra_files_root = self
            .extra_files_root
            .clone()
            .unwrap_or_else(|| self.local_root.clone());
        config.post_deploy_directories = self.post_deploy_directories.clone();
        config.cleanup_mode = match self.cleanup {
            CleanupKind::RemoveBackupOnly => CleanupMode::RemoveBackupOnly,
            CleanupKind::RemoveAllExceptSkipList => CleanupMode::RemoveAllExceptSkipList,
        };
        config.remove_skip_list = self.remove_skip_list.iter().cloned().collect();

        if !self.exclude.is_empty() {
            let matcher = build_exclude_matcher(&self.local_root, &self.exclude)?;
            config.path_filter = Some(Box::new(move |path: &Path| {
                // INVARIANT: Parent matching panics outside matcher root.
                //   - Symlink targets may live anywhere on the local system.
                let is_dir = path.is_dir();
                let matched = if path.starts_with(matcher.path()) {
                    matcher.matched_path_or_any_parents(path, is_dir)
                } else {
                    matcher.matched(path, is_dir)
                };
                !matched.is_ignore()
            }));
        }

        if let Some(command) = self.after_promote.clone() {
            config.after_promote_hook = Some(Box::new(move || run_hook_command(&command)));
        }

        Ok(config)
    }
}

/// Cleanup mode as written in configuration file.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CleanupKind {
    #[default]
    RemoveBackupOnly,
    RemoveAllExceptSkipList,
}

/// SFTP connection settings.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct ConnectionSettings {
    /// Remote host name or address.
    pub host: String,

    /// Remote SSH port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// User to authenticate as.
    pub username: String,

    /// Password authentication.
    pub password: Option<String>,

    /// Private key authentication.
    pub private_key: Option<PathBuf>,

    /// Passphrase for private key.
    pub passphrase: Option<String>,

    /// Transport timeout for every blocking call.
    pub timeout_secs: Option<u64>,
}

fn build_exclude_matcher(root: &Path, rules: &[String]) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(root);
    for rule in rules {
        builder.add_line(None, rule).map_err(ConfigError::Exclude)?;
    }

    builder.build().map_err(ConfigError::Exclude)
}

fn run_hook_command(command: &str) -> anyhow::Result<()> {
    #[cfg(unix)]
    let status = std::process::Command::new("sh").args(["-c", command]).status()?;
    #[cfg(windows)]
    let status = std::process::Command::new("cmd").args(["/C", command]).status()?;

    if !status.success() {
        anyhow::bail!("command {command:?} exited with {status}");
    }

    Ok(())
}

fn expand(value: &str) -> Result<String> {
    let home = || home_dir().ok().map(|path| path.to_string_lossy().into_owned());
    let lookup = |var: &str| std::env::var(var).map(Some);

    Ok(shellexpand::full_with_context(value, home, lookup)
        .map_err(ConfigError::ShellExpansion)?
        .into_owned())
}

fn expand_path(path: impl AsRef<Path>) -> Result<PathBuf> {
    expand(path.as_ref().to_string_lossy().as_ref()).map(PathBuf::from)
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    22
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read configuration at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Exclusion rule cannot be compiled.
    #[error("invalid exclusion rule")]
    Exclude(#[source] ignore::Error),

    /// Configuration lacks a `[deploy]` table.
    #[error("no [deploy] table in configuration")]
    MissingDeploy,
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("SFTP_PASSWORD", "hunter2"), ("DIST", "/srv/build")])]
    fn deserialize_deploy_settings() -> anyhow::Result<()> {
        let result: RelkitConfig = r#"
            [deploy]
            app_name = "shop"
            remote_root = "/var/www"
            local_root = "$DIST"
            exclude = ["*.map"]
            cleanup = "remove-all-except-skip-list"
            remove_skip_list = ["shop", "shared"]

            [deploy.connection]
            host = "example.com"
            username = "deploy"
            password = "$SFTP_PASSWORD"
        "#
        .parse()?;

        let expect = DeploySettings {
            app_name: "shop".into(),
            remote_root: "/var/www".into(),
            local_root: "/srv/build".into(),
            staging_dir: None,
            backup_dir: None,
            full_deploy: true,
            upload_symlink_targets: false,
            exclude: vec!["*.map".into()],
            extra_files: Vec::new(),
            extra_files_root: None,
            post_deploy_directories: Vec::new(),
            cleanup: CleanupKind::RemoveAllExceptSkipList,
            remove_skip_list: vec!["shop".into(), "shared".into()],
            after_promote: None,
            connection: ConnectionSettings {
                host: "example.com".into(),
                port: 22,
                username: "deploy".into(),
                password: Some("hunter2".into()),
                private_key: None,
                passphrase: None,
                timeout_secs: None,
            },
        };

        assert_eq!(result.deploy, Some(expect));
        assert_eq!(result.release, ReleaseSettings::default());
        assert_eq!(result.commit, CommitSettings::default());

        Ok(())
    }

    #[test]
    fn serialize_release_settings() {
        let result = RelkitConfig {
            release: ReleaseSettings {
                main_package: Some("@scope/tools".into()),
                before_commit: vec!["npm run docs".into(), "npm run lint".into()],
                ..Default::default()
            },
            commit: CommitSettings::default(),
            deploy: None,
        }
        .to_string();

        let expect = indoc! {r#"
            [release]
            main_package = "@scope/tools"
            deploy_command = "npm run deploy"
            commit_command = "npm run commit-version"
            publish = true
            before_commit = [
                "npm run docs",
                "npm run lint",
            ]

            [commit]
            main_branch = "main"
            release_branch = "release"
            version_files = []
        "#};

        assert_eq!(result, expect);
    }

    #[test]
    fn deploy_config_derives_directory_names() -> anyhow::Result<()> {
        let settings: RelkitConfig = indoc! {r#"
            [deploy]
            app_name = "shop"
            remote_root = "/var/www"
            local_root = "dist"
            backup_dir = "shop-previous"

            [deploy.connection]
            host = "example.com"
            username = "deploy"
        "#}
        .parse()?;
        let config = settings
            .deploy
            .ok_or(ConfigError::MissingDeploy)?
            .to_deploy_config()?;

        assert_eq!(config.staging_dir_name, "shop-deploy");
        assert_eq!(config.backup_dir_name, "shop-previous");
        assert_eq!(config.extra_files_root, PathBuf::from("dist"));
        assert_eq!(config.cleanup_mode, CleanupMode::RemoveBackupOnly);

        Ok(())
    }

    #[test]
    fn exclusion_rules_become_path_filter() -> anyhow::Result<()> {
        let settings = DeploySettings {
            app_name: "shop".into(),
            remote_root: "/var/www".into(),
            local_root: "/srv/dist".into(),
            staging_dir: None,
            backup_dir: None,
            full_deploy: true,
            upload_symlink_targets: false,
            exclude: vec!["*.map".into()],
            extra_files: Vec::new(),
            extra_files_root: None,
            post_deploy_directories: Vec::new(),
            cleanup: CleanupKind::RemoveBackupOnly,
            remove_skip_list: Vec::new(),
            after_promote: None,
            connection: ConnectionSettings::default(),
        };
        let config = settings.to_deploy_config()?;

        assert!(config.accepts(Path::new("/srv/dist/app.js")));
        assert!(!config.accepts(Path::new("/srv/dist/app.js.map")));

        Ok(())
    }
}

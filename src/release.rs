// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Package release sequence.
//!
//! A release is a fixed sequence of package manager commands: bump the
//! version, refresh dependencies, build, publish, then commit and deploy when
//! the main package is the one being released. Commands run one after the
//! other, and the first one to fail stops the whole sequence.

use crate::config::ReleaseSettings;

use std::process::Command;
use tracing::{info, instrument};

/// Release sequence for one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasePlan {
    pub new_version: String,
    pub package_name: Option<String>,
    pub is_main_package: bool,
    pub deploy_command: String,
    pub commit_command: String,
    pub publish: bool,
    pub before_commit: Vec<String>,
}

impl ReleasePlan {
    /// Construct new release plan from settings.
    ///
    /// Package name falls back to the configured main package. The release
    /// counts as a main package release when the package is the main
    /// package, or when no package is named at all.
    pub fn new(
        new_version: impl Into<String>,
        package_name: Option<String>,
        settings: &ReleaseSettings,
    ) -> Self {
        let package_name = package_name.or_else(|| settings.main_package.clone());
        let is_main_package = match (&package_name, &settings.main_package) {
            (Some(name), Some(main)) => name == main,
            (None, _) => true,
            (Some(_), None) => false,
        };

        Self {
            new_version: new_version.into(),
            package_name,
            is_main_package,
            deploy_command: settings.deploy_command.clone(),
            commit_command: settings.commit_command.clone(),
            publish: settings.publish,
            before_commit: settings.before_commit.clone(),
        }
    }

    /// Commands this plan runs, in order.
    pub fn commands(&self) -> Vec<String> {
        let workspace = self
            .package_name
            .as_ref()
            .map(|name| format!(" -w {name}"))
            .unwrap_or_default();

        let mut commands = vec![
            "npm run all".to_string(),
            format!("npm version {}{workspace}", self.new_version),
            format!("npm install{workspace}"),
            "npm update --save".to_string(),
        ];

        if self.is_main_package {
            commands.push("npm run build-all".into());
            commands.extend(self.before_commit.iter().cloned());
        }

        if self.publish {
            commands.push(format!("npm publish{workspace}"));
        }

        if self.is_main_package {
            commands.push(self.commit_command.clone());
            commands.push(self.deploy_command.clone());
        }

        commands
    }

    /// Run every command through runner.
    ///
    /// # Errors
    ///
    /// - Return [`ReleaseError`] of the first command that fails.
    #[instrument(skip(self, runner), fields(version = %self.new_version), level = "debug")]
    pub fn run(&self, runner: &mut impl CommandRunner) -> Result<()> {
        for command in self.commands() {
            info!("run {command:?}");
            runner.run(&command)?;
        }

        info!("released {}", self.new_version);
        Ok(())
    }
}

/// Run shell command lines.
pub trait CommandRunner {
    /// Run command line to completion.
    fn run(&mut self, command: &str) -> Result<()>;
}

/// Run commands through the system shell, sharing this process' stdio.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&mut self, command: &str) -> Result<()> {
        #[cfg(unix)]
        let mut child = Command::new("sh");
        #[cfg(unix)]
        child.args(["-c", command]);
        #[cfg(windows)]
        let mut child = Command::new("cmd");
        #[cfg(windows)]
        child.args(["/C", command]);

        let status = child
            .spawn()
            .and_then(|mut child| child.wait())
            .map_err(|err| ReleaseError::Spawn {
                source: err,
                command: command.to_string(),
            })?;

        if !status.success() {
            return Err(ReleaseError::CommandFailed {
                command: command.to_string(),
                code: status.code(),
            });
        }

        Ok(())
    }
}

/// Release error types.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    /// Command cannot be started.
    #[error("failed to start {command:?}")]
    Spawn {
        #[source]
        source: std::io::Error,
        command: String,
    },

    /// Command exited unsuccessfully.
    #[error("command {command:?} failed with exit code {}", code.map_or("none".to_string(), |code| code.to_string()))]
    CommandFailed { command: String, code: Option<i32> },
}

impl ReleaseError {
    /// Exit code this process should terminate with.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::CommandFailed {
                code: Some(code), ..
            } if *code != 0 => *code,
            _ => 1,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = ReleaseError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Recorder {
        commands: Vec<String>,
        fail_on: Option<(String, i32)>,
    }

    impl CommandRunner for Recorder {
        fn run(&mut self, command: &str) -> Result<()> {
            self.commands.push(command.to_string());
            match &self.fail_on {
                Some((failing, code)) if failing == command => Err(ReleaseError::CommandFailed {
                    command: command.to_string(),
                    code: Some(*code),
                }),
                _ => Ok(()),
            }
        }
    }

    fn settings() -> ReleaseSettings {
        ReleaseSettings {
            main_package: Some("@scope/tools".into()),
            before_commit: vec!["npm run docs".into()],
            ..Default::default()
        }
    }

    #[test]
    fn main_package_release_commits_and_deploys() -> anyhow::Result<()> {
        let plan = ReleasePlan::new("1.4.0", None, &settings());
        let mut runner = Recorder::default();
        plan.run(&mut runner)?;

        assert!(plan.is_main_package);
        assert_eq!(
            runner.commands,
            vec![
                "npm run all",
                "npm version 1.4.0 -w @scope/tools",
                "npm install -w @scope/tools",
                "npm update --save",
                "npm run build-all",
                "npm run docs",
                "npm publish -w @scope/tools",
                "npm run commit-version",
                "npm run deploy",
            ]
        );

        Ok(())
    }

    #[test]
    fn workspace_package_release_only_publishes() -> anyhow::Result<()> {
        let plan = ReleasePlan::new("0.2.1", Some("widgets".into()), &settings());
        let mut runner = Recorder::default();
        plan.run(&mut runner)?;

        assert!(!plan.is_main_package);
        assert_eq!(
            runner.commands,
            vec![
                "npm run all",
                "npm version 0.2.1 -w widgets",
                "npm install -w widgets",
                "npm update --save",
                "npm publish -w widgets",
            ]
        );

        Ok(())
    }

    #[test]
    fn unnamed_package_release_has_no_workspace_flag() {
        let settings = ReleaseSettings {
            publish: false,
            ..Default::default()
        };
        let plan = ReleasePlan::new("2.0.0", None, &settings);

        assert!(plan.is_main_package);
        assert_eq!(
            plan.commands(),
            vec![
                "npm run all",
                "npm version 2.0.0",
                "npm install",
                "npm update --save",
                "npm run build-all",
                "npm run commit-version",
                "npm run deploy",
            ]
        );
    }

    #[test]
    fn first_failure_stops_sequence_with_its_exit_code() {
        let plan = ReleasePlan::new("1.4.0", None, &settings());
        let mut runner = Recorder {
            fail_on: Some(("npm update --save".into(), 3)),
            ..Default::default()
        };

        let error = plan.run(&mut runner).unwrap_err();

        assert_eq!(error.exit_code(), 3);
        assert_eq!(runner.commands.len(), 4);
    }
}

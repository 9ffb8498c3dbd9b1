// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use relkit::release::{CommandRunner, ReleaseError, ShellRunner};

use pretty_assertions::assert_eq;
use simple_test_case::test_case;

#[cfg(unix)]
#[test_case("exit 3", 3; "exit status passes through")]
#[test_case("exit 1", 1; "plain failure")]
#[test]
fn shell_failure_surfaces_exit_code(command: &str, expected: i32) {
    let error = ShellRunner.run(command).unwrap_err();

    assert!(matches!(error, ReleaseError::CommandFailed { .. }));
    pretty_assertions::assert_eq!(error.exit_code(), expected);
}

#[cfg(unix)]
#[test]
fn shell_success_runs_command() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let marker = dir.path().join("ran");

    ShellRunner.run(&format!("touch {}", marker.display()))?;

    assert!(marker.exists());
    Ok(())
}

#[cfg(unix)]
#[test]
fn signal_killed_command_exits_with_one() {
    let error = ShellRunner.run("kill -9 $$").unwrap_err();

    assert!(matches!(error, ReleaseError::CommandFailed { code: None, .. }));
    assert_eq!(error.exit_code(), 1);
}

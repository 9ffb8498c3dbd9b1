// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::RepoFixture;

use relkit::commit::{CommitError, VersionCommit};

use anyhow::Result;
use indicatif::ProgressBar;
use pretty_assertions::assert_eq;
use std::{fs, path::Path};

fn version_commit(work_dir: &Path, git_dir: &Path) -> VersionCommit {
    VersionCommit {
        work_dir: work_dir.to_path_buf(),
        git_dir: git_dir.to_path_buf(),
        version_files: Vec::new(),
        package_name: None,
        main_branch: "main".into(),
        release_branch: "release".into(),
    }
}

fn manifest(version: &str) -> String {
    format!("{{\n  \"name\": \"tools\",\n  \"version\": \"{version}\"\n}}\n")
}

#[test]
fn commits_merges_and_tags_new_version() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let fixture = RepoFixture::new(dir.path())?;
    fixture.stage_and_commit("package.json", manifest("1.0.0"))?;
    fixture.create_branch("release")?;
    fixture.write("package.json", manifest("1.1.0"))?;

    let version = version_commit(dir.path(), dir.path()).run(&ProgressBar::hidden())?;
    assert_eq!(version, "1.1.0");

    let main = fixture.branch_head("main")?;
    assert_eq!(main.message().map(str::trim), Some("Updated version to 1.1.0"));

    let release = fixture.branch_head("release")?;
    assert_eq!(release.message().map(str::trim), Some("Version 1.1.0"));
    assert_eq!(release.parent_count(), 2);
    assert_eq!(release.tree_id(), main.tree_id());

    let tag = fixture
        .repo()
        .find_reference("refs/tags/v.1.1.0")?
        .peel_to_tag()?;
    assert_eq!(tag.message().map(str::trim), Some("Version 1.1.0"));
    assert_eq!(tag.target_id(), release.id());

    assert_eq!(fixture.repo().head()?.shorthand(), Some("main"));
    assert_eq!(fs::read_to_string(dir.path().join("package.json"))?, manifest("1.1.0"));

    Ok(())
}

#[test]
fn copies_version_files_into_separate_git_dir() -> Result<()> {
    let work = tempfile::tempdir()?;
    let git = tempfile::tempdir()?;
    let fixture = RepoFixture::new(git.path())?;
    fixture.stage_and_commit("package.json", manifest("0.2.0"))?;
    fixture.create_branch("release")?;

    fs::write(work.path().join("package.json"), manifest("0.3.0"))?;
    fs::create_dir_all(work.path().join("packages/widgets"))?;
    fs::write(work.path().join("packages/widgets/package.json"), manifest("0.3.0"))?;

    let mut commit = version_commit(work.path(), git.path());
    commit.version_files = vec!["package.json".into()];
    commit.package_name = Some("widgets".into());
    commit.run(&ProgressBar::hidden())?;

    assert_eq!(fs::read_to_string(git.path().join("package.json"))?, manifest("0.3.0"));
    assert!(fixture.repo().find_reference("refs/tags/v.0.3.0").is_ok());

    Ok(())
}

#[test]
fn nothing_to_commit_still_tags_release() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let fixture = RepoFixture::new(dir.path())?;
    fixture.stage_and_commit("package.json", manifest("1.0.0"))?;
    fixture.create_branch("release")?;
    let before = fixture.branch_head("main")?.id();

    version_commit(dir.path(), dir.path()).run(&ProgressBar::hidden())?;

    assert_eq!(fixture.branch_head("main")?.id(), before);
    assert_eq!(fixture.branch_head("release")?.id(), before);
    let tag = fixture
        .repo()
        .find_reference("refs/tags/v.1.0.0")?
        .peel_to_tag()?;
    assert_eq!(tag.target_id(), before);

    Ok(())
}

#[test]
fn pulls_release_branch_from_origin_before_merge() -> Result<()> {
    let upstream_dir = tempfile::tempdir()?;
    let local_dir = tempfile::tempdir()?;
    let upstream = RepoFixture::new(upstream_dir.path())?;
    upstream.stage_and_commit("package.json", manifest("1.0.0"))?;
    upstream.create_branch("release")?;

    let local = RepoFixture::clone_from(upstream_dir.path(), local_dir.path())?;
    local.track_remote_branch("release")?;

    // INVARIANT: Upstream release moves ahead after local clone.
    let release_ref = upstream
        .repo()
        .find_branch("release", git2::BranchType::Local)?
        .get()
        .name()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("release branch has no name"))?;
    upstream.repo().set_head(&release_ref)?;
    upstream.stage_and_commit("CHANGELOG.md", "# Changes\n")?;
    upstream.repo().set_head("refs/heads/main")?;

    local.write("package.json", manifest("1.1.0"))?;
    version_commit(local_dir.path(), local_dir.path()).run(&ProgressBar::hidden())?;

    let release = local.branch_head("release")?;
    let tree = release.tree()?;
    assert!(tree.get_name("CHANGELOG.md").is_some());
    assert_eq!(release.parent_count(), 2);

    Ok(())
}

#[test]
fn missing_release_branch_aborts() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let fixture = RepoFixture::new(dir.path())?;
    fixture.stage_and_commit("package.json", manifest("1.0.0"))?;
    fixture.write("package.json", manifest("1.0.1"))?;

    let result = version_commit(dir.path(), dir.path()).run(&ProgressBar::hidden());

    assert!(matches!(result, Err(CommitError::Git2(_))));
    assert!(fixture.repo().find_reference("refs/tags/v.1.0.1").is_err());

    Ok(())
}

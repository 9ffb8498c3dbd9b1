// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Remote paths are always POSIX style strings, because the SFTP protocol
//! speaks in forward slashes no matter what the local platform uses. Local
//! paths stay [`Path`]s for as long as possible.

use std::path::{Path, PathBuf};

/// Default name of the configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "relkit.toml";

/// Determine absolute path to user's home directory.
///
/// Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or(NoWayHome)
}

/// Join remote path segments with forward slashes.
///
/// Empty segments are skipped, and duplicate separators at the seams are
/// collapsed. A leading slash on the first segment is preserved.
pub fn remote_join<I, S>(root: impl AsRef<str>, parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut joined = root.as_ref().trim_end_matches('/').to_string();
    for part in parts {
        let part = part.as_ref().trim_matches('/');
        if part.is_empty() {
            continue;
        }

        if !joined.is_empty() || root.as_ref().starts_with('/') {
            joined.push('/');
        }
        joined.push_str(part);
    }

    if joined.is_empty() && root.as_ref().starts_with('/') {
        joined.push('/');
    }

    joined
}

/// Convert relative local path to remote path segment.
///
/// Local separators are replaced with forward slashes.
pub fn to_remote_segment(path: impl AsRef<Path>) -> String {
    path.as_ref()
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Last segment of a remote path.
pub fn remote_file_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

/// Parent of a remote path, if it has one.
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(index) => Some(&trimmed[..index]),
        None => None,
    }
}

/// Top-level name of a path relative to some root, lower-cased.
///
/// Used to compare entries against a skip list, where names are matched
/// case-insensitively.
pub fn first_path_part(path: &str, root: &str) -> String {
    let relative = path
        .strip_prefix(root)
        .map(|rest| rest.trim_start_matches(['/', '\\']))
        .unwrap_or(path);

    relative
        .split(['/', '\\'])
        .find(|part| !part.is_empty())
        .unwrap_or_default()
        .to_lowercase()
}

/// Identity key for a local directory.
///
/// Two directories are considered the same when their absolute forms match
/// after separators are normalized and case is folded.
pub fn dir_key(path: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());

    absolute
        .to_string_lossy()
        .replace('\\', "/")
        .trim_end_matches('/')
        .to_lowercase()
}

/// No way to determine user's home directory.
///
/// # See Also
///
/// - [`dirs::home_dir`](https://docs.rs/dirs/latest/dirs/fn.home_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's home directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[test_case("/var/www", &["app"], "/var/www/app"; "plain join")]
    #[test_case("/var/www/", &["/app/", "logs"], "/var/www/app/logs"; "separators collapse")]
    #[test_case("/", &["app"], "/app"; "filesystem root")]
    #[test_case("www", &["", "app"], "www/app"; "relative root with empty part")]
    #[test_case("/", &[], "/"; "nothing to join")]
    #[test]
    fn remote_join_segments(root: &str, parts: &[&str], expect: &str) {
        pretty_assertions::assert_eq!(remote_join(root, parts), expect);
    }

    #[test_case("/var/www/app", "/var/www", "app"; "direct child")]
    #[test_case("/var/www/App/index.html", "/var/www", "app"; "nested entry folds case")]
    #[test_case("Shared", "/var/www", "shared"; "bare name")]
    #[test_case("dist\\assets\\a.js", "dist", "assets"; "windows separators")]
    #[test]
    fn first_path_part_extraction(path: &str, root: &str, expect: &str) {
        pretty_assertions::assert_eq!(first_path_part(path, root), expect);
    }

    #[test]
    fn remote_parent_and_name() {
        assert_eq!(remote_parent("/var/www/app"), Some("/var/www"));
        assert_eq!(remote_parent("/app"), Some("/"));
        assert_eq!(remote_parent("app"), None);
        assert_eq!(remote_file_name("/var/www/app/"), "app");
    }

    #[test]
    fn dir_key_ignores_case_and_trailing_separator() {
        assert_eq!(dir_key("/Projects/Site/"), dir_key("/projects/site"));
    }
}

// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Release automation for JavaScript workspaces.
//!
//! Relkit covers the three chores that follow writing the code:
//!
//! 1. __Release__: bump a package version and run the fixed sequence of
//!    package manager commands that builds and publishes it. See [`release`].
//! 2. __Version commit__: commit the new version, merge it into the release
//!    branch, and tag it. See [`commit`].
//! 3. __Deploy__: upload a built tree to a remote host over SFTP through a
//!    staging directory, keeping a backup of the previous release and
//!    restoring it when something goes wrong. See [`deploy`].
//!
//! # Deployment Slots
//!
//! A deployment juggles three sibling directories under the remote root: the
//! live __app__ directory, a __staging__ directory that receives the upload,
//! and a __backup__ directory that holds the previous release while the new
//! one is promoted. Two renames swap a fully uploaded release into place, so
//! the live directory is never half written.
//!
//! # See Also
//!
//! 1. [`config`] for the `relkit.toml` layout.
//! 2. [`remote::RemoteFileStore`] for the remote filesystem seam.

pub mod commit;
pub mod config;
pub mod deploy;
pub mod path;
pub mod progress;
pub mod release;
pub mod remote;
pub mod scan;

pub use config::RelkitConfig;
pub use deploy::{DeployConfig, DeployError, DeployOrchestrator};
pub use release::{ReleaseError, ReleasePlan};

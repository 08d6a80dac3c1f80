// -*- coding: utf-8 -*-
//
// Copyright (C) 2025 - 2026 Michael Büsch <m@bues.ch>
//
// Licensed under the Apache License version 2.0
// or the MIT license, at your option.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::{generate, needs_policy};
use anyhow::{self as ah, Context as _};
use devlend_container::{Container, RuntimeFeatures};
use std::{
    fs::{DirBuilder, Permissions, remove_file},
    io::Write as _,
    os::unix::fs::{DirBuilderExt as _, PermissionsExt as _},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;

/// The on-disk store of generated policy documents.
///
/// Profiles are never cached and are unloaded automatically when the
/// container's monitor task dies, so the store only ever writes the
/// current document and does not track modification times.
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    /// Create a store below the daemon state root.
    pub fn new(state_root: &Path) -> Self {
        Self {
            dir: state_root.join("security").join("seccomp"),
        }
    }

    /// The path of a container's policy document.
    pub fn profile_path(&self, container: &dyn Container) -> PathBuf {
        self.dir.join(container.name())
    }

    /// Generate and write the policy document for a container.
    ///
    /// Does nothing if the container configuration does not require a
    /// policy. The document is written atomically with mode 0600.
    pub fn create(&self, container: &dyn Container, features: &RuntimeFeatures) -> ah::Result<()> {
        if !needs_policy(container) {
            return Ok(());
        }

        let policy = generate(container, features)?;

        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.dir)
            .context("Create seccomp profile directory")?;

        let mut tmpfile =
            NamedTempFile::new_in(&self.dir).context("Create temporary profile file")?;
        tmpfile
            .write_all(policy.as_bytes())
            .context("Write profile")?;
        tmpfile
            .as_file()
            .set_permissions(Permissions::from_mode(0o600))
            .context("Set profile mode")?;
        tmpfile
            .persist(self.profile_path(container))
            .context("Persist profile")?;

        Ok(())
    }

    /// Remove a container's policy document.
    ///
    /// Removal is best-effort. A container that has never been started
    /// has no profile and that is fine.
    pub fn delete(&self, container: &dyn Container) {
        let _ = remove_file(self.profile_path(container));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devlend_container::{StaticContainer, arch::Arch};
    use std::fs::{metadata, read_to_string};

    fn features() -> RuntimeFeatures {
        RuntimeFeatures {
            seccomp_notify: true,
            shiftfs: false,
            running_in_userns: false,
        }
    }

    #[test]
    fn test_create_and_delete() {
        let tmpdir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(tmpdir.path());

        let mut c = StaticContainer::new("testct", Arch::X86_64);
        c.set_config_key("security.syscalls.whitelist", "read\nwrite\n");

        store.create(&c, &features()).unwrap();

        let path = store.profile_path(&c);
        assert_eq!(
            path,
            tmpdir.path().join("security").join("seccomp").join("testct")
        );
        let content = read_to_string(&path).unwrap();
        assert_eq!(content, "2\nwhitelist\n[all]\nread\nwrite\n");

        let mode = metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o600);

        store.delete(&c);
        assert!(!path.exists());

        // Deleting a profile that does not exist is not an error.
        store.delete(&c);
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let tmpdir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(tmpdir.path());

        let mut c = StaticContainer::new("testct", Arch::X86_64);
        c.set_config_key("security.syscalls.blacklist_compat", "true");

        store.create(&c, &features()).unwrap();
        let first = read_to_string(store.profile_path(&c)).unwrap();

        store.create(&c, &features()).unwrap();
        let second = read_to_string(store.profile_path(&c)).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_no_profile_needed() {
        let tmpdir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(tmpdir.path());

        let mut c = StaticContainer::new("testct", Arch::X86_64);
        c.set_config_key("security.syscalls.blacklist_default", "false");

        store.create(&c, &features()).unwrap();
        assert!(!store.profile_path(&c).exists());
    }
}

// vim: ts=4 sw=4 expandtab

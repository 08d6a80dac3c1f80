// -*- coding: utf-8 -*-
//
// Copyright (C) 2025 - 2026 Michael Büsch <m@bues.ch>
//
// Licensed under the Apache License version 2.0
// or the MIT license, at your option.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Mediated device node creation.
//!
//! The node is not created by this process. An external helper binary
//! re-enters the requester's namespaces and performs the mknod there:
//!
//! `<helper> forkmknod <pid> <path> <mode> <dev> <hostpath> <uid> <gid> <permissions-only 0|1>`
//!
//! On failure the helper reports the errno as a decimal integer on
//! stderr. The reserved value `ENOANO` means "not my verdict" and falls
//! through to the default denial. `ENOMEDIUM` is passed up to request
//! deferred device registration.

use anyhow::{self as ah, Context as _};
use devlend_container::DeviceNode;
use log::debug;
use std::{
    fs::{read_link, read_to_string},
    path::{Path, PathBuf},
};
use tokio::process::Command;

pub struct MknodExecutor {
    helper: PathBuf,
}

impl MknodExecutor {
    pub fn new(helper: PathBuf) -> Self {
        Self { helper }
    }

    /// Create the device node on behalf of the requesting process.
    ///
    /// With `permissions_only` the helper verifies the request but does
    /// not create the node.
    ///
    /// Returns zero on success or the negated errno for the syscall
    /// response.
    pub async fn mknod(&self, dev: &mut DeviceNode, permissions_only: bool) -> i32 {
        let pid = dev.pid;

        let Ok(root_path) = read_link(format!("/proc/{pid}/root")) else {
            return -libc::EPERM;
        };
        let Ok((uid, gid)) = task_uid_gid(pid) else {
            return -libc::EPERM;
        };

        dev.host_path = if dev.path.is_absolute() {
            join_container_path(&root_path, None, &dev.path)
        } else {
            let Ok(cwd) = read_link(format!("/proc/{pid}/cwd")) else {
                return -libc::EPERM;
            };
            join_container_path(&root_path, Some(&cwd), &dev.path)
        };

        debug!(
            "forkmknod: pid={pid} path={:?} hostpath={:?} mode={:o} dev={} permonly={permissions_only}",
            dev.path, dev.host_path, dev.mode, dev.dev,
        );

        let output = Command::new(&self.helper)
            .arg("forkmknod")
            .arg(pid.to_string())
            .arg(&dev.path)
            .arg(dev.mode.to_string())
            .arg(dev.dev.to_string())
            .arg(&dev.host_path)
            .arg(uid.to_string())
            .arg(gid.to_string())
            .arg(if permissions_only { "1" } else { "0" })
            .output()
            .await;
        let Ok(output) = output else {
            return -libc::EPERM;
        };
        if output.status.success() {
            return 0;
        }

        // The last stderr token is the helper's errno.
        // ENOANO is not a verdict, it falls through to the denial.
        let stderr = String::from_utf8_lossy(&output.stderr);
        if let Some(errno) = stderr
            .split_whitespace()
            .last()
            .and_then(|token| token.parse::<i32>().ok())
        {
            if errno != libc::ENOANO {
                return -errno;
            }
        }

        -libc::EPERM
    }
}

/// Get the effective uid and gid of a task.
fn task_uid_gid(pid: libc::pid_t) -> ah::Result<(u32, u32)> {
    let status = read_to_string(format!("/proc/{pid}/status")).context("Read process status")?;
    parse_status_uid_gid(&status)
}

/// Extract the effective uid and gid from /proc/<pid>/status content.
fn parse_status_uid_gid(status: &str) -> ah::Result<(u32, u32)> {
    let mut uid = None;
    let mut gid = None;

    for line in status.lines() {
        if uid.is_some() && gid.is_some() {
            break;
        }
        // Fields are: real, effective, saved, filesystem.
        if let Some(fields) = line.strip_prefix("Uid:") {
            uid = Some(
                fields
                    .split_whitespace()
                    .nth(1)
                    .context("Get effective uid")?
                    .parse()
                    .context("Parse effective uid")?,
            );
        } else if let Some(fields) = line.strip_prefix("Gid:") {
            gid = Some(
                fields
                    .split_whitespace()
                    .nth(1)
                    .context("Get effective gid")?
                    .parse()
                    .context("Parse effective gid")?,
            );
        }
    }

    Ok((
        uid.context("No Uid line in process status")?,
        gid.context("No Gid line in process status")?,
    ))
}

/// Resolve the requested path to a path on the host.
///
/// An absolute request resolves below the requester's root. A relative
/// request additionally goes through the requester's cwd, with the root
/// prefix stripped off first.
fn join_container_path(root: &Path, cwd: Option<&Path>, path: &Path) -> PathBuf {
    match cwd {
        None => {
            let rel = path.strip_prefix("/").unwrap_or(path);
            root.join(rel)
        }
        Some(cwd) => {
            let rel_cwd = cwd
                .strip_prefix(root)
                .unwrap_or_else(|_| cwd.strip_prefix("/").unwrap_or(cwd));
            root.join(rel_cwd).join(path)
        }
    }
}


// vim: ts=4 sw=4 expandtab

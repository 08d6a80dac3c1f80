// -*- coding: utf-8 -*-
//
// Copyright (C) 2025 - 2026 Michael Büsch <m@bues.ch>
//
// Licensed under the Apache License version 2.0
// or the MIT license, at your option.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! This crate generates the textual seccomp policy documents that the
//! container runtime compiles and loads into each container.
//!
//! A policy document starts with the protocol version line `2`,
//! followed by a mode selector (`whitelist` or `blacklist`),
//! architecture scopes (`[all]` or `[<arch>]`) and rule lines of the
//! form `<syscall> <action> [<arg-predicate>...]`.
//!
//! The document content is driven entirely by the container's expanded
//! configuration keys, so generation is deterministic: the same
//! configuration always produces the byte-identical document.

#![forbid(unsafe_code)]

mod profile;

pub use profile::ProfileStore;

use anyhow as ah;
use devlend_container::{Container, RuntimeFeatures};

/// Policy document version header.
pub const SECCOMP_HEADER: &str = "2\n";

/// The built-in default denylist.
pub const DEFAULT_SECCOMP_POLICY: &str = "\
reject_force_umount  # comment this to allow umount -f;  not recommended
[all]
kexec_load errno 38
open_by_handle_at errno 38
init_module errno 38
finit_module errno 38
delete_module errno 38
";

/// The notification rules routing device node creation to the broker.
///
/// The argument predicates mask the mode with `S_IFMT` (61440) and match
/// character (8192) and block (24576) device requests.
pub const SECCOMP_NOTIFY_POLICY: &str = "\
mknod notify [1,8192,SCMP_CMP_MASKED_EQ,61440]
mknod notify [1,24576,SCMP_CMP_MASKED_EQ,61440]
mknodat notify [2,8192,SCMP_CMP_MASKED_EQ,61440]
mknodat notify [2,24576,SCMP_CMP_MASKED_EQ,61440]
";

/// The compat-layer denylist body.
///
/// Scoped to the container's architecture by [compat_blocking_policy].
pub const COMPAT_BLOCKING_POLICY: &str = "\
compat_sys_rt_sigaction errno 38
stub_x32_rt_sigreturn errno 38
compat_sys_ioctl errno 38
compat_sys_readv errno 38
compat_sys_writev errno 38
compat_sys_recvfrom errno 38
compat_sys_sendmsg errno 38
compat_sys_recvmsg errno 38
stub_x32_execve errno 38
compat_sys_ptrace errno 38
compat_sys_rt_sigpending errno 38
compat_sys_rt_sigtimedwait errno 38
compat_sys_rt_sigqueueinfo errno 38
compat_sys_sigaltstack errno 38
compat_sys_timer_create errno 38
compat_sys_mq_notify errno 38
compat_sys_kexec_load errno 38
compat_sys_waitid errno 38
compat_sys_set_robust_list errno 38
compat_sys_get_robust_list errno 38
compat_sys_vmsplice errno 38
compat_sys_move_pages errno 38
compat_sys_preadv64 errno 38
compat_sys_pwritev64 errno 38
compat_sys_rt_tgsigqueueinfo errno 38
compat_sys_recvmmsg errno 38
compat_sys_sendmmsg errno 38
compat_sys_process_vm_readv errno 38
compat_sys_process_vm_writev errno 38
compat_sys_setsockopt errno 38
compat_sys_getsockopt errno 38
compat_sys_io_setup errno 38
compat_sys_io_submit errno 38
stub_x32_execveat errno 38
";

/// The compat-layer denylist, scoped to one architecture.
pub fn compat_blocking_policy(arch_name: &str) -> String {
    format!("[{arch_name}]\n{COMPAT_BLOCKING_POLICY}")
}

/// Interpret a configuration value as a true boolean.
///
/// Everything that is not an affirmative keyword is false.
pub fn is_true(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// Check whether a container needs a seccomp policy document at all.
pub fn needs_policy(container: &dyn Container) -> bool {
    let config = container.expanded_config();

    let keys = [
        "raw.seccomp",
        "security.syscalls.whitelist",
        "security.syscalls.blacklist",
    ];
    for key in keys {
        if config.contains_key(key) {
            return true;
        }
    }

    if config
        .get("security.syscalls.blacklist_compat")
        .is_some_and(|v| is_true(v))
    {
        return true;
    }

    // The default denylist is enabled by default, so an absent key
    // means "true".
    match config.get("security.syscalls.blacklist_default") {
        None => true,
        Some(value) => is_true(value),
    }
}

/// Generate the policy document for a container.
///
/// The same container configuration always yields the byte-identical
/// document.
pub fn generate(container: &dyn Container, features: &RuntimeFeatures) -> ah::Result<String> {
    let config = container.expanded_config();

    // A raw policy overrides everything, verbatim and without a header.
    if let Some(raw) = config.get("raw.seccomp") {
        if !raw.is_empty() {
            return Ok(raw.clone());
        }
    }

    let mut policy = String::from(SECCOMP_HEADER);

    if let Some(whitelist) = config.get("security.syscalls.whitelist") {
        if !whitelist.is_empty() {
            policy += "whitelist\n[all]\n";
            policy += whitelist;
            return Ok(policy);
        }
    }

    policy += "blacklist\n";

    let default_enabled = match config.get("security.syscalls.blacklist_default") {
        None => true,
        Some(value) => is_true(value),
    };
    if default_enabled {
        policy += DEFAULT_SECCOMP_POLICY;
    }

    if !container.is_privileged() && !features.running_in_userns && features.seccomp_notify {
        policy += SECCOMP_NOTIFY_POLICY;
    }

    if config
        .get("security.syscalls.blacklist_compat")
        .is_some_and(|v| is_true(v))
    {
        policy += &compat_blocking_policy(container.architecture().name());
    }

    if let Some(blacklist) = config.get("security.syscalls.blacklist") {
        policy += blacklist;
    }

    Ok(policy)
}


// vim: ts=4 sw=4 expandtab

// -*- coding: utf-8 -*-
//
// Copyright (C) 2025 - 2026 Michael Büsch <m@bues.ch>
//
// Licensed under the Apache License version 2.0
// or the MIT license, at your option.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{self as ah, Context as _};
use devlend_seccomp::{Filter, Seccomp, seccomp_supported};
use log::{info, warn};

const SECCOMP_FILTER_KILL: &[u8] =
    include_bytes!(concat!(env!("OUT_DIR"), "/seccomp_filter_kill.bpf"));
const SECCOMP_FILTER_LOG: &[u8] =
    include_bytes!(concat!(env!("OUT_DIR"), "/seccomp_filter_log.bpf"));

/// Apply the daemon's own syscall allow-list.
pub fn install_seccomp_rules(seccomp: Seccomp) -> ah::Result<()> {
    // See build.rs for the filter definition.
    let filter_bytes = match seccomp {
        Seccomp::Log => SECCOMP_FILTER_LOG,
        Seccomp::Kill => SECCOMP_FILTER_KILL,
        Seccomp::Off => return Ok(()),
    };

    if seccomp_supported() {
        info!("Seccomp mode: {seccomp}");
        assert!(!filter_bytes.is_empty());
        Filter::deserialize(filter_bytes)
            .install()
            .context("Install seccomp filter")?;
    } else {
        warn!(
            "Not using seccomp. \
            devlendd does not support self-confinement on this architecture, yet."
        );
    }

    Ok(())
}

// vim: ts=4 sw=4 expandtab

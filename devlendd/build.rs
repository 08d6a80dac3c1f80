// -*- coding: utf-8 -*-
//
// Copyright (C) 2025 - 2026 Michael Büsch <m@bues.ch>
//
// Licensed under the Apache License version 2.0
// or the MIT license, at your option.
// SPDX-License-Identifier: Apache-2.0 OR MIT

#![forbid(unsafe_code)]

use build_target::target_arch;
use devlend_seccomp::{Allow, Filter};
use std::path::Path;

const SECCOMP_ALLOW_LIST: [Allow; 13] = [
    Allow::Signal,
    Allow::EventLoop,
    Allow::UnixAccept,
    Allow::Recv,
    Allow::Send,
    Allow::ProcRead,
    Allow::Write,
    Allow::Spawn,
    Allow::Chmod,
    Allow::Unlink,
    // Inherited by the forkmknod helper child.
    Allow::ForkMknod,
    Allow::Ioctl,
    Allow::Futex,
];

fn main() {
    let arch = target_arch().expect("Failed to get build target architecture");
    let out_dir = std::env::var("OUT_DIR").expect("OUT_DIR is not set");

    // Precompile the seccomp filters.
    Filter::precompile(&SECCOMP_ALLOW_LIST, arch.as_str(), Path::new(&out_dir))
        .expect("Failed to precompile seccomp BPF");
}

// vim: ts=4 sw=4 expandtab

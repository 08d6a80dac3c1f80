// -*- coding: utf-8 -*-
//
// Copyright (C) 2025 - 2026 Michael Büsch <m@bues.ch>
//
// Licensed under the Apache License version 2.0
// or the MIT license, at your option.
// SPDX-License-Identifier: Apache-2.0 OR MIT

fn probe_syscall(ac: &autocfg::AutoCfg, name: &str) {
    ac.emit_path_cfg(&format!("libc::SYS_{name}"), &format!("has_SYS_{name}"));
    println!("cargo:rustc-check-cfg=cfg(has_SYS_{name})");
}

fn main() {
    let ac = autocfg::new();

    probe_syscall(&ac, "mmap");
    probe_syscall(&ac, "mmap2");
    probe_syscall(&ac, "futex_waitv");

    // seccompiler can only compile for these architectures.
    let target_arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    if target_arch == "x86_64" || target_arch == "aarch64" {
        println!("cargo:rustc-cfg=has_seccomp_support");
    }
    println!("cargo:rustc-check-cfg=cfg(has_seccomp_support)");

    autocfg::rerun_path("build.rs");
}

// vim: ts=4 sw=4 expandtab

// -*- coding: utf-8 -*-
//
// Copyright (C) 2025 - 2026 Michael Büsch <m@bues.ch>
//
// Licensed under the Apache License version 2.0
// or the MIT license, at your option.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Seccomp self-sandboxing of the `devlendd` broker daemon.
//!
//! This is not the policy the broker generates for containers.
//! It is the allow-list filter the daemon installs onto itself,
//! built from abstract [Allow] features and precompiled to BPF
//! at build time.
//!
//! The filter is inherited by the forkmknod helper child, so the
//! child's syscalls are part of the allow-list as well.

#![forbid(unsafe_code)]

#[cfg(not(any(target_os = "linux", target_os = "android")))]
std::compile_error!("devlend-seccomp does not support non-Linux platforms.");

use anyhow::{self as ah, Context as _, format_err as err};
use seccompiler::{BpfProgram, apply_filter_all_threads, sock_filter};
use std::path::Path;

/// Returns `true` if seccomp self-sandboxing is supported on this platform.
pub fn seccomp_supported() -> bool {
    cfg!(has_seccomp_support)
}

/// The daemon self-sandboxing mode.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Seccomp {
    /// Seccomp is disabled (default).
    #[default]
    Off,

    /// Seccomp is enabled with logging only.
    ///
    /// The event will be logged, if a syscall is called that is not allowed.
    /// See the Linux kernel logs for seccomp audit messages.
    Log,

    /// Seccomp is enabled with killing (recommended).
    ///
    /// The process will be killed, if a syscall is called that is not allowed.
    Kill,
}

impl std::fmt::Display for Seccomp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Self::Off => write!(f, "Off"),
            Self::Log => write!(f, "Logging only"),
            Self::Kill => write!(f, "Process killing"),
        }
    }
}

impl std::str::FromStr for Seccomp {
    type Err = ah::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().trim() {
            "off" => Ok(Self::Off),
            "log" => Ok(Self::Log),
            "kill" => Ok(Self::Kill),
            other => Err(err!(
                "Seccomp mode '{other}' is not valid. Valid values are: off, log, kill."
            )),
        }
    }
}

/// Abstract allow-list features.
///
/// Each feature covers one activity of the broker daemon and maps to
/// the syscalls that activity performs.
#[derive(Clone, Copy, Debug)]
pub enum Allow {
    /// Signal handler installation and delivery (daemon shutdown,
    /// SIGCHLD driven child reaping).
    Signal,
    /// The async reactor: epoll and the waker eventfd.
    EventLoop,
    /// Accepting peers on the Unix notification socket, including
    /// binding it. The socket syscall itself is restricted to the
    /// Unix domain.
    UnixAccept,
    /// Receiving records, including ancillary fd payloads.
    Recv,
    /// Sending response records.
    Send,
    /// Reading /proc files of intercepted peers: status, the root and
    /// cwd symlinks and positional mem reads.
    ProcRead,
    /// Plain writes: log output and the pidfile.
    Write,
    /// Spawning the forkmknod helper and reaping it.
    Spawn,
    /// Restricting the socket path permissions.
    Chmod,
    /// Unlinking the socket path on stop.
    Unlink,
    /// The forkmknod helper child: enter the container namespaces,
    /// create the node, hand it to the owner.
    ForkMknod,
    /// Miscellaneous fd ioctls (non-blocking setup).
    Ioctl,
    /// Userspace locking and parking.
    Futex,
}

/// Syscall number as the BPF rule map keys it.
#[cfg(has_seccomp_support)]
fn nr(sys: libc::c_long) -> i64 {
    sys as i64
}

/// The syscalls every process of this daemon's shape needs, no matter
/// which features are enabled: allocator, thread bookkeeping, process
/// identity and clocks.
#[cfg(has_seccomp_support)]
fn baseline_syscalls() -> Vec<i64> {
    let mut sys = vec![
        // Allocator.
        nr(libc::SYS_brk),
        nr(libc::SYS_mremap),
        nr(libc::SYS_munmap),
        nr(libc::SYS_madvise),
        nr(libc::SYS_mprotect),
        // Fd hygiene.
        nr(libc::SYS_close),
        nr(libc::SYS_close_range),
        // Process exit.
        nr(libc::SYS_exit),
        nr(libc::SYS_exit_group),
        // Identity queries, cheap and used all over libc.
        nr(libc::SYS_getpid),
        nr(libc::SYS_gettid),
        nr(libc::SYS_getuid),
        nr(libc::SYS_geteuid),
        nr(libc::SYS_getgid),
        nr(libc::SYS_getegid),
        // Hasher seeds.
        nr(libc::SYS_getrandom),
        // Thread and runtime startup.
        nr(libc::SYS_sched_getaffinity),
        nr(libc::SYS_set_tid_address),
        nr(libc::SYS_rseq),
        nr(libc::SYS_sigaltstack),
        // Timestamps for the log output and the reactor.
        nr(libc::SYS_clock_gettime),
        nr(libc::SYS_clock_getres),
    ];
    #[cfg(has_SYS_mmap)]
    sys.push(nr(libc::SYS_mmap));
    #[cfg(has_SYS_mmap2)]
    sys.push(nr(libc::SYS_mmap2));
    #[cfg(target_arch = "x86_64")]
    sys.push(nr(libc::SYS_arch_prctl));
    sys
}

#[cfg(has_seccomp_support)]
impl Allow {
    /// The syscalls this feature admits.
    fn syscalls(self) -> Vec<i64> {
        let mut sys = match self {
            Self::Signal => vec![
                nr(libc::SYS_rt_sigaction),
                nr(libc::SYS_rt_sigprocmask),
                nr(libc::SYS_rt_sigreturn),
            ],
            Self::EventLoop => vec![
                nr(libc::SYS_epoll_create1),
                nr(libc::SYS_epoll_ctl),
                nr(libc::SYS_epoll_pwait),
                nr(libc::SYS_eventfd2),
                nr(libc::SYS_ppoll),
                nr(libc::SYS_pselect6),
            ],
            Self::UnixAccept => vec![
                nr(libc::SYS_bind),
                nr(libc::SYS_listen),
                nr(libc::SYS_accept4),
                nr(libc::SYS_getsockopt),
                nr(libc::SYS_getpeername),
            ],
            Self::Recv => vec![
                nr(libc::SYS_recvmsg),
                nr(libc::SYS_recvfrom),
                nr(libc::SYS_recvmmsg),
            ],
            Self::Send => vec![
                nr(libc::SYS_sendmsg),
                nr(libc::SYS_sendto),
                nr(libc::SYS_sendmmsg),
            ],
            Self::ProcRead => vec![
                nr(libc::SYS_openat),
                nr(libc::SYS_read),
                nr(libc::SYS_pread64),
                nr(libc::SYS_readv),
                nr(libc::SYS_lseek),
                nr(libc::SYS_readlinkat),
                nr(libc::SYS_fstat),
                nr(libc::SYS_statx),
                nr(libc::SYS_newfstatat),
            ],
            Self::Write => vec![nr(libc::SYS_write), nr(libc::SYS_writev)],
            Self::Spawn => vec![
                nr(libc::SYS_pipe2),
                nr(libc::SYS_dup),
                nr(libc::SYS_dup3),
                nr(libc::SYS_fcntl),
                nr(libc::SYS_clone),
                nr(libc::SYS_clone3),
                nr(libc::SYS_execve),
                nr(libc::SYS_execveat),
                nr(libc::SYS_wait4),
                nr(libc::SYS_prlimit64),
            ],
            Self::Chmod => vec![nr(libc::SYS_fchmod), nr(libc::SYS_fchmodat)],
            Self::Unlink => vec![nr(libc::SYS_unlinkat)],
            Self::ForkMknod => vec![
                nr(libc::SYS_mknodat),
                nr(libc::SYS_setns),
                nr(libc::SYS_fchown),
                nr(libc::SYS_fchownat),
            ],
            Self::Ioctl => vec![nr(libc::SYS_ioctl)],
            Self::Futex => vec![
                nr(libc::SYS_futex),
                nr(libc::SYS_get_robust_list),
                nr(libc::SYS_set_robust_list),
            ],
        };

        // Legacy aliases that only exist on the old syscall table.
        #[cfg(target_arch = "x86_64")]
        sys.extend(match self {
            Self::EventLoop => vec![nr(libc::SYS_epoll_wait), nr(libc::SYS_epoll_pwait2)],
            Self::ProcRead => vec![nr(libc::SYS_open), nr(libc::SYS_readlink)],
            Self::Spawn => vec![nr(libc::SYS_pipe), nr(libc::SYS_dup2)],
            Self::Chmod => vec![nr(libc::SYS_chmod)],
            Self::Unlink => vec![nr(libc::SYS_unlink)],
            Self::ForkMknod => vec![nr(libc::SYS_mknod), nr(libc::SYS_chown)],
            _ => vec![],
        });

        #[cfg(has_SYS_futex_waitv)]
        if matches!(self, Self::Futex) {
            sys.push(nr(libc::SYS_futex_waitv));
        }

        sys
    }
}

/// Action to be performed, if a syscall is executed that is not in the allow-list.
#[derive(Clone, Copy, Debug)]
pub enum Action {
    /// Kill the process.
    Kill,
    /// Only log the event and keep running. See the kernel logs.
    Log,
}

/// Name of the precompiled kill-mode filter file.
pub const FILTER_FILE_KILL: &str = "seccomp_filter_kill.bpf";

/// Name of the precompiled log-mode filter file.
pub const FILTER_FILE_LOG: &str = "seccomp_filter_log.bpf";

/// A compiled seccomp filter program.
pub struct Filter(BpfProgram);

impl Filter {
    #[cfg(has_seccomp_support)]
    pub fn compile_for_arch(allow: &[Allow], deny_action: Action, arch: &str) -> ah::Result<Self> {
        use seccompiler::{
            SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition, SeccompFilter,
            SeccompRule,
        };
        use std::collections::BTreeMap;

        assert!(!allow.is_empty());

        let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
        for sys in baseline_syscalls() {
            rules.entry(sys).or_default();
        }
        for feature in allow {
            for sys in feature.syscalls() {
                rules.entry(sys).or_default();
            }
        }

        // Creating sockets is only ever needed for the Unix domain.
        if allow.iter().any(|feature| matches!(feature, Allow::UnixAccept)) {
            let unix_only = SeccompRule::new(vec![SeccompCondition::new(
                0,
                SeccompCmpArgLen::Dword,
                SeccompCmpOp::Eq,
                libc::AF_UNIX as u64,
            )?])?;
            rules
                .entry(nr(libc::SYS_socket))
                .or_default()
                .push(unix_only);
        }

        let filter = SeccompFilter::new(
            rules,
            match deny_action {
                Action::Kill => SeccompAction::KillProcess,
                Action::Log => SeccompAction::Log,
            },
            SeccompAction::Allow,
            arch.try_into().context("Unsupported CPU ARCH")?,
        )
        .context("Create seccomp filter")?;

        let filter: BpfProgram = filter.try_into().context("Seccomp to BPF")?;

        Ok(Self(filter))
    }

    #[cfg(not(has_seccomp_support))]
    pub fn compile_for_arch(
        _allow: &[Allow],
        _deny_action: Action,
        _arch: &str,
    ) -> ah::Result<Self> {
        Err(err!("seccomp is not supported on this platform"))
    }

    /// Whether filters can be compiled for the given CPU architecture.
    pub fn arch_supported(arch: &str) -> bool {
        matches!(arch, "x86_64" | "aarch64")
    }

    /// Compile the allow-list for both deny actions and write the raw
    /// BPF programs to `out_dir`.
    ///
    /// For architectures without seccomp support empty filter files are
    /// written, so that `include_bytes!` consumers always link.
    pub fn precompile(allow: &[Allow], arch: &str, out_dir: &Path) -> ah::Result<()> {
        for (deny_action, file) in [(Action::Kill, FILTER_FILE_KILL), (Action::Log, FILTER_FILE_LOG)]
        {
            let bytes = if Self::arch_supported(arch) {
                Self::compile_for_arch(allow, deny_action, arch)?.serialize()
            } else {
                vec![]
            };
            std::fs::write(out_dir.join(file), bytes)
                .context("Write precompiled seccomp filter")?;
        }
        Ok(())
    }

    /// Serialize the BPF program to raw bytes.
    ///
    /// One 8-byte host-endian `sock_filter` instruction per chunk.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.0.len() * 8);
        for insn in &self.0 {
            buf.extend_from_slice(&insn.code.to_ne_bytes());
            buf.push(insn.jt);
            buf.push(insn.jf);
            buf.extend_from_slice(&insn.k.to_ne_bytes());
        }
        buf
    }

    /// Deserialize a raw BPF program that [Filter::serialize] produced.
    ///
    /// Panics on malformed input. The input always is a precompiled
    /// build artifact, never external data.
    pub fn deserialize(buf: &[u8]) -> Self {
        assert_eq!(buf.len() % 8, 0, "Truncated BPF program");
        let prog = buf
            .chunks_exact(8)
            .map(|chunk| sock_filter {
                code: u16::from_ne_bytes(chunk[0..2].try_into().unwrap()),
                jt: chunk[2],
                jf: chunk[3],
                k: u32::from_ne_bytes(chunk[4..8].try_into().unwrap()),
            })
            .collect();
        Self(prog)
    }

    /// Install this filter for all threads of the process.
    pub fn install(&self) -> ah::Result<()> {
        apply_filter_all_threads(&self.0).context("Apply seccomp filter")
    }
}


// vim: ts=4 sw=4 expandtab

// -*- coding: utf-8 -*-
//
// Copyright (C) 2025 - 2026 Michael Büsch <m@bues.ch>
//
// Licensed under the Apache License version 2.0
// or the MIT license, at your option.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Architecture identifiers and the per-architecture syscall numbers
//! of the device node creation syscalls.

// Audit architecture identifiers, as the kernel reports them in
// `seccomp_data.arch`. Composed from the ELF machine id and the
// audit flag bits, the same way linux/audit.h composes them.
const AUDIT_ARCH_64BIT: u32 = 0x8000_0000;
const AUDIT_ARCH_LE: u32 = 0x4000_0000;
const AUDIT_ARCH_CONVENTION_MIPS64_N32: u32 = 0x2000_0000;

const EM_SPARC: u32 = 2;
const EM_386: u32 = 3;
const EM_MIPS: u32 = 8;
const EM_PPC: u32 = 20;
const EM_PPC64: u32 = 21;
const EM_S390: u32 = 22;
const EM_ARM: u32 = 40;
const EM_SPARCV9: u32 = 43;
const EM_X86_64: u32 = 62;
const EM_AARCH64: u32 = 183;

pub const AUDIT_ARCH_X86_64: u32 = EM_X86_64 | AUDIT_ARCH_64BIT | AUDIT_ARCH_LE;
pub const AUDIT_ARCH_I386: u32 = EM_386 | AUDIT_ARCH_LE;
pub const AUDIT_ARCH_AARCH64: u32 = EM_AARCH64 | AUDIT_ARCH_64BIT | AUDIT_ARCH_LE;
pub const AUDIT_ARCH_ARM: u32 = EM_ARM | AUDIT_ARCH_LE;
pub const AUDIT_ARCH_ARMEB: u32 = EM_ARM;
pub const AUDIT_ARCH_S390: u32 = EM_S390;
pub const AUDIT_ARCH_S390X: u32 = EM_S390 | AUDIT_ARCH_64BIT;
pub const AUDIT_ARCH_PPC: u32 = EM_PPC;
pub const AUDIT_ARCH_PPC64: u32 = EM_PPC64 | AUDIT_ARCH_64BIT;
pub const AUDIT_ARCH_PPC64LE: u32 = EM_PPC64 | AUDIT_ARCH_64BIT | AUDIT_ARCH_LE;
pub const AUDIT_ARCH_SPARC: u32 = EM_SPARC;
pub const AUDIT_ARCH_SPARC64: u32 = EM_SPARCV9 | AUDIT_ARCH_64BIT;
pub const AUDIT_ARCH_MIPS: u32 = EM_MIPS;
pub const AUDIT_ARCH_MIPSEL: u32 = EM_MIPS | AUDIT_ARCH_LE;
pub const AUDIT_ARCH_MIPS64: u32 = EM_MIPS | AUDIT_ARCH_64BIT;
pub const AUDIT_ARCH_MIPS64N32: u32 =
    EM_MIPS | AUDIT_ARCH_64BIT | AUDIT_ARCH_CONVENTION_MIPS64_N32;
pub const AUDIT_ARCH_MIPSEL64: u32 = EM_MIPS | AUDIT_ARCH_64BIT | AUDIT_ARCH_LE;
pub const AUDIT_ARCH_MIPSEL64N32: u32 =
    EM_MIPS | AUDIT_ARCH_64BIT | AUDIT_ARCH_LE | AUDIT_ARCH_CONVENTION_MIPS64_N32;

/// The syscall numbers of the device node creation syscalls
/// on one architecture.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NotifySyscalls {
    /// `mknod`, if the architecture has it.
    pub nr_mknod: Option<i32>,
    /// `mknodat`.
    pub nr_mknodat: i32,
}

/// Per-architecture syscall numbers, ordered by likelihood of usage.
static NOTIFY_SYSCALL_TABLE: [(u32, NotifySyscalls); 18] = [
    (
        AUDIT_ARCH_X86_64,
        NotifySyscalls {
            nr_mknod: Some(133),
            nr_mknodat: 259,
        },
    ),
    (
        AUDIT_ARCH_I386,
        NotifySyscalls {
            nr_mknod: Some(14),
            nr_mknodat: 297,
        },
    ),
    (
        AUDIT_ARCH_AARCH64,
        NotifySyscalls {
            nr_mknod: None,
            nr_mknodat: 33,
        },
    ),
    (
        AUDIT_ARCH_ARM,
        NotifySyscalls {
            nr_mknod: Some(14),
            nr_mknodat: 324,
        },
    ),
    (
        AUDIT_ARCH_ARMEB,
        NotifySyscalls {
            nr_mknod: Some(14),
            nr_mknodat: 324,
        },
    ),
    (
        AUDIT_ARCH_S390,
        NotifySyscalls {
            nr_mknod: Some(14),
            nr_mknodat: 290,
        },
    ),
    (
        AUDIT_ARCH_S390X,
        NotifySyscalls {
            nr_mknod: Some(14),
            nr_mknodat: 290,
        },
    ),
    (
        AUDIT_ARCH_PPC,
        NotifySyscalls {
            nr_mknod: Some(14),
            nr_mknodat: 288,
        },
    ),
    (
        AUDIT_ARCH_PPC64,
        NotifySyscalls {
            nr_mknod: Some(14),
            nr_mknodat: 288,
        },
    ),
    (
        AUDIT_ARCH_PPC64LE,
        NotifySyscalls {
            nr_mknod: Some(14),
            nr_mknodat: 288,
        },
    ),
    (
        AUDIT_ARCH_SPARC,
        NotifySyscalls {
            nr_mknod: Some(14),
            nr_mknodat: 286,
        },
    ),
    (
        AUDIT_ARCH_SPARC64,
        NotifySyscalls {
            nr_mknod: Some(14),
            nr_mknodat: 286,
        },
    ),
    (
        AUDIT_ARCH_MIPS,
        NotifySyscalls {
            nr_mknod: Some(14),
            nr_mknodat: 290,
        },
    ),
    (
        AUDIT_ARCH_MIPSEL,
        NotifySyscalls {
            nr_mknod: Some(14),
            nr_mknodat: 290,
        },
    ),
    (
        AUDIT_ARCH_MIPS64,
        NotifySyscalls {
            nr_mknod: Some(131),
            nr_mknodat: 249,
        },
    ),
    (
        AUDIT_ARCH_MIPS64N32,
        NotifySyscalls {
            nr_mknod: Some(131),
            nr_mknodat: 253,
        },
    ),
    (
        AUDIT_ARCH_MIPSEL64,
        NotifySyscalls {
            nr_mknod: Some(131),
            nr_mknodat: 249,
        },
    ),
    (
        AUDIT_ARCH_MIPSEL64N32,
        NotifySyscalls {
            nr_mknod: Some(131),
            nr_mknodat: 253,
        },
    ),
];

/// Look up the device node creation syscall numbers of an audit architecture.
///
/// Returns `None` for unknown architectures.
pub fn notify_syscalls(audit_arch: u32) -> Option<NotifySyscalls> {
    NOTIFY_SYSCALL_TABLE
        .iter()
        .find(|(arch, _)| *arch == audit_arch)
        .map(|(_, nrs)| *nrs)
}

/// A container's configured CPU architecture.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Arch {
    I686,
    #[default]
    X86_64,
    Armv7l,
    Aarch64,
    Ppc,
    Ppc64,
    Ppc64le,
    S390x,
    Mips,
    Mips64,
    Riscv64,
}

impl Arch {
    /// The canonical architecture name, as used in policy documents.
    pub fn name(&self) -> &'static str {
        match self {
            Self::I686 => "i686",
            Self::X86_64 => "x86_64",
            Self::Armv7l => "armv7l",
            Self::Aarch64 => "aarch64",
            Self::Ppc => "powerpc",
            Self::Ppc64 => "powerpc64",
            Self::Ppc64le => "ppc64le",
            Self::S390x => "s390x",
            Self::Mips => "mips",
            Self::Mips64 => "mips64",
            Self::Riscv64 => "riscv64",
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_constants() {
        // Spot-check against the values in linux/audit.h.
        assert_eq!(AUDIT_ARCH_X86_64, 0xC000003E);
        assert_eq!(AUDIT_ARCH_I386, 0x40000003);
        assert_eq!(AUDIT_ARCH_AARCH64, 0xC00000B7);
        assert_eq!(AUDIT_ARCH_ARM, 0x40000028);
        assert_eq!(AUDIT_ARCH_S390X, 0x80000016);
        assert_eq!(AUDIT_ARCH_PPC64LE, 0xC0000015);
    }

    #[test]
    fn test_syscall_table() {
        let nrs = notify_syscalls(AUDIT_ARCH_X86_64).unwrap();
        assert_eq!(nrs.nr_mknod, Some(133));
        assert_eq!(nrs.nr_mknodat, 259);

        // aarch64 never had a plain mknod syscall.
        let nrs = notify_syscalls(AUDIT_ARCH_AARCH64).unwrap();
        assert_eq!(nrs.nr_mknod, None);
        assert_eq!(nrs.nr_mknodat, 33);

        assert!(notify_syscalls(0xDEAD_BEEF).is_none());
    }

    #[test]
    fn test_arch_names() {
        assert_eq!(Arch::X86_64.name(), "x86_64");
        assert_eq!(Arch::Aarch64.to_string(), "aarch64");
    }
}

// vim: ts=4 sw=4 expandtab

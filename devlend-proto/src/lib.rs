// -*- coding: utf-8 -*-
//
// Copyright (C) 2025 - 2026 Michael Büsch <m@bues.ch>
//
// Licensed under the Apache License version 2.0
// or the MIT license, at your option.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! This crate implements the seccomp notification proxy protocol
//! spoken between the container side and the `devlendd` broker daemon.
//!
//! Serializing messages to a raw byte record and
//! deserializing raw byte records to messages is implemented here.
//!
//! The records embed the kernel's `seccomp_notif` and `seccomp_notif_resp`
//! structures. Their layout is the kernel ABI of the running machine:
//! all integers are host-endian and the padding matches the C structures.

#[cfg(not(any(target_os = "linux", target_os = "android")))]
std::compile_error!("devlend-proto does not support non-Linux platforms.");

use anyhow::{self as ah, Context as _, format_err as err};

/// Size of the proxy message header.
pub const SECCOMP_PROXY_MSG_SIZE: usize = 32;

/// Size of the kernel `struct seccomp_data`.
pub const SECCOMP_DATA_SIZE: usize = 64;

/// Size of the kernel `struct seccomp_notif`.
pub const SECCOMP_NOTIF_SIZE: usize = 16 + SECCOMP_DATA_SIZE;

/// Size of the kernel `struct seccomp_notif_resp`.
pub const SECCOMP_RESP_SIZE: usize = 24;

/// Maximum size of the trailing cookie.
pub const SECCOMP_COOKIE_SIZE: usize = 64;

/// Minimum size of one proxy record: header + notification + response.
pub const SECCOMP_MSG_SIZE_MIN: usize =
    SECCOMP_PROXY_MSG_SIZE + SECCOMP_NOTIF_SIZE + SECCOMP_RESP_SIZE;

/// Maximum size of one proxy record: minimum plus a full cookie.
pub const SECCOMP_MSG_SIZE_MAX: usize = SECCOMP_MSG_SIZE_MIN + SECCOMP_COOKIE_SIZE;

/// Byte offset of the embedded `seccomp_notif` in the record.
pub const SECCOMP_MSG_OFFS_NOTIF: usize = SECCOMP_PROXY_MSG_SIZE;

/// Byte offset of the embedded `seccomp_notif_resp` in the record.
pub const SECCOMP_MSG_OFFS_RESP: usize = SECCOMP_MSG_OFFS_NOTIF + SECCOMP_NOTIF_SIZE;

/// Byte offset of the cookie in the record.
pub const SECCOMP_MSG_OFFS_COOKIE: usize = SECCOMP_MSG_OFFS_RESP + SECCOMP_RESP_SIZE;

/// Byte offset of the `reserved` field in the proxy header.
const MSG_OFFS_RESERVED: usize = 0;

/// Byte offset of the `monitor_pid` field in the proxy header.
const MSG_OFFS_MONITOR_PID: usize = 8;

/// Byte offset of the `init_pid` field in the proxy header.
const MSG_OFFS_INIT_PID: usize = 12;

/// Byte offset of the sizes triple in the proxy header.
const MSG_OFFS_SIZES: usize = 16;

/// Byte offset of the `cookie_len` field in the proxy header.
/// Bytes 22..24 are C structure padding.
const MSG_OFFS_COOKIE_LEN: usize = 24;

#[inline]
fn serialize_u16(buf: &mut [u8], value: u16) {
    buf[0..2].copy_from_slice(&value.to_ne_bytes());
}

#[inline]
fn serialize_u32(buf: &mut [u8], value: u32) {
    buf[0..4].copy_from_slice(&value.to_ne_bytes());
}

#[inline]
fn serialize_u64(buf: &mut [u8], value: u64) {
    buf[0..8].copy_from_slice(&value.to_ne_bytes());
}

#[inline]
fn deserialize_u16(buf: &[u8]) -> u16 {
    u16::from_ne_bytes(buf[0..2].try_into().unwrap())
}

#[inline]
fn deserialize_u32(buf: &[u8]) -> u32 {
    u32::from_ne_bytes(buf[0..4].try_into().unwrap())
}

#[inline]
fn deserialize_u64(buf: &[u8]) -> u64 {
    u64::from_ne_bytes(buf[0..8].try_into().unwrap())
}

/// The kernel's view of the sizes of the three seccomp notification
/// structures, as reported by `seccomp(SECCOMP_GET_NOTIF_SIZES)`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct NotifySizes {
    pub notif: u16,
    pub notif_resp: u16,
    pub data: u16,
}

impl NotifySizes {
    /// The sizes this crate has been compiled for.
    pub const fn native() -> Self {
        Self {
            notif: SECCOMP_NOTIF_SIZE as u16,
            notif_resp: SECCOMP_RESP_SIZE as u16,
            data: SECCOMP_DATA_SIZE as u16,
        }
    }

    /// Query the kernel for its seccomp notification structure sizes.
    ///
    /// Fails if the kernel does not support seccomp user notification or
    /// if any reported size differs from this crate's compiled-in layout.
    /// In both cases the notification protocol must not be spoken.
    pub fn probe() -> ah::Result<Self> {
        const SECCOMP_GET_NOTIF_SIZES: libc::c_int = 3;

        let mut raw: [u16; 3] = [0; 3];
        // SAFETY: The kernel writes exactly three u16 to the passed buffer.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_seccomp,
                SECCOMP_GET_NOTIF_SIZES,
                0,
                raw.as_mut_ptr(),
            )
        };
        if ret != 0 {
            return Err(std::io::Error::last_os_error())
                .context("Query kernel for seccomp notifier sizes");
        }

        let sizes = Self {
            notif: raw[0],
            notif_resp: raw[1],
            data: raw[2],
        };
        if sizes != Self::native() {
            return Err(err!(
                "The kernel seccomp notification sizes {sizes:?} \
                 do not match the compiled-in sizes {:?}.",
                Self::native()
            ));
        }
        Ok(sizes)
    }
}

/// Proxy message header.
///
/// This precedes the embedded kernel structures in every record.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ProxyHeader {
    /// Reserved. Must be zero.
    pub reserved: u64,
    /// The pid of the container monitor process.
    pub monitor_pid: i32,
    /// The pid of the container's init process.
    pub init_pid: i32,
    /// The structure sizes the sender has been compiled with.
    pub sizes: NotifySizes,
    /// Length of the trailing cookie, in bytes.
    pub cookie_len: u64,
}

impl ProxyHeader {
    /// Serialize this header into the first [SECCOMP_PROXY_MSG_SIZE] bytes of `buf`.
    pub fn serialize(&self, buf: &mut [u8]) {
        assert!(buf.len() >= SECCOMP_PROXY_MSG_SIZE);
        serialize_u64(&mut buf[MSG_OFFS_RESERVED..], self.reserved);
        serialize_u32(&mut buf[MSG_OFFS_MONITOR_PID..], self.monitor_pid as u32);
        serialize_u32(&mut buf[MSG_OFFS_INIT_PID..], self.init_pid as u32);
        serialize_u16(&mut buf[MSG_OFFS_SIZES..], self.sizes.notif);
        serialize_u16(&mut buf[MSG_OFFS_SIZES + 2..], self.sizes.notif_resp);
        serialize_u16(&mut buf[MSG_OFFS_SIZES + 4..], self.sizes.data);
        serialize_u64(&mut buf[MSG_OFFS_COOKIE_LEN..], self.cookie_len);
    }

    /// Deserialize a header from the first [SECCOMP_PROXY_MSG_SIZE] bytes of `buf`.
    pub fn deserialize(buf: &[u8]) -> ah::Result<Self> {
        if buf.len() < SECCOMP_PROXY_MSG_SIZE {
            return Err(err!("Deserialize: Proxy header is truncated."));
        }
        Ok(Self {
            reserved: deserialize_u64(&buf[MSG_OFFS_RESERVED..]),
            monitor_pid: deserialize_u32(&buf[MSG_OFFS_MONITOR_PID..]) as i32,
            init_pid: deserialize_u32(&buf[MSG_OFFS_INIT_PID..]) as i32,
            sizes: NotifySizes {
                notif: deserialize_u16(&buf[MSG_OFFS_SIZES..]),
                notif_resp: deserialize_u16(&buf[MSG_OFFS_SIZES + 2..]),
                data: deserialize_u16(&buf[MSG_OFFS_SIZES + 4..]),
            },
            cookie_len: deserialize_u64(&buf[MSG_OFFS_COOKIE_LEN..]),
        })
    }
}

/// The kernel `struct seccomp_data`: the intercepted syscall.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SeccompData {
    /// Syscall number.
    pub nr: i32,
    /// Audit architecture identifier (`AUDIT_ARCH_*`).
    pub arch: u32,
    /// Instruction pointer at the time of the syscall.
    pub instruction_pointer: u64,
    /// The six raw syscall arguments.
    pub args: [u64; 6],
}

/// The kernel `struct seccomp_notif`: one suspended syscall.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SeccompNotif {
    /// Unique notification id. Must be echoed in the response.
    pub id: u64,
    /// The pid of the process that made the syscall.
    pub pid: u32,
    /// Notification flags.
    pub flags: u32,
    /// The intercepted syscall.
    pub data: SeccompData,
}

impl SeccompNotif {
    /// Serialize this notification into the first [SECCOMP_NOTIF_SIZE] bytes of `buf`.
    pub fn serialize(&self, buf: &mut [u8]) {
        assert!(buf.len() >= SECCOMP_NOTIF_SIZE);
        serialize_u64(&mut buf[0..], self.id);
        serialize_u32(&mut buf[8..], self.pid);
        serialize_u32(&mut buf[12..], self.flags);
        serialize_u32(&mut buf[16..], self.data.nr as u32);
        serialize_u32(&mut buf[20..], self.data.arch);
        serialize_u64(&mut buf[24..], self.data.instruction_pointer);
        for (i, arg) in self.data.args.iter().enumerate() {
            serialize_u64(&mut buf[32 + (i * 8)..], *arg);
        }
    }

    /// Deserialize a notification from the first [SECCOMP_NOTIF_SIZE] bytes of `buf`.
    pub fn deserialize(buf: &[u8]) -> ah::Result<Self> {
        if buf.len() < SECCOMP_NOTIF_SIZE {
            return Err(err!("Deserialize: seccomp_notif is truncated."));
        }
        let mut args = [0; 6];
        for (i, arg) in args.iter_mut().enumerate() {
            *arg = deserialize_u64(&buf[32 + (i * 8)..]);
        }
        Ok(Self {
            id: deserialize_u64(&buf[0..]),
            pid: deserialize_u32(&buf[8..]),
            flags: deserialize_u32(&buf[12..]),
            data: SeccompData {
                nr: deserialize_u32(&buf[16..]) as i32,
                arch: deserialize_u32(&buf[20..]),
                instruction_pointer: deserialize_u64(&buf[24..]),
                args,
            },
        })
    }
}

/// The kernel `struct seccomp_notif_resp`: the verdict for one notification.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SeccompNotifResp {
    /// The id of the notification this responds to.
    pub id: u64,
    /// Return value of the emulated syscall.
    pub val: i64,
    /// Negated errno, or zero for success.
    pub error: i32,
    /// Response flags.
    pub flags: u32,
}

impl SeccompNotifResp {
    /// Serialize this response into the first [SECCOMP_RESP_SIZE] bytes of `buf`.
    pub fn serialize(&self, buf: &mut [u8]) {
        assert!(buf.len() >= SECCOMP_RESP_SIZE);
        serialize_u64(&mut buf[0..], self.id);
        serialize_u64(&mut buf[8..], self.val as u64);
        serialize_u32(&mut buf[16..], self.error as u32);
        serialize_u32(&mut buf[20..], self.flags);
    }

    /// Deserialize a response from the first [SECCOMP_RESP_SIZE] bytes of `buf`.
    pub fn deserialize(buf: &[u8]) -> ah::Result<Self> {
        if buf.len() < SECCOMP_RESP_SIZE {
            return Err(err!("Deserialize: seccomp_notif_resp is truncated."));
        }
        Ok(Self {
            id: deserialize_u64(&buf[0..]),
            val: deserialize_u64(&buf[8..]) as i64,
            error: deserialize_u32(&buf[16..]) as i32,
            flags: deserialize_u32(&buf[20..]),
        })
    }
}


// vim: ts=4 sw=4 expandtab

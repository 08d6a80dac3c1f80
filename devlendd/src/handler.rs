// -*- coding: utf-8 -*-
//
// Copyright (C) 2025 - 2026 Michael Büsch <m@bues.ch>
//
// Licensed under the Apache License version 2.0
// or the MIT license, at your option.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Decoding and answering one seccomp notification.

use crate::{devices::device_allowed, executor::MknodExecutor, notification::Notification};
use devlend_container::{ContainerRegistry, DeviceNode, RuntimeFeatures, arch::notify_syscalls};
use devlend_proto::SeccompNotif;
use log::{debug, error, warn};
use std::{
    ffi::OsStr,
    io,
    os::fd::OwnedFd,
    os::unix::ffi::OsStrExt as _,
    path::PathBuf,
    sync::Arc,
};
use tokio::io::unix::AsyncFd;

/// Positional reads from the memory of the intercepted process.
pub trait PeerMem {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

/// [PeerMem] backed by a received `/proc/<pid>/mem` fd.
pub struct FdMem<'a>(pub &'a OwnedFd);

impl PeerMem for FdMem<'_> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let offset: libc::off_t = offset
            .try_into()
            .map_err(|_| io::Error::from_raw_os_error(libc::EFAULT))?;
        nix::sys::uio::pread(self.0, buf, offset).map_err(io::Error::from)
    }
}

/// Read the NUL terminated syscall path argument from the peer's memory.
fn read_peer_path(mem: &dyn PeerMem, addr: u64) -> Result<PathBuf, i32> {
    let mut buf = [0; libc::PATH_MAX as usize];
    let count = match mem.read_at(&mut buf, addr) {
        Ok(count) => count,
        Err(e) => return Err(-e.raw_os_error().unwrap_or(libc::EPERM)),
    };
    let Some(nul) = buf[..count].iter().position(|c| *c == 0) else {
        return Err(-libc::EPERM);
    };
    Ok(PathBuf::from(OsStr::from_bytes(&buf[..nul])))
}

/// Decode an intercepted syscall into a device node request.
///
/// Returns the negated errno to respond with, if the request is not a
/// whitelisted device node creation. The whitelist check runs before
/// any peer memory is read.
pub(crate) fn decode_device_request(
    req: &SeccompNotif,
    mem: &dyn PeerMem,
) -> Result<DeviceNode, i32> {
    let Some(nrs) = notify_syscalls(req.data.arch) else {
        return Err(-libc::EPERM);
    };

    let (path_addr, mode, dev) = if nrs.nr_mknod == Some(req.data.nr) {
        // mknod(path, mode, dev)
        (req.data.args[0], req.data.args[1] as u32, req.data.args[2])
    } else if nrs.nr_mknodat == req.data.nr {
        // mknodat(dirfd, path, mode, dev)
        if req.data.args[0] as i32 != libc::AT_FDCWD {
            return Err(-libc::EINVAL);
        }
        (req.data.args[1], req.data.args[2] as u32, req.data.args[3])
    } else {
        return Err(-libc::EPERM);
    };

    device_allowed(dev, mode)?;

    let path = read_peer_path(mem, path_addr)?;
    Ok(DeviceNode::new(path, mode, dev, req.pid as libc::pid_t))
}

/// Answers validated notifications.
pub struct SeccompHandler {
    registry: Arc<dyn ContainerRegistry>,
    executor: MknodExecutor,
    features: RuntimeFeatures,
}

impl SeccompHandler {
    pub fn new(
        registry: Arc<dyn ContainerRegistry>,
        executor: MknodExecutor,
        features: RuntimeFeatures,
    ) -> Self {
        Self {
            registry,
            executor,
            features,
        }
    }

    /// Handle one validated notification and send its response.
    ///
    /// Runs concurrently with further receives on the same socket.
    /// The response is one atomic record, so concurrent handlers may
    /// interleave without tearing.
    pub async fn handle(&self, sock: &AsyncFd<OwnedFd>, mut siov: Notification) {
        let pid = siov.peer_pid();
        debug!("Handling seccomp notification from: pid={pid}");
        if !siov.cookie().is_empty() {
            // The cookie is reserved for out-of-band correlation.
            debug!("Ignoring {} cookie bytes: pid={pid}", siov.cookie().len());
        }

        let neg_errno = self.process(&siov).await;

        if let Err(e) = siov.send_response(sock, neg_errno).await {
            warn!("Seccomp client pid={pid}: {e}");
            return;
        }
        debug!("Handled seccomp notification from: pid={pid}");
    }

    async fn process(&self, siov: &Notification) -> i32 {
        let req = siov.request();

        let Some(mem_fd) = siov.mem_fd() else {
            warn!(
                "Seccomp notification without mem fd: pid={}",
                siov.peer_pid()
            );
            return -libc::EPERM;
        };

        let mut dev = match decode_device_request(&req, &FdMem(mem_fd)) {
            Ok(dev) => dev,
            Err(neg_errno) => return neg_errno,
        };

        let monitor_pid = siov.header().monitor_pid;
        let Some(container) = self.registry.find_by_monitor_pid(monitor_pid) else {
            debug!("No container found for monitor pid {monitor_pid}");
            return -libc::EPERM;
        };
        let Ok(disk_idmap) = container.has_disk_idmap() else {
            return -libc::EPERM;
        };

        // An unprivileged container on a shifted filesystem without a
        // disk id mapping cannot take the node directly. Probe the
        // request first, then register the node for the next start.
        let permissions_only = self.features.shiftfs && !container.is_privileged() && !disk_idmap;

        let mut ret = self.executor.mknod(&mut dev, permissions_only).await;
        if ret == -libc::ENOMEDIUM {
            let name = format!("forkmknod.unix.{}", dev.pid);
            ret = match container.insert_seccomp_unix_device(&name, &dev) {
                Ok(()) => 0,
                Err(e) => {
                    warn!(
                        "Failed to register device node with container {}: {e}",
                        container.name()
                    );
                    -libc::EPERM
                }
            };
        }

        if ret != 0 {
            error!(
                "Failed to inject device node into container {} (errno = {})",
                container.name(),
                -ret
            );
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::make_record;
    use devlend_container::{
        Container, StaticContainer, StaticRegistry,
        arch::{AUDIT_ARCH_AARCH64, AUDIT_ARCH_X86_64, Arch},
    };
    use devlend_proto::{
        NotifySizes, ProxyHeader, SECCOMP_MSG_OFFS_RESP, SECCOMP_MSG_SIZE_MIN, SeccompData,
        SeccompNotifResp,
    };
    use nix::sys::socket::{
        AddressFamily, MsgFlags, SockFlag, SockType, UnixCredentials, recv, socketpair,
    };
    use std::{
        fs::{set_permissions, write},
        io::Write as _,
        os::fd::AsRawFd as _,
        os::unix::fs::PermissionsExt as _,
        path::Path,
    };

    struct BufMem {
        base: u64,
        data: Vec<u8>,
    }

    impl PeerMem for BufMem {
        fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
            let Some(start) = offset.checked_sub(self.base) else {
                return Err(io::Error::from_raw_os_error(libc::EFAULT));
            };
            let start = start as usize;
            if start >= self.data.len() {
                return Err(io::Error::from_raw_os_error(libc::EFAULT));
            }
            let count = (self.data.len() - start).min(buf.len());
            buf[..count].copy_from_slice(&self.data[start..start + count]);
            Ok(count)
        }
    }

    /// Proves that rejects happen before any peer memory access.
    struct NoMemAccess;

    impl PeerMem for NoMemAccess {
        fn read_at(&self, _buf: &mut [u8], _offset: u64) -> io::Result<usize> {
            panic!("Peer memory must not be read");
        }
    }

    struct ErrMem(i32);

    impl PeerMem for ErrMem {
        fn read_at(&self, _buf: &mut [u8], _offset: u64) -> io::Result<usize> {
            Err(io::Error::from_raw_os_error(self.0))
        }
    }

    fn mknod_req(arch: u32, nr: i32, args: [u64; 6]) -> SeccompNotif {
        SeccompNotif {
            id: 0xABCD,
            pid: std::process::id(),
            flags: 0,
            data: SeccompData {
                nr,
                arch,
                instruction_pointer: 0,
                args,
            },
        }
    }

    fn null_dev() -> u64 {
        libc::makedev(1, 3)
    }

    fn chr_mode() -> u64 {
        (libc::S_IFCHR | 0o666) as u64
    }

    #[test]
    fn test_decode_mknod() {
        let mem = BufMem {
            base: 0x1000,
            data: b"/dev/null\0garbage".to_vec(),
        };
        let req = mknod_req(
            AUDIT_ARCH_X86_64,
            133,
            [0x1000, chr_mode(), null_dev(), 0, 0, 0],
        );
        let dev = decode_device_request(&req, &mem).unwrap();
        assert_eq!(dev.path, PathBuf::from("/dev/null"));
        assert_eq!(dev.mode, chr_mode() as u32);
        assert_eq!(dev.dev, null_dev());
        assert_eq!(dev.pid, std::process::id() as libc::pid_t);
        assert_eq!(dev.major(), 1);
        assert_eq!(dev.minor(), 3);
    }

    #[test]
    fn test_decode_mknodat() {
        let mem = BufMem {
            base: 0x2000,
            data: b"/dev/zero\0".to_vec(),
        };
        let dirfd = libc::AT_FDCWD as i64 as u64;
        let req = mknod_req(
            AUDIT_ARCH_AARCH64,
            33,
            [dirfd, 0x2000, chr_mode(), libc::makedev(1, 5), 0, 0],
        );
        let dev = decode_device_request(&req, &mem).unwrap();
        assert_eq!(dev.path, PathBuf::from("/dev/zero"));
        assert_eq!(dev.minor(), 5);
    }

    #[test]
    fn test_decode_mknodat_bad_dirfd() {
        let req = mknod_req(
            AUDIT_ARCH_AARCH64,
            33,
            [5, 0x2000, chr_mode(), null_dev(), 0, 0],
        );
        let err = decode_device_request(&req, &NoMemAccess).unwrap_err();
        assert_eq!(err, -libc::EINVAL);
    }

    #[test]
    fn test_decode_unknown_arch() {
        let req = mknod_req(0x1234_5678, 133, [0, chr_mode(), null_dev(), 0, 0, 0]);
        let err = decode_device_request(&req, &NoMemAccess).unwrap_err();
        assert_eq!(err, -libc::EPERM);
    }

    #[test]
    fn test_decode_unknown_syscall() {
        // read(2) is never routed to the broker.
        let req = mknod_req(AUDIT_ARCH_X86_64, 0, [0, chr_mode(), null_dev(), 0, 0, 0]);
        let err = decode_device_request(&req, &NoMemAccess).unwrap_err();
        assert_eq!(err, -libc::EPERM);

        // mknod does not exist on aarch64, its x86_64 number is foreign there.
        let req = mknod_req(AUDIT_ARCH_AARCH64, 133, [0, chr_mode(), null_dev(), 0, 0, 0]);
        let err = decode_device_request(&req, &NoMemAccess).unwrap_err();
        assert_eq!(err, -libc::EPERM);
    }

    #[test]
    fn test_decode_rejected_device() {
        let req = mknod_req(
            AUDIT_ARCH_X86_64,
            133,
            [0, chr_mode(), libc::makedev(10, 200), 0, 0, 0],
        );
        let err = decode_device_request(&req, &NoMemAccess).unwrap_err();
        assert_eq!(err, -libc::EPERM);
    }

    #[test]
    fn test_decode_path_errors() {
        // Peer memory read errors are passed through.
        let req = mknod_req(
            AUDIT_ARCH_X86_64,
            133,
            [0x1000, chr_mode(), null_dev(), 0, 0, 0],
        );
        let err = decode_device_request(&req, &ErrMem(libc::EIO)).unwrap_err();
        assert_eq!(err, -libc::EIO);

        // A path without NUL termination is denied.
        let mem = BufMem {
            base: 0x1000,
            data: b"unterminated".to_vec(),
        };
        let err = decode_device_request(&req, &mem).unwrap_err();
        assert_eq!(err, -libc::EPERM);
    }

    fn write_script(dir: &Path, content: &str) -> std::path::PathBuf {
        let path = dir.join("forkmknod-stub.sh");
        write(&path, content).unwrap();
        set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn mem_file_with(content: &[u8]) -> OwnedFd {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(content).unwrap();
        f.into()
    }

    const MONITOR_PID: i32 = 7777;

    fn features(shiftfs: bool) -> RuntimeFeatures {
        RuntimeFeatures {
            seccomp_notify: true,
            shiftfs,
            running_in_userns: false,
        }
    }

    /// Run one notification through a handler and return the response.
    async fn run_handler(
        handler: &SeccompHandler,
        req: SeccompNotif,
        mem_fd: Option<OwnedFd>,
    ) -> SeccompNotifResp {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        let sock = AsyncFd::new(a).unwrap();

        let header = ProxyHeader {
            reserved: 0,
            monitor_pid: MONITOR_PID,
            init_pid: 1,
            sizes: NotifySizes::native(),
            cookie_len: 0,
        };
        let siov = Notification::from_parts(
            make_record(&header, &req),
            SECCOMP_MSG_SIZE_MIN,
            None,
            mem_fd,
            UnixCredentials::new(),
        );

        handler.handle(&sock, siov).await;

        let mut rxbuf = [0; SECCOMP_MSG_SIZE_MIN];
        let count = recv(b.as_raw_fd(), &mut rxbuf, MsgFlags::empty()).unwrap();
        assert_eq!(count, SECCOMP_MSG_SIZE_MIN);
        SeccompNotifResp::deserialize(&rxbuf[SECCOMP_MSG_OFFS_RESP..]).unwrap()
    }

    #[tokio::test]
    async fn test_allow_dev_null() {
        let tmpdir = tempfile::tempdir().unwrap();
        let record = tmpdir.path().join("record");
        let helper = write_script(
            tmpdir.path(),
            &format!(
                "#!/bin/sh\nprintf '%s\\n' \"$@\" > {}\nexit 0\n",
                record.display()
            ),
        );

        let registry = Arc::new(StaticRegistry::new());
        registry.insert(
            MONITOR_PID,
            Arc::new(StaticContainer::new("c1", Arch::X86_64)),
        );

        let handler = SeccompHandler::new(
            registry,
            MknodExecutor::new(helper),
            features(false),
        );

        let req = mknod_req(
            AUDIT_ARCH_X86_64,
            133,
            [0, chr_mode(), null_dev(), 0, 0, 0],
        );
        let resp = run_handler(&handler, req, Some(mem_file_with(b"/dev/null\0"))).await;

        assert_eq!(resp.id, 0xABCD);
        assert_eq!(resp.val, 0);
        assert_eq!(resp.error, 0);
        assert_eq!(resp.flags, 0);

        let recorded = std::fs::read_to_string(&record).unwrap();
        assert!(recorded.starts_with("forkmknod\n"));
        assert!(recorded.contains("/dev/null\n"));
    }

    #[tokio::test]
    async fn test_reject_device_without_helper_call() {
        let tmpdir = tempfile::tempdir().unwrap();
        let record = tmpdir.path().join("record");
        let helper = write_script(
            tmpdir.path(),
            &format!("#!/bin/sh\ntouch {}\nexit 0\n", record.display()),
        );

        let registry = Arc::new(StaticRegistry::new());
        registry.insert(
            MONITOR_PID,
            Arc::new(StaticContainer::new("c1", Arch::X86_64)),
        );
        let handler = SeccompHandler::new(
            registry,
            MknodExecutor::new(helper),
            features(false),
        );

        let req = mknod_req(
            AUDIT_ARCH_X86_64,
            133,
            [0, chr_mode(), libc::makedev(10, 200), 0, 0, 0],
        );
        let resp = run_handler(&handler, req, Some(mem_file_with(b"/dev/fuse\0"))).await;

        assert_eq!(resp.error, -libc::EPERM);
        assert!(!record.exists());
    }

    #[tokio::test]
    async fn test_mknodat_bad_dirfd_response() {
        let tmpdir = tempfile::tempdir().unwrap();
        let helper = write_script(tmpdir.path(), "#!/bin/sh\nexit 0\n");

        let registry = Arc::new(StaticRegistry::new());
        registry.insert(
            MONITOR_PID,
            Arc::new(StaticContainer::new("c1", Arch::Aarch64)),
        );
        let handler = SeccompHandler::new(
            registry,
            MknodExecutor::new(helper),
            features(false),
        );

        let req = mknod_req(
            AUDIT_ARCH_AARCH64,
            33,
            [5, 0, chr_mode(), null_dev(), 0, 0],
        );
        let resp = run_handler(&handler, req, Some(mem_file_with(b"/dev/null\0"))).await;

        assert_eq!(resp.error, -libc::EINVAL);
    }

    #[tokio::test]
    async fn test_unknown_container() {
        let tmpdir = tempfile::tempdir().unwrap();
        let record = tmpdir.path().join("record");
        let helper = write_script(
            tmpdir.path(),
            &format!("#!/bin/sh\ntouch {}\nexit 0\n", record.display()),
        );

        // Nothing registered for the monitor pid.
        let registry = Arc::new(StaticRegistry::new());
        let handler = SeccompHandler::new(
            registry,
            MknodExecutor::new(helper),
            features(false),
        );

        let req = mknod_req(
            AUDIT_ARCH_X86_64,
            133,
            [0, chr_mode(), null_dev(), 0, 0, 0],
        );
        let resp = run_handler(&handler, req, Some(mem_file_with(b"/dev/null\0"))).await;

        assert_eq!(resp.error, -libc::EPERM);
        assert!(!record.exists());
    }

    #[tokio::test]
    async fn test_missing_mem_fd() {
        let tmpdir = tempfile::tempdir().unwrap();
        let helper = write_script(tmpdir.path(), "#!/bin/sh\nexit 0\n");

        let registry = Arc::new(StaticRegistry::new());
        let handler = SeccompHandler::new(
            registry,
            MknodExecutor::new(helper),
            features(false),
        );

        let req = mknod_req(
            AUDIT_ARCH_X86_64,
            133,
            [0, chr_mode(), null_dev(), 0, 0, 0],
        );
        let resp = run_handler(&handler, req, None).await;

        assert_eq!(resp.error, -libc::EPERM);
    }

    #[tokio::test]
    async fn test_deferred_registration() {
        let tmpdir = tempfile::tempdir().unwrap();
        let record = tmpdir.path().join("record");
        let helper = write_script(
            tmpdir.path(),
            &format!(
                "#!/bin/sh\nprintf '%s\\n' \"$@\" > {}\necho {} >&2\nexit 1\n",
                record.display(),
                libc::ENOMEDIUM
            ),
        );

        let container = Arc::new(StaticContainer::new("c1", Arch::X86_64));
        let registry = Arc::new(StaticRegistry::new());
        registry.insert(MONITOR_PID, Arc::clone(&container) as Arc<dyn Container>);

        // Unprivileged container, shiftfs, no disk idmap:
        // the helper only probes and the node is registered instead.
        let handler = SeccompHandler::new(
            registry,
            MknodExecutor::new(helper),
            features(true),
        );

        let req = mknod_req(
            AUDIT_ARCH_X86_64,
            133,
            [0, chr_mode(), null_dev(), 0, 0, 0],
        );
        let resp = run_handler(&handler, req, Some(mem_file_with(b"/dev/null\0"))).await;

        assert_eq!(resp.error, 0);

        // The helper ran in permissions-only mode.
        let recorded = std::fs::read_to_string(&record).unwrap();
        assert_eq!(recorded.lines().last(), Some("1"));

        let devices = container.registered_devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(
            devices[0].0,
            format!("forkmknod.unix.{}", std::process::id())
        );
        assert_eq!(devices[0].1.path, PathBuf::from("/dev/null"));
    }

    #[tokio::test]
    async fn test_helper_errno_in_response() {
        let tmpdir = tempfile::tempdir().unwrap();
        let helper = write_script(tmpdir.path(), "#!/bin/sh\necho 28 >&2\nexit 1\n");

        let registry = Arc::new(StaticRegistry::new());
        registry.insert(
            MONITOR_PID,
            Arc::new(StaticContainer::new("c1", Arch::X86_64)),
        );
        let handler = SeccompHandler::new(
            registry,
            MknodExecutor::new(helper),
            features(false),
        );

        let req = mknod_req(
            AUDIT_ARCH_X86_64,
            133,
            [0, chr_mode(), null_dev(), 0, 0, 0],
        );
        let resp = run_handler(&handler, req, Some(mem_file_with(b"/dev/null\0"))).await;

        assert_eq!(resp.error, -libc::ENOSPC);
    }
}

// vim: ts=4 sw=4 expandtab

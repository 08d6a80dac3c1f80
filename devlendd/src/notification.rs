// -*- coding: utf-8 -*-
//
// Copyright (C) 2025 - 2026 Michael Büsch <m@bues.ch>
//
// Licensed under the Apache License version 2.0
// or the MIT license, at your option.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{self as ah, Context as _, format_err as err};
use devlend_proto::{
    ProxyHeader, SECCOMP_MSG_OFFS_COOKIE, SECCOMP_MSG_OFFS_NOTIF, SECCOMP_MSG_OFFS_RESP,
    SECCOMP_MSG_SIZE_MAX, SECCOMP_MSG_SIZE_MIN, SeccompNotif, SeccompNotifResp,
};
use log::warn;
use nix::sys::socket::{ControlMessageOwned, MsgFlags, UnixCredentials, recvmsg, send};
use std::{
    io::{self, IoSliceMut},
    os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd, RawFd},
};
use tokio::io::unix::AsyncFd;

/// Send one record on the notification socket.
///
/// Every record is written with a single send, so concurrent handlers
/// on the same socket never tear each other's records.
pub async fn send_record(sock: &AsyncFd<OwnedFd>, buf: &[u8]) -> ah::Result<usize> {
    loop {
        let mut guard = sock.writable().await.context("Socket polling (tx)")?;
        match guard.try_io(|inner| {
            send(inner.as_raw_fd(), buf, MsgFlags::MSG_NOSIGNAL).map_err(io::Error::from)
        }) {
            Ok(res) => return res.context("Socket send"),
            Err(_would_block) => continue,
        }
    }
}

/// One received seccomp notification record.
///
/// Owns the record buffer and the file descriptors that arrived with it.
/// The fds are closed when the notification is dropped, on every path.
pub struct Notification {
    buf: [u8; SECCOMP_MSG_SIZE_MAX],
    len: usize,
    ucred: UnixCredentials,
    /// Optional namespace-root fd. Only owned, so that it is released
    /// together with the notification.
    _proc_fd: Option<OwnedFd>,
    mem_fd: Option<OwnedFd>,
}

impl Notification {
    pub fn from_parts(
        buf: [u8; SECCOMP_MSG_SIZE_MAX],
        len: usize,
        proc_fd: Option<OwnedFd>,
        mem_fd: Option<OwnedFd>,
        ucred: UnixCredentials,
    ) -> Self {
        Self {
            buf,
            len,
            ucred,
            _proc_fd: proc_fd,
            mem_fd,
        }
    }

    /// Receive one record with up to two ancillary fds.
    ///
    /// Returns `Ok(None)` if the peer has disconnected.
    /// `WouldBlock` is passed through to the async polling loop.
    pub fn recv(fd: RawFd, ucred: UnixCredentials) -> io::Result<Option<Self>> {
        let mut buf = [0; SECCOMP_MSG_SIZE_MAX];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; 2]);

        let (len, raw_fds) = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg = recvmsg::<()>(
                fd,
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_CMSG_CLOEXEC,
            )
            .map_err(io::Error::from)?;

            let mut raw_fds: Vec<RawFd> = vec![];
            for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                if let ControlMessageOwned::ScmRights(received) = cmsg {
                    raw_fds.extend(received);
                }
            }
            (msg.bytes, raw_fds)
        };

        // Take ownership of all received fds before any early return.
        // SAFETY: recvmsg transferred these fds to us.
        let mut fds = raw_fds
            .into_iter()
            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) });
        let first = fds.next();
        let second = fds.next();

        // The mem fd is the last one. A namespace-root fd may precede it.
        let (proc_fd, mem_fd) = match (first, second) {
            (Some(proc_fd), Some(mem_fd)) => (Some(proc_fd), Some(mem_fd)),
            (Some(mem_fd), None) => (None, Some(mem_fd)),
            _ => (None, None),
        };

        if len == 0 {
            return Ok(None);
        }

        Ok(Some(Self::from_parts(buf, len, proc_fd, mem_fd, ucred)))
    }

    /// Check that this record is a well-formed notification.
    ///
    /// `kernel_sizes` is the sizes triple probed from the kernel at
    /// daemon start.
    pub fn is_valid(&self, kernel_sizes: &devlend_proto::NotifySizes) -> bool {
        let pid = self.peer_pid();

        if self.len < SECCOMP_MSG_SIZE_MIN {
            warn!("Incomplete seccomp record receive: pid={pid}");
            return false;
        }

        let header = self.header();
        if header.reserved != 0 {
            warn!("Seccomp client sent non-zero reserved field: pid={pid}");
            return false;
        }

        if header.sizes.notif != kernel_sizes.notif {
            warn!(
                "Seccomp client uses different seccomp_notif sizes: {} != {}, pid={pid}",
                header.sizes.notif, kernel_sizes.notif,
            );
            return false;
        }
        if header.sizes.notif_resp != kernel_sizes.notif_resp {
            warn!(
                "Seccomp client uses different seccomp_notif_resp sizes: {} != {}, pid={pid}",
                header.sizes.notif_resp, kernel_sizes.notif_resp,
            );
            return false;
        }
        if header.sizes.data != kernel_sizes.data {
            warn!(
                "Seccomp client uses different seccomp_data sizes: {} != {}, pid={pid}",
                header.sizes.data, kernel_sizes.data,
            );
            return false;
        }

        true
    }

    /// The pid of the connected peer, from the socket credentials.
    pub fn peer_pid(&self) -> libc::pid_t {
        self.ucred.pid()
    }

    pub fn header(&self) -> ProxyHeader {
        ProxyHeader::deserialize(&self.buf).expect("Record buffer too small for header")
    }

    pub fn request(&self) -> SeccompNotif {
        SeccompNotif::deserialize(&self.buf[SECCOMP_MSG_OFFS_NOTIF..])
            .expect("Record buffer too small for seccomp_notif")
    }

    /// The opaque trailing cookie. May be empty.
    pub fn cookie(&self) -> &[u8] {
        let cookie_len = self.header().cookie_len as usize;
        let avail = self.len.saturating_sub(SECCOMP_MSG_OFFS_COOKIE);
        let len = cookie_len
            .min(avail)
            .min(SECCOMP_MSG_SIZE_MAX - SECCOMP_MSG_OFFS_COOKIE);
        &self.buf[SECCOMP_MSG_OFFS_COOKIE..SECCOMP_MSG_OFFS_COOKIE + len]
    }

    /// The `/proc/<pid>/mem` fd of the intercepted process.
    pub fn mem_fd(&self) -> Option<&OwnedFd> {
        self.mem_fd.as_ref()
    }

    /// Send the response record for this notification.
    ///
    /// The response echoes the request id and flags and carries
    /// `neg_errno` as the verdict. The cookie is not echoed: exactly
    /// [SECCOMP_MSG_SIZE_MIN] bytes go out, in one record.
    pub async fn send_response(
        &mut self,
        sock: &AsyncFd<OwnedFd>,
        neg_errno: i32,
    ) -> ah::Result<()> {
        let req = self.request();
        let resp = SeccompNotifResp {
            id: req.id,
            val: 0,
            error: neg_errno,
            flags: req.flags,
        };
        resp.serialize(&mut self.buf[SECCOMP_MSG_OFFS_RESP..]);

        let count = send_record(sock, &self.buf[..SECCOMP_MSG_SIZE_MIN]).await?;
        if count != SECCOMP_MSG_SIZE_MIN {
            return Err(err!("Short response write: {count} bytes"));
        }
        Ok(())
    }

    /// Answer an invalid record with one empty record.
    ///
    /// The container side client takes the short read as "no answer" and
    /// lets the kernel fall back to its default, instead of waiting for
    /// the 30 second notification timeout.
    pub async fn send_empty(sock: &AsyncFd<OwnedFd>) -> ah::Result<()> {
        send_record(sock, &[]).await?;
        Ok(())
    }
}

/// Assemble a raw record from its parts. Test helper.
#[cfg(test)]
pub(crate) fn make_record(
    header: &ProxyHeader,
    req: &SeccompNotif,
) -> [u8; SECCOMP_MSG_SIZE_MAX] {
    use devlend_proto::SECCOMP_NOTIF_SIZE;

    let mut buf = [0; SECCOMP_MSG_SIZE_MAX];
    header.serialize(&mut buf);
    req.serialize(&mut buf[SECCOMP_MSG_OFFS_NOTIF..SECCOMP_MSG_OFFS_NOTIF + SECCOMP_NOTIF_SIZE]);
    buf
}


// vim: ts=4 sw=4 expandtab

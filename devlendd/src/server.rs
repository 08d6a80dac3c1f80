// -*- coding: utf-8 -*-
//
// Copyright (C) 2025 - 2026 Michael Büsch <m@bues.ch>
//
// Licensed under the Apache License version 2.0
// or the MIT license, at your option.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::{handler::SeccompHandler, notification::Notification};
use anyhow::{self as ah, Context as _};
use devlend_proto::NotifySizes;
use log::{debug, warn};
use nix::sys::socket::{
    AddressFamily, Backlog, SockFlag, SockType, UnixAddr, UnixCredentials, accept4, bind,
    getsockopt, listen, socket, sockopt::PeerCredentials,
};
use std::{
    fs::{Permissions, metadata, remove_file, set_permissions},
    io,
    os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd},
    os::unix::fs::PermissionsExt as _,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{io::unix::AsyncFd, task};

const SOCKET_BACKLOG: i32 = 32;

/// State shared between all sessions of the broker.
pub struct BrokerState {
    /// The kernel notification structure sizes, probed at startup.
    sizes: NotifySizes,
    handler: SeccompHandler,
}

/// One accepted notification socket connection.
///
/// Holds no state between notifications. The peer credentials are read
/// once at accept time.
pub struct SeccompSession {
    sock: Arc<AsyncFd<OwnedFd>>,
    ucred: UnixCredentials,
    state: Arc<BrokerState>,
}

impl SeccompSession {
    fn new(sock: OwnedFd, state: Arc<BrokerState>) -> ah::Result<Self> {
        // Get the credentials of the connected process.
        let ucred =
            getsockopt(&sock, PeerCredentials).context("Get Unix socket peer credentials")?;
        debug!("Connected to seccomp socket: pid={}", ucred.pid());

        let sock = Arc::new(
            AsyncFd::new(sock).context("Register connection with async runtime")?,
        );
        Ok(Self { sock, ucred, state })
    }

    /// Receive one record from the connection.
    async fn recv_notification(&self) -> ah::Result<Option<Notification>> {
        loop {
            let mut guard = self
                .sock
                .readable()
                .await
                .context("Socket polling (rx)")?;
            match guard.try_io(|inner| Notification::recv(inner.as_raw_fd(), self.ucred)) {
                Ok(res) => return res.context("Socket receive"),
                Err(_would_block) => continue,
            }
        }
    }

    /// The per-connection receive loop.
    ///
    /// Every received record is dispatched to its own task, so handlers
    /// run concurrently with further receives on this socket.
    pub async fn run(self) {
        let pid = self.ucred.pid();
        loop {
            match self.recv_notification().await {
                Ok(Some(siov)) => {
                    let sock = Arc::clone(&self.sock);
                    let state = Arc::clone(&self.state);
                    if siov.is_valid(&state.sizes) {
                        task::spawn(async move {
                            state.handler.handle(&sock, siov).await;
                        });
                    } else {
                        task::spawn(async move {
                            // The fds of the invalid record are dropped
                            // with it, after the answer went out.
                            if let Err(e) = Notification::send_empty(&sock).await {
                                debug!("Seccomp client pid={}: {e}", siov.peer_pid());
                            }
                        });
                    }
                }
                Ok(None) => {
                    debug!("Disconnected from seccomp socket: pid={pid}");
                    break;
                }
                Err(e) => {
                    debug!("Disconnected from seccomp socket after failed receive: pid={pid}, {e}");
                    break;
                }
            }
        }
    }
}

/// The notification socket listener.
pub struct SeccompServer {
    listener: AsyncFd<OwnedFd>,
    path: PathBuf,
    state: Arc<BrokerState>,
}

impl SeccompServer {
    /// Bind the notification socket.
    ///
    /// `sizes` must be the successfully probed kernel sizes. The socket
    /// is a sequenced-packet socket: every send and receive is exactly
    /// one record.
    pub fn new(path: &Path, sizes: NotifySizes, handler: SeccompHandler) -> ah::Result<Self> {
        // Clean up a stale socket from a previous run.
        if metadata(path).is_ok() {
            remove_file(path).context("Remove existing socket")?;
        }

        let sock = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .context("Create socket")?;
        let addr = UnixAddr::new(path).context("Socket address")?;
        bind(sock.as_raw_fd(), &addr).context("Bind socket")?;

        // Only the daemon user may connect.
        set_permissions(path, Permissions::from_mode(0o700)).context("Set socket mode")?;

        listen(&sock, Backlog::new(SOCKET_BACKLOG).context("Socket backlog")?)
            .context("Listen on socket")?;

        let listener =
            AsyncFd::new(sock).context("Register listener with async runtime")?;

        Ok(Self {
            listener,
            path: path.to_path_buf(),
            state: Arc::new(BrokerState { sizes, handler }),
        })
    }

    /// Accept a connection on the notification socket.
    pub async fn accept(&self) -> ah::Result<SeccompSession> {
        loop {
            let mut guard = self
                .listener
                .readable()
                .await
                .context("Socket polling (accept)")?;
            match guard.try_io(|inner| {
                accept4(
                    inner.as_raw_fd(),
                    SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
                )
                .map_err(io::Error::from)
            }) {
                Ok(res) => {
                    let fd = res.context("Accept connection")?;
                    // SAFETY: accept4 handed us a fresh fd that we own.
                    let sock = unsafe { OwnedFd::from_raw_fd(fd) };
                    return SeccompSession::new(sock, Arc::clone(&self.state));
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Stop serving: unlink the socket path.
    ///
    /// Open connections observe EOF once the listener fd is closed with
    /// the process. In-flight handlers finish and their writes to a
    /// closed socket fail and are logged.
    pub fn stop(&self) {
        if let Err(e) = remove_file(&self.path) {
            warn!("Failed to remove socket {:?}: {e}", self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MknodExecutor;
    use devlend_container::{RuntimeFeatures, StaticRegistry};
    use nix::sys::socket::connect;
    use std::fs::metadata;

    fn make_server(path: &Path) -> ah::Result<SeccompServer> {
        let handler = SeccompHandler::new(
            Arc::new(StaticRegistry::new()),
            MknodExecutor::new("/nonexistent".into()),
            RuntimeFeatures::default(),
        );
        SeccompServer::new(path, NotifySizes::native(), handler)
    }

    #[tokio::test]
    async fn test_bind_accept_stop() {
        let tmpdir = tempfile::tempdir().unwrap();
        let sock_path = tmpdir.path().join("seccomp.socket");

        // A stale file at the socket path is replaced.
        std::fs::write(&sock_path, b"stale").unwrap();

        let srv = make_server(&sock_path).unwrap();

        let mode = metadata(&sock_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o700);

        // Connect a client and let the server accept it.
        let client = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .unwrap();
        let addr = UnixAddr::new(&sock_path).unwrap();
        connect(client.as_raw_fd(), &addr).unwrap();

        let session = srv.accept().await.unwrap();
        assert_eq!(session.ucred.pid(), std::process::id() as libc::pid_t);

        // A disconnecting client ends the session loop.
        drop(client);
        session.run().await;

        srv.stop();
        assert!(!sock_path.exists());
    }
}

// vim: ts=4 sw=4 expandtab

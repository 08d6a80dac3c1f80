// -*- coding: utf-8 -*-
//
// Copyright (C) 2025 - 2026 Michael Büsch <m@bues.ch>
//
// Licensed under the Apache License version 2.0
// or the MIT license, at your option.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `devlendd` lends device nodes to containers.
//!
//! The daemon listens on a sequenced-packet Unix socket for seccomp
//! notifications forwarded by the container side. Whitelisted device
//! node creation requests are performed on the container's behalf by
//! the external forkmknod helper, everything else is denied.

#[cfg(not(any(target_os = "linux", target_os = "android")))]
std::compile_error!("devlendd does not support non-Linux platforms.");

mod devices;
mod executor;
mod handler;
mod notification;
mod seccomp;
mod server;

use crate::{
    executor::MknodExecutor, handler::SeccompHandler, seccomp::install_seccomp_rules,
    server::SeccompServer,
};
use anyhow::{self as ah, Context as _, format_err as err};
use clap::Parser;
use devlend_container::{ContainerRegistry, RuntimeFeatures, StaticRegistry};
use devlend_proto::NotifySizes;
use devlend_seccomp::Seccomp;
use log::{error, info};
use std::{
    fs::{OpenOptions, create_dir_all, metadata},
    io::Write as _,
    os::unix::fs::MetadataExt as _,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    runtime,
    signal::unix::{SignalKind, signal},
    sync::{self, Semaphore},
    task,
};

/// Create a directory, if it does not exist already.
fn create_dir_if_not_exists(path: &Path) -> ah::Result<()> {
    match metadata(path) {
        Err(_) => {
            create_dir_all(path)?;
        }
        Ok(meta) => {
            const S_IFMT: u32 = libc::S_IFMT as _;
            const S_IFDIR: u32 = libc::S_IFDIR as _;
            if (meta.mode() & S_IFMT) != S_IFDIR {
                return Err(err!("Path '{path:?}' exists, but is not a directory."));
            }
        }
    }
    Ok(())
}

/// Create the /run subdirectory.
fn make_run_subdir(rundir: &Path) -> ah::Result<()> {
    let runsubdir = rundir.join("devlendd");
    create_dir_if_not_exists(&runsubdir).context("Create /run subdirectory")?;
    Ok(())
}

/// Create the PID-file in the /run subdirectory.
fn make_pidfile(rundir: &Path) -> ah::Result<()> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(rundir.join("devlendd/devlendd.pid"))
        .context("Open PID-file")?
        .write_all(format!("{}\n", std::process::id()).as_bytes())
        .context("Write to PID-file")
}

#[derive(Parser, Debug, Clone)]
struct Opts {
    /// The notification socket path.
    #[arg(short, long, default_value = "/var/lib/devlend/seccomp.socket")]
    socket: PathBuf,

    /// The run directory for runtime data.
    #[arg(long, default_value = "/run")]
    rundir: PathBuf,

    /// Override the path to the forkmknod helper.
    ///
    /// Defaults to this executable.
    #[arg(long)]
    helper: Option<PathBuf>,

    /// Maximum number of simultaneous container connections.
    #[arg(short, long, default_value = "64")]
    num_connections: usize,

    /// Self-confine the daemon with seccomp: off, log or kill.
    #[arg(long, default_value = "off")]
    seccomp: Seccomp,
}

impl Opts {
    fn get_helper(&self) -> ah::Result<PathBuf> {
        if let Some(helper) = &self.helper {
            Ok(helper.clone())
        } else {
            std::env::current_exe().context("Get executable path")
        }
    }
}

async fn async_main(opts: Arc<Opts>) -> ah::Result<()> {
    make_run_subdir(&opts.rundir)?;

    // The kernel and this build must agree on the notification layout.
    // Without that agreement the socket must never be opened.
    let sizes = NotifySizes::probe().context("Seccomp notify sizes probe")?;
    let features = RuntimeFeatures::detect(true);

    // Standalone operation starts with an empty registry, so every
    // notification resolves to the default denial. An embedding
    // container manager supplies its own registry.
    let registry: Arc<dyn ContainerRegistry> = Arc::new(StaticRegistry::new());

    let handler = SeccompHandler::new(
        registry,
        MknodExecutor::new(opts.get_helper()?),
        features,
    );
    let srv = Arc::new(
        SeccompServer::new(&opts.socket, sizes, handler).context("Server init")?,
    );
    info!("Listening on {:?}", opts.socket);

    make_pidfile(&opts.rundir)?;

    install_seccomp_rules(opts.seccomp)?;

    let mut sigterm = signal(SignalKind::terminate()).unwrap();
    let mut sigint = signal(SignalKind::interrupt()).unwrap();

    let (exit_sock_tx, mut exit_sock_rx) = sync::mpsc::channel(1);

    // Task: Socket handler.
    let srv_clone = Arc::clone(&srv);
    let opts_clone = Arc::clone(&opts);
    task::spawn(async move {
        let conn_semaphore = Arc::new(Semaphore::new(opts_clone.num_connections));
        loop {
            match srv_clone.accept().await {
                Ok(session) => {
                    // Socket connection handler.
                    if let Ok(permit) = Arc::clone(&conn_semaphore).acquire_owned().await {
                        task::spawn(async move {
                            session.run().await;
                            drop(permit);
                        });
                    }
                }
                Err(e) => {
                    error!("Accept failed: {e}");
                    let _ = exit_sock_tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });

    // Task: Main loop.
    let exitcode;
    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM: Terminating.");
                exitcode = Ok(());
                break;
            }
            _ = sigint.recv() => {
                exitcode = Err(err!("Interrupted by SIGINT."));
                break;
            }
            code = exit_sock_rx.recv() => {
                exitcode = code.unwrap_or_else(|| Err(err!("Unknown error code.")));
                break;
            }
        }
    }

    srv.stop();
    exitcode
}

fn main() -> ah::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts = Arc::new(Opts::parse());
    runtime::Builder::new_current_thread()
        .thread_keep_alive(Duration::from_millis(0))
        .max_blocking_threads(1)
        .enable_all()
        .build()
        .context("Tokio runtime builder")?
        .block_on(async_main(opts))
}

// vim: ts=4 sw=4 expandtab

// -*- coding: utf-8 -*-
//
// Copyright (C) 2025 - 2026 Michael Büsch <m@bues.ch>
//
// Licensed under the Apache License version 2.0
// or the MIT license, at your option.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! This crate is the abstraction of the container lifecycle manager
//! as seen by the `devlend` seccomp broker.
//!
//! The broker never owns container state. It consumes a [Container]
//! handle resolved through an injected [ContainerRegistry] lookup and
//! registers deferred device nodes back through the handle.

#![forbid(unsafe_code)]

pub mod arch;

use crate::arch::Arch;
use anyhow as ah;
use std::{
    collections::HashMap,
    fs::read_to_string,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};

/// One device node requested by a process inside a container.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DeviceNode {
    /// The requested path, as seen inside the container.
    pub path: PathBuf,
    /// The resolved path on the host. Empty until resolved.
    pub host_path: PathBuf,
    /// The raw `mode_t` of the request.
    pub mode: u32,
    /// The raw `dev_t` of the request.
    pub dev: u64,
    /// The pid of the requesting process.
    pub pid: i32,
}

impl DeviceNode {
    pub fn new(path: PathBuf, mode: u32, dev: u64, pid: i32) -> Self {
        Self {
            path,
            host_path: PathBuf::new(),
            mode,
            dev,
            pid,
        }
    }

    /// The device major number.
    pub fn major(&self) -> u32 {
        ((self.dev >> 8) & 0xFFF) as u32 | ((self.dev >> 32) & !0xFFF) as u32
    }

    /// The device minor number.
    pub fn minor(&self) -> u32 {
        (self.dev & 0xFF) as u32 | ((self.dev >> 12) & !0xFF) as u32
    }
}

/// A handle to one container, as provided by the lifecycle manager.
pub trait Container: Send + Sync {
    /// The stable container name.
    fn name(&self) -> &str;

    /// The container's configured CPU architecture.
    fn architecture(&self) -> Arch;

    /// Whether the container runs privileged.
    fn is_privileged(&self) -> bool;

    /// Whether the container's disk carries an id mapping.
    ///
    /// Fails if the mapping state cannot be determined.
    fn has_disk_idmap(&self) -> ah::Result<bool>;

    /// The fully expanded configuration of the container.
    fn expanded_config(&self) -> &HashMap<String, String>;

    /// Register a device node in the container's runtime state, so that
    /// it is materialised via bind-mount on the next container start.
    fn insert_seccomp_unix_device(&self, name: &str, dev: &DeviceNode) -> ah::Result<()>;
}

/// Lookup of the container that owns a given monitor process.
pub trait ContainerRegistry: Send + Sync {
    fn find_by_monitor_pid(&self, monitor_pid: i32) -> Option<Arc<dyn Container>>;
}

/// A self-contained [Container] implementation.
///
/// Embedding daemons with their own container state implement [Container]
/// directly instead.
pub struct StaticContainer {
    name: String,
    arch: Arch,
    privileged: bool,
    disk_idmap: bool,
    config: HashMap<String, String>,
    devices: Mutex<Vec<(String, DeviceNode)>>,
}

impl StaticContainer {
    pub fn new(name: impl Into<String>, arch: Arch) -> Self {
        Self {
            name: name.into(),
            arch,
            privileged: false,
            disk_idmap: false,
            config: HashMap::new(),
            devices: Mutex::new(vec![]),
        }
    }

    pub fn set_privileged(&mut self, privileged: bool) {
        self.privileged = privileged;
    }

    pub fn set_disk_idmap(&mut self, disk_idmap: bool) {
        self.disk_idmap = disk_idmap;
    }

    pub fn set_config_key(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.config.insert(key.into(), value.into());
    }

    /// All device nodes registered via [Container::insert_seccomp_unix_device].
    pub fn registered_devices(&self) -> Vec<(String, DeviceNode)> {
        self.devices.lock().expect("Device list poisoned").clone()
    }
}

impl Container for StaticContainer {
    fn name(&self) -> &str {
        &self.name
    }

    fn architecture(&self) -> Arch {
        self.arch
    }

    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn has_disk_idmap(&self) -> ah::Result<bool> {
        Ok(self.disk_idmap)
    }

    fn expanded_config(&self) -> &HashMap<String, String> {
        &self.config
    }

    fn insert_seccomp_unix_device(&self, name: &str, dev: &DeviceNode) -> ah::Result<()> {
        self.devices
            .lock()
            .expect("Device list poisoned")
            .push((name.to_string(), dev.clone()));
        Ok(())
    }
}

/// A [ContainerRegistry] backed by a plain monitor-pid map.
#[derive(Default)]
pub struct StaticRegistry {
    containers: RwLock<HashMap<i32, Arc<dyn Container>>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, monitor_pid: i32, container: Arc<dyn Container>) {
        self.containers
            .write()
            .expect("Registry poisoned")
            .insert(monitor_pid, container);
    }

    pub fn remove(&self, monitor_pid: i32) {
        self.containers
            .write()
            .expect("Registry poisoned")
            .remove(&monitor_pid);
    }
}

impl ContainerRegistry for StaticRegistry {
    fn find_by_monitor_pid(&self, monitor_pid: i32) -> Option<Arc<dyn Container>> {
        self.containers
            .read()
            .expect("Registry poisoned")
            .get(&monitor_pid)
            .cloned()
    }
}

/// The host runtime capabilities the broker's decisions depend on.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct RuntimeFeatures {
    /// The kernel supports seccomp user notification.
    pub seccomp_notify: bool,
    /// The kernel has a namespace-shifting filesystem available.
    pub shiftfs: bool,
    /// The daemon itself runs inside a user namespace.
    pub running_in_userns: bool,
}

impl RuntimeFeatures {
    /// Detect the host runtime capabilities.
    ///
    /// Whether seccomp user notification works has already been
    /// established by the notify-sizes probe, so it is passed in.
    pub fn detect(seccomp_notify: bool) -> Self {
        Self {
            seccomp_notify,
            shiftfs: Path::new("/sys/module/shiftfs").exists(),
            running_in_userns: running_in_userns("/proc/self/uid_map"),
        }
    }
}

/// Check whether the current process runs inside a user namespace.
///
/// A process in the initial namespace sees the full identity mapping
/// `0 0 4294967295` as its first uid_map line.
fn running_in_userns(uid_map: &str) -> bool {
    let Ok(data) = read_to_string(uid_map) else {
        // No uid_map means no user namespace support at all.
        return false;
    };
    let Some(line) = data.lines().next() else {
        return true;
    };
    let fields: Vec<&str> = line.split_whitespace().collect();
    fields != ["0", "0", "4294967295"]
}


// vim: ts=4 sw=4 expandtab

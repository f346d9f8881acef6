// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Path layout of the local artifact cache and the capability through which
//! missing artifacts are fetched. The actual download implementation lives
//! with the caller; the build pipeline only ever holds a borrowed [`Fetch`].

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::device::Vendor;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No remote source configured for {0}")]
    NoRemote(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Resolves artifact names to paths under one cache root. The directory
/// layout mirrors the remote repository tree.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root: PathBuf,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn kernel_dir(&self, version: &str) -> PathBuf {
        self.root.join("kernels").join(version)
    }

    pub fn boot_archive(&self, version: &str) -> PathBuf {
        self.kernel_dir(version).join(format!("boot-{version}.tar.gz"))
    }

    pub fn dtb_archive(&self, vendor: Vendor, version: &str) -> PathBuf {
        self.kernel_dir(version)
            .join(format!("dtb-{vendor}-{version}.tar.gz"))
    }

    pub fn modules_archive(&self, version: &str) -> PathBuf {
        self.kernel_dir(version)
            .join(format!("modules-{version}.tar.gz"))
    }

    pub fn rootfs_file(&self, name: &str) -> PathBuf {
        self.root.join("rootfs").join(name)
    }

    pub fn device_boot_archive(&self, device: &str) -> PathBuf {
        self.root
            .join("devices")
            .join(device)
            .join(format!("boot-{device}.tar.gz"))
    }

    pub fn firmware_dir(&self) -> PathBuf {
        self.root.join("firmware")
    }

    pub fn loader_dir(&self, vendor: Vendor, device: &str) -> PathBuf {
        self.root.join("loader").join(vendor.as_str()).join(device)
    }

    pub fn patch_archive(&self, name: &str) -> PathBuf {
        self.root.join("patches").join(name)
    }
}

/// Fetch operations the build pipeline may invoke on a cache miss. Each call
/// populates the corresponding [`ArtifactCache`] path.
pub trait Fetch {
    fn fetch_kernel(&self, version: &str) -> Result<()>;
    fn fetch_rootfs(&self, name: &str) -> Result<()>;
    fn fetch_device_boot(&self, device: &str) -> Result<()>;
    fn fetch_firmware(&self) -> Result<()>;
    fn fetch_loader(&self, vendor: Vendor, device: &str) -> Result<()>;
    fn fetch_patch(&self, name: &str) -> Result<()>;
}

/// A [`Fetch`] implementation for fully local operation. Every miss is
/// reported as unavailable; whether that is fatal depends on whether the
/// artifact is mandatory.
pub struct OfflineFetcher;

impl Fetch for OfflineFetcher {
    fn fetch_kernel(&self, version: &str) -> Result<()> {
        Err(Error::NoRemote(format!("kernel {version}")))
    }

    fn fetch_rootfs(&self, name: &str) -> Result<()> {
        Err(Error::NoRemote(format!("rootfs {name}")))
    }

    fn fetch_device_boot(&self, device: &str) -> Result<()> {
        Err(Error::NoRemote(format!("device boot files for {device}")))
    }

    fn fetch_firmware(&self) -> Result<()> {
        Err(Error::NoRemote("firmware tree".to_owned()))
    }

    fn fetch_loader(&self, vendor: Vendor, device: &str) -> Result<()> {
        Err(Error::NoRemote(format!("{vendor} loader for {device}")))
    }

    fn fetch_patch(&self, name: &str) -> Result<()> {
        Err(Error::NoRemote(format!("patch {name}")))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::device::Vendor;

    use super::ArtifactCache;

    #[test]
    fn cache_paths() {
        let cache = ArtifactCache::new("/cache");

        assert_eq!(
            cache.boot_archive("6.1.0"),
            Path::new("/cache/kernels/6.1.0/boot-6.1.0.tar.gz"),
        );
        assert_eq!(
            cache.dtb_archive(Vendor::Amlogic, "6.1.0"),
            Path::new("/cache/kernels/6.1.0/dtb-amlogic-6.1.0.tar.gz"),
        );
        assert_eq!(
            cache.device_boot_archive("s905x-box"),
            Path::new("/cache/devices/s905x-box/boot-s905x-box.tar.gz"),
        );
        assert_eq!(
            cache.loader_dir(Vendor::Rockchip, "rk3566-box"),
            Path::new("/cache/loader/rockchip/rk3566-box"),
        );
    }
}

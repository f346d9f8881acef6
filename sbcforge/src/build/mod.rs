// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! The build pipeline. One [`Builder`] produces one image, running the
//! stages strictly in order: validate, create image, install kernel, install
//! rootfs, write bootloader.

pub mod kernel;
pub mod loader;
pub mod rootfs;
pub mod tweaks;

use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io,
    path::PathBuf,
    sync::atomic::AtomicBool,
};

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    cache::{ArtifactCache, Fetch},
    config::PatchOption,
    device::{self, DeviceIndex, Vendor},
    format::{ext4, fat, mbr::ImageLayout},
    stream::SectionStream,
};

/// Volume label patched into the root partition's superblock.
const ROOTFS_LABEL: &str = "ROOTFS";

/// Immutable description of one build. Consumed by [`Builder::new`].
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub device: String,
    pub kernel: String,
    pub rootfs: String,
    pub size_mb: u32,
    pub output: PathBuf,
    pub patch: PatchOption,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    CreateImage,
    InstallKernel,
    InstallRootfs,
    WriteBootloader,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validate => "validate",
            Self::CreateImage => "create image",
            Self::InstallKernel => "install kernel",
            Self::InstallRootfs => "install rootfs",
            Self::WriteBootloader => "write bootloader",
        };

        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not found in cache: {1:?}")]
    MissingInput(&'static str, PathBuf),
    #[error("Device lookup failed")]
    Device(#[from] device::Error),
    #[error("Invalid image layout")]
    Layout(#[from] crate::format::mbr::Error),
    #[error("FAT32 authoring failed")]
    Fat(#[from] fat::Error),
    #[error("ext4 authoring failed")]
    Ext4(#[from] ext4::Error),
    #[error("Kernel assembly failed")]
    Kernel(#[from] kernel::Error),
    #[error("Rootfs assembly failed")]
    Rootfs(#[from] rootfs::Error),
    #[error("Bootloader writing failed")]
    Loader(#[from] loader::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A build failure, attributed to the pipeline stage that caused it.
#[derive(Debug, Error)]
#[error("Build stage '{stage}' failed")]
pub struct BuildError {
    pub stage: Stage,
    #[source]
    pub source: Error,
}

fn stage_err(stage: Stage) -> impl FnOnce(Error) -> BuildError {
    move |source| BuildError { stage, source }
}

pub struct Builder<'a> {
    request: BuildRequest,
    vendor: Vendor,
    layout: ImageLayout,
    cache: &'a ArtifactCache,
    fetcher: &'a dyn Fetch,
    scratch: TempDir,
}

impl<'a> Builder<'a> {
    /// Resolve the device and image layout up front so that an unknown
    /// device or a bad size surfaces before anything touches the disk. The
    /// per-build scratch directory is removed again when the builder drops.
    pub fn new(
        request: BuildRequest,
        devices: &DeviceIndex,
        cache: &'a ArtifactCache,
        fetcher: &'a dyn Fetch,
    ) -> std::result::Result<Self, BuildError> {
        let vendor = devices
            .vendor_of(&request.device)
            .map_err(Error::Device)
            .map_err(stage_err(Stage::Validate))?;
        let layout = ImageLayout::new(request.size_mb)
            .map_err(Error::Layout)
            .map_err(stage_err(Stage::Validate))?;
        let scratch = TempDir::new()
            .map_err(Error::Io)
            .map_err(stage_err(Stage::Validate))?;

        Ok(Self {
            request,
            vendor,
            layout,
            cache,
            fetcher,
            scratch,
        })
    }

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    /// Run the full pipeline. Any failure after the validate stage removes
    /// the partially written output file.
    pub fn build(&self, cancel_signal: &AtomicBool) -> std::result::Result<(), BuildError> {
        info!(
            "Building image: device={} kernel={} rootfs={} size={}MiB output={:?}",
            self.request.device,
            self.request.kernel,
            self.request.rootfs,
            self.request.size_mb,
            self.request.output,
        );

        let result = self.run_stages(cancel_signal);

        if let Err(e) = &result {
            if e.stage != Stage::Validate {
                // Nothing downstream can use a half-written image.
                let _ = fs::remove_file(&self.request.output);
            }
        }

        result
    }

    fn run_stages(&self, cancel_signal: &AtomicBool) -> std::result::Result<(), BuildError> {
        self.validate().map_err(stage_err(Stage::Validate))?;
        self.create_image()
            .map_err(stage_err(Stage::CreateImage))?;
        self.install_kernel(cancel_signal)
            .map_err(stage_err(Stage::InstallKernel))?;
        self.install_rootfs(cancel_signal)
            .map_err(stage_err(Stage::InstallRootfs))?;
        self.write_bootloader()
            .map_err(stage_err(Stage::WriteBootloader))?;

        info!("Image written to {:?}", self.request.output);

        Ok(())
    }

    fn open_image(&self) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.request.output)
    }

    /// Make sure the kernel and rootfs artifacts exist locally, fetching
    /// them on a miss. Either one still missing afterwards is fatal.
    fn validate(&self) -> Result<()> {
        let kernel_dir = self.cache.kernel_dir(&self.request.kernel);
        if !kernel_dir.is_dir() {
            debug!("Kernel {} not cached, fetching", self.request.kernel);
            if let Err(e) = self.fetcher.fetch_kernel(&self.request.kernel) {
                warn!("Kernel fetch failed: {e}");
            }
        }
        if !kernel_dir.is_dir() {
            return Err(Error::MissingInput("Kernel", kernel_dir));
        }

        let rootfs_file = self.cache.rootfs_file(&self.request.rootfs);
        if !rootfs_file.is_file() {
            debug!("Rootfs {} not cached, fetching", self.request.rootfs);
            if let Err(e) = self.fetcher.fetch_rootfs(&self.request.rootfs) {
                warn!("Rootfs fetch failed: {e}");
            }
        }
        if !rootfs_file.is_file() {
            return Err(Error::MissingInput("Rootfs", rootfs_file));
        }

        Ok(())
    }

    /// Allocate the output file at its final size, write the partition
    /// table, and format the boot partition.
    fn create_image(&self) -> Result<()> {
        if let Some(parent) = self.request.output.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.request.output)?;
        file.set_len(self.layout.total_size())?;

        self.layout.write_mbr(&mut file)?;

        let (offset, size) = self.layout.boot_window();
        let mut window = SectionStream::new(&mut file, offset, size)?;
        fat::format_boot(&mut window)?;

        file.sync_all()?;
        info!("Created {} MiB image with partition table", (16 + 256 + self.request.size_mb));

        Ok(())
    }

    /// Assemble the boot staging tree and publish it into the FAT32 boot
    /// partition.
    fn install_kernel(&self, cancel_signal: &AtomicBool) -> Result<()> {
        kernel::assemble_boot_tree(
            self.cache,
            self.fetcher,
            &self.request.device,
            self.vendor,
            &self.request.kernel,
            self.scratch.path(),
            cancel_signal,
        )?;

        let mut file = self.open_image()?;
        let (offset, size) = self.layout.boot_window();
        let window = SectionStream::new(&mut file, offset, size)?;

        let volume = fat::BootVolume::open(window)?;
        volume.copy_tree(&self.scratch.path().join("boot"), cancel_signal)?;
        volume.unmount()?;

        file.sync_all()?;
        info!("Copied boot files to partition 1");

        Ok(())
    }

    /// Assemble the rootfs staging tree, author it as ext4 directly into the
    /// partition window, and patch the volume label.
    fn install_rootfs(&self, cancel_signal: &AtomicBool) -> Result<()> {
        rootfs::assemble_rootfs_tree(
            self.cache,
            self.fetcher,
            self.vendor,
            &self.request.rootfs,
            &self.request.kernel,
            &self.request.patch,
            self.scratch.path(),
            cancel_signal,
        )?;

        let mut file = self.open_image()?;
        let (offset, size) = self.layout.root_window();
        let mut window = SectionStream::new(&mut file, offset, size)?;

        ext4::build_image(
            &self.scratch.path().join("rootfs"),
            &mut window,
            size,
            cancel_signal,
        )?;
        ext4::set_volume_label(&mut window, ROOTFS_LABEL)?;

        file.sync_all()?;
        info!("Wrote ext4 rootfs to partition 2");

        Ok(())
    }

    fn write_bootloader(&self) -> Result<()> {
        let file = self.open_image()?;

        loader::write_loader(
            self.cache,
            self.fetcher,
            self.vendor,
            &self.request.device,
            &file,
        )?;

        Ok(())
    }
}

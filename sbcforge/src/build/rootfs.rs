// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Assembles the root partition staging tree: the base rootfs, kernel
//! modules, optional overlays, the firmware tree, and the vendor tweak set.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    cache::{self, ArtifactCache, Fetch},
    config::PatchOption,
    device::Vendor,
    format::{
        archive,
        compression::{CompressedFormat, CompressedReader},
        ext4,
    },
    stream,
};

use super::tweaks;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unsupported rootfs format: {0:?}")]
    UnsupportedFormat(PathBuf),
    #[error("Firmware tree is not cached and cannot be fetched")]
    FirmwareUnavailable(#[source] cache::Error),
    #[error("Failed to extract archive")]
    Archive(#[from] archive::Error),
    #[error("Failed to read rootfs image")]
    Ext4(#[from] ext4::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Extract the base rootfs into `dest_dir`. The source format is determined
/// by the file name: tarballs are extracted directly, while `.xz` and
/// non-tar `.gz` files are whole-disk ext4 images that are decompressed to a
/// scratch file and then read out.
fn extract_rootfs(
    source: &Path,
    scratch: &Path,
    dest_dir: &Path,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let name = source
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        archive::extract(source, dest_dir, cancel_signal)?;
        return Ok(());
    }

    if !name.ends_with(".xz") && !name.ends_with(".gz") {
        return Err(Error::UnsupportedFormat(source.to_path_buf()));
    }

    // Whole-disk ext4 image. Decompress, then walk the filesystem.
    let image = scratch.join("rootfs.img");

    let file = io::BufReader::new(fs::File::open(source)?);
    let format = if name.ends_with(".xz") {
        CompressedFormat::Xz
    } else {
        CompressedFormat::Gzip
    };
    let mut decoder = CompressedReader::with_format(file, format);

    let mut writer = fs::File::create(&image)?;
    stream::copy(&mut decoder, &mut writer, cancel_signal)?;
    drop(writer);
    debug!("Decompressed rootfs image to {image:?}");

    ext4::extract_image(&image, dest_dir, cancel_signal)?;
    fs::remove_file(&image)?;

    Ok(())
}

/// Recursively copy `src` into `dst`, preserving file modes and recreating
/// symlinks. Existing files are overwritten; existing directories are merged.
fn copy_tree_into(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;

    for entry in src.read_dir()? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let metadata = entry.path().symlink_metadata()?;

        if metadata.is_dir() {
            copy_tree_into(&entry.path(), &target)?;
        } else if metadata.is_symlink() {
            #[cfg(unix)]
            {
                match fs::remove_file(&target) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
                std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
            }
        } else if metadata.is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

/// Populate `staging/device_root/` from the optional patch archive. Like the
/// device boot overlay, a patch that cannot be found is only a warning.
fn populate_device_root(
    cache: &ArtifactCache,
    fetcher: &dyn Fetch,
    patch: &PatchOption,
    device_root: &Path,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let Some(name) = patch.name() else {
        return Ok(());
    };

    let archive_path = cache.patch_archive(name);

    if !archive_path.is_file() {
        if let Err(e) = fetcher.fetch_patch(name) {
            warn!("No patch overlay {name}: {e}");
            return Ok(());
        }
    }

    if archive_path.is_file() {
        archive::extract(&archive_path, device_root, cancel_signal)?;
        debug!("Extracted patch overlay {name}");
    } else {
        warn!("Patch overlay {name} is not in the cache");
    }

    Ok(())
}

/// Replace `lib/firmware` in the rootfs with the shared firmware tree,
/// fetching it on first use.
fn install_firmware(
    cache: &ArtifactCache,
    fetcher: &dyn Fetch,
    rootfs_dir: &Path,
) -> Result<()> {
    let firmware_src = cache.firmware_dir();

    if !firmware_src.is_dir() {
        fetcher
            .fetch_firmware()
            .map_err(Error::FirmwareUnavailable)?;
    }

    if !firmware_src.is_dir() {
        // The fetch succeeded, but the repository ships no firmware tree.
        return Ok(());
    }

    let firmware_dst = rootfs_dir.join("lib/firmware");
    match fs::remove_dir_all(&firmware_dst) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    copy_tree_into(&firmware_src, &firmware_dst)?;

    Ok(())
}

/// Build the complete rootfs staging tree at `staging/rootfs/`.
#[allow(clippy::too_many_arguments)]
pub fn assemble_rootfs_tree(
    cache: &ArtifactCache,
    fetcher: &dyn Fetch,
    vendor: Vendor,
    rootfs_name: &str,
    kernel_version: &str,
    patch: &PatchOption,
    staging: &Path,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let rootfs_dir = staging.join("rootfs");
    fs::create_dir_all(&rootfs_dir)?;

    extract_rootfs(
        &cache.rootfs_file(rootfs_name),
        staging,
        &rootfs_dir,
        cancel_signal,
    )?;
    info!("Extracted rootfs");

    let modules_dir = staging.join("modules");
    if modules_dir.is_dir() {
        copy_tree_into(&modules_dir, &rootfs_dir.join("lib/modules"))?;
        debug!("Merged kernel modules for {kernel_version}");
    }

    let device_root = staging.join("device_root");
    populate_device_root(cache, fetcher, patch, &device_root, cancel_signal)?;
    if device_root.is_dir() {
        copy_tree_into(&device_root, &rootfs_dir)?;
        debug!("Merged device root overlay");
    }

    install_firmware(cache, fetcher, &rootfs_dir)?;
    debug!("Installed firmware tree");

    tweaks::apply(vendor, &rootfs_dir)?;
    info!("Applied {vendor} rootfs tweaks");

    Ok(())
}

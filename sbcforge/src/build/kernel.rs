// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Assembles the boot partition staging tree: kernel boot files, device tree
//! blobs, kernel modules, and the optional device-specific boot overlay.

use std::{fs, io, path::Path, sync::atomic::AtomicBool};

use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    cache::{ArtifactCache, Fetch},
    device::Vendor,
    format::archive,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to extract archive")]
    Archive(#[from] archive::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Copy every `*.ko` found anywhere beneath `dir` to the top of `dir` as a
/// sibling entry, so the entire module set can be loaded without knowing the
/// upstream directory layout. The synthetic `build` and `source` entries are
/// dropped first; they point at kernel build trees that don't exist here.
///
/// Running this twice is a no-op: modules already at the top level are their
/// own copy target and are skipped.
pub fn flatten_modules(dir: &Path) -> io::Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }

    for entry in ["build", "source"] {
        match fs::remove_file(dir.join(entry)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }

    let mut modules = Vec::new();

    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_dir()
            && entry.file_name().as_encoded_bytes().ends_with(b".ko")
        {
            modules.push(entry.into_path());
        }
    }

    let mut copied = 0;

    for module in modules {
        // file_name() is always present for walked entries.
        let target = dir.join(module.file_name().unwrap());

        // A module that already sits at the top level is its own target.
        if module == target {
            continue;
        }

        match fs::copy(&module, &target) {
            Ok(_) => copied += 1,
            Err(e) => warn!("Could not flatten module {module:?}: {e}"),
        }
    }

    Ok(copied)
}

/// Populate `staging/boot/` and `staging/modules/` from the cached kernel
/// artifacts, then flatten the module tree and apply the device boot overlay
/// if one exists.
pub fn assemble_boot_tree(
    cache: &ArtifactCache,
    fetcher: &dyn Fetch,
    device: &str,
    vendor: Vendor,
    version: &str,
    staging: &Path,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let boot_dir = staging.join("boot");
    let modules_dir = staging.join("modules");

    archive::extract(&cache.boot_archive(version), &boot_dir, cancel_signal)?;
    debug!("Extracted kernel boot files");

    archive::extract(
        &cache.dtb_archive(vendor, version),
        &boot_dir.join("dtb").join(vendor.as_str()),
        cancel_signal,
    )?;
    debug!("Extracted {vendor} device trees");

    archive::extract(&cache.modules_archive(version), &modules_dir, cancel_signal)?;
    let flattened = flatten_modules(&modules_dir.join(version))?;
    info!("Extracted kernel modules ({flattened} flattened)");

    apply_device_overlay(cache, fetcher, device, &boot_dir, cancel_signal)?;

    Ok(())
}

/// Overlay `devices/<device>/boot-<device>.tar.gz` onto the boot tree. The
/// overlay is optional: a missing archive that also cannot be fetched only
/// produces a warning.
fn apply_device_overlay(
    cache: &ArtifactCache,
    fetcher: &dyn Fetch,
    device: &str,
    boot_dir: &Path,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let archive_path = cache.device_boot_archive(device);

    if !archive_path.is_file() {
        if let Err(e) = fetcher.fetch_device_boot(device) {
            warn!("No boot overlay for {device}: {e}");
            return Ok(());
        }
    }

    if archive_path.is_file() {
        archive::extract(&archive_path, boot_dir, cancel_signal)?;
        debug!("Extracted device boot overlay");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    #[test]
    fn flatten_is_idempotent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path();

        fs::create_dir_all(dir.join("kernel/drivers/net")).unwrap();
        fs::write(dir.join("kernel/drivers/net/r8152.ko"), b"a").unwrap();
        fs::write(dir.join("kernel/drivers/mmc.ko"), b"b").unwrap();
        fs::write(dir.join("modules.dep"), b"deps").unwrap();

        let copied = super::flatten_modules(dir).unwrap();
        assert_eq!(copied, 2);
        assert_eq!(fs::read(dir.join("r8152.ko")).unwrap(), b"a");
        assert_eq!(fs::read(dir.join("mmc.ko")).unwrap(), b"b");

        let names = |dir: &std::path::Path| {
            let mut names = walkdir::WalkDir::new(dir)
                .into_iter()
                .map(|e| e.unwrap().into_path())
                .collect::<Vec<_>>();
            names.sort();
            names
        };
        let first = names(dir);

        // The top-level copies are their own targets on the second run.
        let copied = super::flatten_modules(dir).unwrap();
        assert_eq!(copied, 2);
        assert_eq!(names(dir), first);
    }

    #[test]
    fn flatten_removes_synthetic_links() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path();

        fs::create_dir(dir).ok();
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink("/nonexistent", dir.join("build")).unwrap();
            std::os::unix::fs::symlink("/nonexistent", dir.join("source")).unwrap();
        }

        super::flatten_modules(dir).unwrap();

        assert!(!dir.join("build").exists());
        assert!(!dir.join("source").exists());
    }

    #[test]
    fn flatten_missing_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert_eq!(
            super::flatten_modules(&temp_dir.path().join("nope")).unwrap(),
            0,
        );
    }
}

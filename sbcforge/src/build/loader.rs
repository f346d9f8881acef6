// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Per-vendor bootloader blobs written at fixed absolute offsets below the
//! partitioned region of the image.

use std::{fs, io, path::Path, path::PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    cache::{ArtifactCache, Fetch},
    device::Vendor,
};

/// Amlogic BL1 masks out the MBR partition entries: bytes `[444, 512)` of
/// the blob are never written so the partition table survives.
const AMLOGIC_HEAD_LEN: usize = 444;
const AMLOGIC_TAIL_OFFSET: u64 = 512;
/// Amlogic loaders must at least cover both write windows.
const AMLOGIC_MIN_LEN: u64 = 512;

/// Allwinner BROM loads the SPL from 8 KiB.
const ALLWINNER_SPL_OFFSET: u64 = 8192;
const ALLWINNER_MAINLINE_OFFSET: u64 = 40960;

/// Rockchip layout, in the classic sector-64 / sector-16384 / sector-24576
/// arrangement.
const ROCKCHIP_IDB_OFFSET: u64 = 64 * 512;
const ROCKCHIP_UBOOT_OFFSET: u64 = 16384 * 512;
const ROCKCHIP_TRUST_OFFSET: u64 = 24576 * 512;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Loader not found: {0:?}")]
    Missing(PathBuf),
    #[error("Loader too small ({size} bytes): {path:?}")]
    TooSmall { path: PathBuf, size: u64 },
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[cfg(unix)]
fn write_at(image: &fs::File, offset: u64, data: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;

    image.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_at(image: &fs::File, offset: u64, data: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;

    let mut offset = offset;
    let mut data = data;
    while !data.is_empty() {
        let n = image.seek_write(data, offset)?;
        offset += n as u64;
        data = &data[n..];
    }
    Ok(())
}

fn read_required(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::Missing(path.to_path_buf())),
        Err(e) => Err(e.into()),
    }
}

/// Read an optional blob. `Ok(None)` means it doesn't exist.
fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_amlogic(loader_dir: &Path, device: &str, image: &fs::File) -> Result<()> {
    let path = loader_dir.join(format!("{device}.bin"));
    let loader = read_required(&path)?;

    if (loader.len() as u64) < AMLOGIC_MIN_LEN {
        return Err(Error::TooSmall {
            path,
            size: loader.len() as u64,
        });
    }

    write_at(image, 0, &loader[..AMLOGIC_HEAD_LEN])?;
    write_at(
        image,
        AMLOGIC_TAIL_OFFSET,
        &loader[AMLOGIC_TAIL_OFFSET as usize..],
    )?;
    info!("Wrote Amlogic bootloader: {device}.bin");

    Ok(())
}

fn write_allwinner(loader_dir: &Path, device: &str, image: &fs::File) -> Result<()> {
    let spl_path = loader_dir.join(format!("u-boot-sunxi-with-spl-{device}.bin"));
    let spl = read_required(&spl_path)?;
    write_at(image, ALLWINNER_SPL_OFFSET, &spl)?;
    info!("Wrote Allwinner SPL: u-boot-sunxi-with-spl-{device}.bin");

    let mainline_path = loader_dir.join(format!("u-boot-mainline-{device}.bin"));
    if let Some(mainline) = read_optional(&mainline_path)? {
        write_at(image, ALLWINNER_MAINLINE_OFFSET, &mainline)?;
        info!("Wrote mainline u-boot: u-boot-mainline-{device}.bin");
    } else {
        debug!("No mainline u-boot for {device}");
    }

    Ok(())
}

fn write_rockchip(loader_dir: &Path, device: &str, image: &fs::File) -> Result<()> {
    let idb = read_required(&loader_dir.join(format!("idbloader-{device}.img")))?;
    write_at(image, ROCKCHIP_IDB_OFFSET, &idb)?;
    info!("Wrote idbloader: idbloader-{device}.img");

    let uboot = read_required(&loader_dir.join(format!("u-boot-{device}.itb")))?;
    write_at(image, ROCKCHIP_UBOOT_OFFSET, &uboot)?;
    info!("Wrote u-boot: u-boot-{device}.itb");

    let trust_path = loader_dir.join(format!("trust-{device}.bin"));
    if let Some(trust) = read_optional(&trust_path)? {
        write_at(image, ROCKCHIP_TRUST_OFFSET, &trust)?;
        info!("Wrote trust firmware: trust-{device}.bin");
    } else {
        debug!("No trust firmware for {device}");
    }

    Ok(())
}

/// Write the vendor's bootloader blobs into the image, fetching the loader
/// directory on first use, and fsync at the end of the stage.
pub fn write_loader(
    cache: &ArtifactCache,
    fetcher: &dyn Fetch,
    vendor: Vendor,
    device: &str,
    image: &fs::File,
) -> Result<()> {
    let loader_dir = cache.loader_dir(vendor, device);

    if !loader_dir.is_dir() {
        // Failure here isn't fatal by itself; a mandatory blob that's still
        // missing will surface as the real error below.
        if let Err(e) = fetcher.fetch_loader(vendor, device) {
            warn!("Could not fetch {vendor} loader for {device}: {e}");
        }
    }

    match vendor {
        Vendor::Amlogic => write_amlogic(&loader_dir, device, image)?,
        Vendor::Allwinner => write_allwinner(&loader_dir, device, image)?,
        Vendor::Rockchip => write_rockchip(&loader_dir, device, image)?,
    }

    image.sync_all()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::format::mbr::LOADER_REGION_SIZE;

    use super::{
        ALLWINNER_MAINLINE_OFFSET, ALLWINNER_SPL_OFFSET, ROCKCHIP_IDB_OFFSET,
        ROCKCHIP_TRUST_OFFSET, ROCKCHIP_UBOOT_OFFSET,
    };

    #[test]
    fn offsets_stay_in_loader_region() {
        for offset in [
            ALLWINNER_SPL_OFFSET,
            ALLWINNER_MAINLINE_OFFSET,
            ROCKCHIP_IDB_OFFSET,
            ROCKCHIP_UBOOT_OFFSET,
            ROCKCHIP_TRUST_OFFSET,
        ] {
            assert!(offset < LOADER_REGION_SIZE);
        }
    }

    #[test]
    fn rockchip_sector_math() {
        assert_eq!(ROCKCHIP_IDB_OFFSET, 32768);
        assert_eq!(ROCKCHIP_UBOOT_OFFSET, 8388608);
        assert_eq!(ROCKCHIP_TRUST_OFFSET, 12582912);
    }
}

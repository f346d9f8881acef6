// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! FAT32 authoring for the boot partition. All operations target a partition
//! window directly; nothing is ever mounted on the host.

use std::{
    fs::File,
    io::{self, Read, Seek, Write},
    path::Path,
    sync::atomic::AtomicBool,
};

use fatfs::{Date, DateTime, FatType, FormatVolumeOptions, FsOptions, Time, TimeProvider};
use thiserror::Error;
use tracing::debug;

use crate::stream;

/// Volume label of the boot partition, padded to FAT's fixed 11 bytes.
const BOOT_LABEL: [u8; 11] = *b"BOOT       ";

/// Fixed serial number so that formatting does not depend on the wall clock.
const VOLUME_SERIAL: u32 = 0x53424346;

/// A [`TimeProvider`] that always returns the DOS epoch, so that formatting
/// and file writes do not depend on the wall clock.
#[derive(Debug)]
struct NullTimeProvider;

impl TimeProvider for NullTimeProvider {
    fn get_current_date(&self) -> Date {
        Date {
            year: 1980,
            month: 1,
            day: 1,
        }
    }

    fn get_current_date_time(&self) -> DateTime {
        DateTime {
            date: self.get_current_date(),
            time: Time {
                hour: 0,
                min: 0,
                sec: 0,
                millis: 0,
            },
        }
    }
}

static NULL_TIME_PROVIDER: NullTimeProvider = NullTimeProvider;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid partition-relative path: {0:?}")]
    InvalidPath(String),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Format `stream` (a partition window) as FAT32 with the `BOOT` volume
/// label. The filesystem spans the entire window.
pub fn format_boot(stream: &mut (impl Read + Write + Seek)) -> Result<()> {
    let options = FormatVolumeOptions::new()
        .fat_type(FatType::Fat32)
        .volume_label(BOOT_LABEL)
        .volume_id(VOLUME_SERIAL);

    fatfs::format_volume(stream, options)?;

    Ok(())
}

/// An open FAT32 boot volume. Paths are partition-relative with `/`
/// separators. POSIX file modes cannot be represented on FAT and are
/// accepted but ignored.
pub struct BootVolume<S: Read + Write + Seek> {
    fs: fatfs::FileSystem<S>,
}

impl<S: Read + Write + Seek> BootVolume<S> {
    pub fn open(stream: S) -> Result<Self> {
        let options = FsOptions::new().time_provider(&NULL_TIME_PROVIDER);
        let fs = fatfs::FileSystem::new(stream, options)?;

        Ok(Self { fs })
    }

    /// Create `path` and any missing intermediate directories.
    pub fn mkdir_p(&self, path: &str) -> Result<()> {
        let mut dir = self.fs.root_dir();

        for component in path.split('/').filter(|c| !c.is_empty()) {
            // Opens the directory if it already exists.
            dir = dir.create_dir(component)?;
        }

        Ok(())
    }

    /// Create or truncate the file at `path`, writing `reader`'s contents.
    /// Missing parent directories are created implicitly.
    pub fn write_file(
        &self,
        path: &str,
        reader: impl Read,
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        let (parent, _) = path
            .rsplit_once('/')
            .unwrap_or(("", path));
        self.mkdir_p(parent)?;

        let mut file = self.fs.root_dir().create_file(path)?;
        file.truncate()?;

        stream::copy(reader, &mut file, cancel_signal)?;
        file.flush()?;

        Ok(())
    }

    /// List the entry names in a directory. `""` or `"/"` is the root.
    pub fn read_dir(&self, path: &str) -> Result<Vec<String>> {
        let root = self.fs.root_dir();
        let dir = if path.is_empty() || path == "/" {
            root
        } else {
            root.open_dir(path)?
        };

        let mut names = Vec::new();
        for entry in dir.iter() {
            let name = entry?.file_name();
            if name != "." && name != ".." {
                names.push(name);
            }
        }

        Ok(names)
    }

    /// Mirror a host directory tree into the volume, preserving the directory
    /// structure. Symlinks are followed; anything that isn't a file or a
    /// directory after resolution is skipped.
    pub fn copy_tree(&self, src: &Path, cancel_signal: &AtomicBool) -> Result<()> {
        self.copy_tree_at(src, "", cancel_signal)
    }

    fn copy_tree_at(&self, src: &Path, dest: &str, cancel_signal: &AtomicBool) -> Result<()> {
        let mut entries = src
            .read_dir()
            .map_err(Error::Io)?
            .collect::<io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            stream::check_cancel(cancel_signal)?;

            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                return Err(Error::InvalidPath(name.to_string_lossy().into_owned()));
            };

            let target = if dest.is_empty() {
                name.to_owned()
            } else {
                format!("{dest}/{name}")
            };

            // Follows symlinks. Broken links have no content to copy.
            let Ok(metadata) = entry.path().metadata() else {
                debug!("Skipping unreadable entry: {:?}", entry.path());
                continue;
            };

            if metadata.is_dir() {
                self.mkdir_p(&target)?;
                self.copy_tree_at(&entry.path(), &target, cancel_signal)?;
            } else if metadata.is_file() {
                let reader = File::open(entry.path())?;
                self.write_file(&target, reader, cancel_signal)?;
            }
        }

        Ok(())
    }

    /// Flush everything and release the underlying stream.
    pub fn unmount(self) -> Result<()> {
        self.fs.unmount()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Cursor, Read},
        sync::atomic::AtomicBool,
    };

    use super::BootVolume;

    fn format_small() -> Cursor<Vec<u8>> {
        // Smallest size where fatfs still picks FAT32.
        let mut stream = Cursor::new(vec![0u8; 64 * 1024 * 1024]);
        super::format_boot(&mut stream).unwrap();
        stream
    }

    #[test]
    fn label_in_boot_sector() {
        let stream = format_small();
        let data = stream.into_inner();

        // FAT32 boot sector stores the volume label at offset 71.
        assert_eq!(&data[71..82], b"BOOT       ");
    }

    #[test]
    fn write_and_read_back() {
        let cancel_signal = AtomicBool::new(false);
        let stream = format_small();

        let volume = BootVolume::open(stream).unwrap();
        volume.mkdir_p("dtb/amlogic").unwrap();
        volume
            .write_file(
                "dtb/amlogic/meson.dtb",
                Cursor::new(b"dtb".to_vec()),
                &cancel_signal,
            )
            .unwrap();

        // Existing files are truncated and rewritten.
        volume
            .write_file(
                "dtb/amlogic/meson.dtb",
                Cursor::new(b"x".to_vec()),
                &cancel_signal,
            )
            .unwrap();

        let names = volume.read_dir("dtb/amlogic").unwrap();
        assert_eq!(names, vec!["meson.dtb".to_owned()]);

        let fs = volume.fs;
        let mut file = fs.root_dir().open_file("dtb/amlogic/meson.dtb").unwrap();
        let mut data = Vec::new();
        file.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"x");
    }
}

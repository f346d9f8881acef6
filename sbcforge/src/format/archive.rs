// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Extraction of the archive formats the artifact repository ships: gzipped
//! tarballs for kernel and rootfs trees, xz streams for whole-disk images,
//! and zip files for loader bundles.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufReader, Seek},
    path::{Component, Path, PathBuf},
    sync::atomic::AtomicBool,
};

use thiserror::Error;
use tracing::trace;
use zip::{result::ZipError, ZipArchive};

use crate::{
    format::compression::{self, CompressedFormat, CompressedReader},
    stream,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Cannot determine archive format: {0:?}")]
    UnknownFormat(PathBuf),
    #[error("Archive entry escapes extraction directory: {0:?}")]
    UnsafeArchivePath(PathBuf),
    #[error("Failed to detect compression format")]
    Compression(#[from] compression::Error),
    #[error("Zip error")]
    Zip(#[from] ZipError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// The archive formats are a closed set. Dispatch is a plain enum selected by
/// file extension, with a magic-byte sniff as the fallback for unhelpful
/// names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    GzipTar,
    Xz,
    Zip,
}

impl ArchiveFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();

        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::GzipTar)
        } else if name.ends_with(".xz") {
            Some(Self::Xz)
        } else if name.ends_with(".zip") {
            Some(Self::Zip)
        } else {
            None
        }
    }

    pub fn detect(path: &Path) -> Result<Self> {
        if let Some(format) = Self::from_path(path) {
            return Ok(format);
        }

        let mut file = File::open(path)?;

        if ZipArchive::new(&mut file).is_ok() {
            return Ok(Self::Zip);
        }

        file.rewind()?;

        match CompressedReader::new(&mut file) {
            // A bare gzip stream with no tar inside fails during extraction.
            Ok(r) if r.format() == CompressedFormat::Gzip => Ok(Self::GzipTar),
            Ok(_) => Ok(Self::Xz),
            Err(_) => Err(Error::UnknownFormat(path.to_path_buf())),
        }
    }
}

/// Normalize an archive entry path and reject anything that could escape the
/// extraction directory.
fn sanitize_entry_path(raw: &Path) -> Result<PathBuf> {
    let mut result = PathBuf::new();

    for component in raw.components() {
        match component {
            Component::Normal(c) => result.push(c),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) | Component::ParentDir => {
                return Err(Error::UnsafeArchivePath(raw.to_path_buf()));
            }
        }
    }

    Ok(result)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

fn extract_tar_gz(archive: &Path, dest_dir: &Path, cancel_signal: &AtomicBool) -> Result<()> {
    let file = BufReader::new(File::open(archive)?);
    let decoder = CompressedReader::with_format(file, CompressedFormat::Gzip);
    let mut tar = tar::Archive::new(decoder);

    for entry in tar.entries()? {
        stream::check_cancel(cancel_signal)?;

        let mut entry = entry?;
        let raw_path = entry.path()?.into_owned();
        let target = dest_dir.join(sanitize_entry_path(&raw_path)?);

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                fs::create_dir_all(&target)?;
                set_mode(&target, 0o755)?;
            }
            tar::EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }

                let mode = entry.header().mode()?;
                let mut writer = File::create(&target)?;
                stream::copy(&mut entry, &mut writer, cancel_signal)?;

                set_mode(&target, mode & 0o7777)?;
            }
            // Symlinks, devices, and other special entries are not
            // materialized in staging trees.
            other => trace!("Skipping {other:?} entry: {raw_path:?}"),
        }
    }

    Ok(())
}

fn extract_xz(archive: &Path, dest_file: &Path, cancel_signal: &AtomicBool) -> Result<()> {
    let file = BufReader::new(File::open(archive)?);
    let mut decoder = CompressedReader::with_format(file, CompressedFormat::Xz);

    if let Some(parent) = dest_file.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut writer = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dest_file)?;

    stream::copy(&mut decoder, &mut writer, cancel_signal)?;

    Ok(())
}

fn extract_zip(archive: &Path, dest_dir: &Path, cancel_signal: &AtomicBool) -> Result<()> {
    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(file)?;

    for index in 0..zip.len() {
        stream::check_cancel(cancel_signal)?;

        let mut entry = zip.by_index(index)?;
        let Some(safe_path) = entry.enclosed_name() else {
            return Err(Error::UnsafeArchivePath(PathBuf::from(entry.name())));
        };
        let target = dest_dir.join(safe_path);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }

            let mut writer = File::create(&target)?;
            stream::copy(&mut entry, &mut writer, cancel_signal)?;

            if let Some(mode) = entry.unix_mode() {
                set_mode(&target, mode & 0o7777)?;
            }
        }
    }

    Ok(())
}

/// Extract `archive` to `dest`. For [`ArchiveFormat::GzipTar`] and
/// [`ArchiveFormat::Zip`], `dest` is a directory that's created if needed.
/// For [`ArchiveFormat::Xz`], the compressed payload is a single blob (eg. a
/// whole-disk image) and `dest` is the output file path.
pub fn extract(archive: &Path, dest: &Path, cancel_signal: &AtomicBool) -> Result<()> {
    match ArchiveFormat::detect(archive)? {
        ArchiveFormat::GzipTar => {
            fs::create_dir_all(dest)?;
            extract_tar_gz(archive, dest, cancel_signal)
        }
        ArchiveFormat::Xz => extract_xz(archive, dest, cancel_signal),
        ArchiveFormat::Zip => {
            fs::create_dir_all(dest)?;
            extract_zip(archive, dest, cancel_signal)
        }
    }
}

// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File},
    io::{Cursor, Write},
    path::Path,
    sync::atomic::AtomicBool,
};

use flate2::{write::GzEncoder, Compression};
use lzma_rust2::{XzOptions, XzWriter};
use sbcforge::format::archive::{self, Error};

fn write_tar_gz(path: &Path, entries: &[(&str, u32, &[u8])]) {
    let encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for (name, mode, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(*mode);
        builder.append_data(&mut header, name, Cursor::new(content)).unwrap();
    }

    builder.into_inner().unwrap().finish().unwrap();
}

#[test]
fn tar_gz_extraction() {
    let temp_dir = tempfile::tempdir().unwrap();
    let archive_path = temp_dir.path().join("boot.tar.gz");

    write_tar_gz(
        &archive_path,
        &[
            ("zImage", 0o644, b"kernel".as_slice()),
            ("dtb/meson-gxl.dtb", 0o644, b"dtb".as_slice()),
            ("scripts/boot.sh", 0o755, b"#!/bin/sh\n".as_slice()),
        ],
    );

    let cancel_signal = AtomicBool::new(false);
    let dest = temp_dir.path().join("out");
    archive::extract(&archive_path, &dest, &cancel_signal).unwrap();

    assert_eq!(fs::read(dest.join("zImage")).unwrap(), b"kernel");
    assert_eq!(fs::read(dest.join("dtb/meson-gxl.dtb")).unwrap(), b"dtb");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let mode = fs::metadata(dest.join("scripts/boot.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}

#[test]
fn tar_gz_traversal_rejected() {
    let temp_dir = tempfile::tempdir().unwrap();
    let archive_path = temp_dir.path().join("evil.tar.gz");

    write_tar_gz(&archive_path, &[("../evil", 0o644, b"nope".as_slice())]);

    let cancel_signal = AtomicBool::new(false);
    let dest = temp_dir.path().join("out");
    let err = archive::extract(&archive_path, &dest, &cancel_signal).unwrap_err();

    assert!(matches!(err, Error::UnsafeArchivePath(_)));
    assert!(!temp_dir.path().join("evil").exists());
}

#[test]
fn tar_gz_special_entries_ignored() {
    let temp_dir = tempfile::tempdir().unwrap();
    let archive_path = temp_dir.path().join("links.tar.gz");

    let encoder = GzEncoder::new(File::create(&archive_path).unwrap(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut header = tar::Header::new_gnu();
    header.set_size(4);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, "file", Cursor::new(b"data"))
        .unwrap();

    let mut header = tar::Header::new_gnu();
    header.set_size(0);
    header.set_mode(0o777);
    header.set_entry_type(tar::EntryType::Symlink);
    builder.append_link(&mut header, "link", "file").unwrap();

    builder.into_inner().unwrap().finish().unwrap();

    let cancel_signal = AtomicBool::new(false);
    let dest = temp_dir.path().join("out");
    archive::extract(&archive_path, &dest, &cancel_signal).unwrap();

    assert_eq!(fs::read(dest.join("file")).unwrap(), b"data");
    assert!(!dest.join("link").exists());
}

#[test]
fn xz_extraction_to_single_file() {
    let temp_dir = tempfile::tempdir().unwrap();
    let archive_path = temp_dir.path().join("rootfs.img.xz");

    let payload = (0..=255u8).cycle().take(100000).collect::<Vec<_>>();

    let mut writer =
        XzWriter::new(File::create(&archive_path).unwrap(), XzOptions::with_preset(6)).unwrap();
    writer.write_all(&payload).unwrap();
    writer.finish().unwrap();

    let cancel_signal = AtomicBool::new(false);
    let dest = temp_dir.path().join("rootfs.img");
    archive::extract(&archive_path, &dest, &cancel_signal).unwrap();

    assert_eq!(fs::read(&dest).unwrap(), payload);
}

#[test]
fn zip_extraction() {
    let temp_dir = tempfile::tempdir().unwrap();
    let archive_path = temp_dir.path().join("loader.zip");

    let mut writer = zip::ZipWriter::new(File::create(&archive_path).unwrap());
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    writer.add_directory("blobs", options).unwrap();
    writer.start_file("blobs/u-boot.bin", options).unwrap();
    writer.write_all(b"uboot").unwrap();
    writer.finish().unwrap();

    let cancel_signal = AtomicBool::new(false);
    let dest = temp_dir.path().join("out");
    archive::extract(&archive_path, &dest, &cancel_signal).unwrap();

    assert_eq!(fs::read(dest.join("blobs/u-boot.bin")).unwrap(), b"uboot");
}

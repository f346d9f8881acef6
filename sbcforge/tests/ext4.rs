// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File},
    io::{Read, Seek, SeekFrom},
    path::Path,
    sync::atomic::AtomicBool,
};

use sbcforge::format::ext4;

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

#[cfg(unix)]
fn mode_of(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;

    fs::metadata(path).unwrap().permissions().mode() & 0o777
}

fn build_staging_tree(root: &Path) {
    fs::create_dir_all(root.join("etc/init.d")).unwrap();
    fs::create_dir_all(root.join("lib/modules/6.1.0")).unwrap();
    fs::create_dir_all(root.join("usr/share/empty")).unwrap();

    fs::write(root.join("etc/hostname"), b"sbc\n").unwrap();
    fs::write(root.join("etc/init.d/boot"), b"#!/bin/sh\nkmodloader\n").unwrap();

    // Larger than one block, with a non-block-aligned tail.
    let mut big = vec![0u8; 3 * 4096 + 123];
    for (i, byte) in big.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    fs::write(root.join("lib/modules/6.1.0/r8152.ko"), &big).unwrap();

    fs::write(root.join("empty-file"), b"").unwrap();

    #[cfg(unix)]
    {
        set_mode(&root.join("etc/init.d/boot"), 0o755);
        set_mode(&root.join("etc/hostname"), 0o600);
        std::os::unix::fs::symlink("busybox", root.join("sh")).unwrap();
    }
}

#[test]
fn author_then_read_back() {
    let temp_dir = tempfile::tempdir().unwrap();
    let staging = temp_dir.path().join("staging");
    fs::create_dir(&staging).unwrap();
    build_staging_tree(&staging);

    let cancel_signal = AtomicBool::new(false);
    let size = 16 * 1024 * 1024u64;
    let image_path = temp_dir.path().join("root.img");

    {
        let mut image = File::create(&image_path).unwrap();
        image.set_len(size).unwrap();
        ext4::build_image(&staging, &mut image, size, &cancel_signal).unwrap();
        ext4::set_volume_label(&mut image, "ROOTFS").unwrap();
    }

    assert_eq!(fs::metadata(&image_path).unwrap().len(), size);

    // Magic and label at their fixed superblock offsets.
    let mut image = File::open(&image_path).unwrap();
    assert!(ext4::has_magic(&mut image).unwrap());

    image.seek(SeekFrom::Start(1024 + 120)).unwrap();
    let mut label = [0u8; 16];
    image.read_exact(&mut label).unwrap();
    assert_eq!(&label, b"ROOTFS\0\0\0\0\0\0\0\0\0\0");

    // Walking the image back out yields every regular file with identical
    // contents and modes. Symlinks are not materialized.
    let extracted = temp_dir.path().join("extracted");
    ext4::extract_image(&image_path, &extracted, &cancel_signal).unwrap();

    assert_eq!(
        fs::read(extracted.join("etc/hostname")).unwrap(),
        fs::read(staging.join("etc/hostname")).unwrap(),
    );
    assert_eq!(
        fs::read(extracted.join("etc/init.d/boot")).unwrap(),
        fs::read(staging.join("etc/init.d/boot")).unwrap(),
    );
    assert_eq!(
        fs::read(extracted.join("lib/modules/6.1.0/r8152.ko")).unwrap(),
        fs::read(staging.join("lib/modules/6.1.0/r8152.ko")).unwrap(),
    );
    assert_eq!(fs::read(extracted.join("empty-file")).unwrap(), b"");
    assert!(extracted.join("usr/share/empty").is_dir());

    #[cfg(unix)]
    {
        assert_eq!(mode_of(&extracted.join("etc/init.d/boot")), 0o755);
        assert_eq!(mode_of(&extracted.join("etc/hostname")), 0o600);
        assert!(!extracted.join("sh").exists());
    }
}

#[test]
fn authoring_is_deterministic() {
    let temp_dir = tempfile::tempdir().unwrap();
    let staging = temp_dir.path().join("staging");
    fs::create_dir(&staging).unwrap();
    build_staging_tree(&staging);

    let cancel_signal = AtomicBool::new(false);
    let size = 8 * 1024 * 1024u64;

    let author = |path: &Path| {
        let mut image = File::create(path).unwrap();
        image.set_len(size).unwrap();
        ext4::build_image(&staging, &mut image, size, &cancel_signal).unwrap();
    };

    let first = temp_dir.path().join("a.img");
    let second = temp_dir.path().join("b.img");
    author(&first);
    author(&second);

    assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
}

#[test]
fn multi_group_image() {
    let temp_dir = tempfile::tempdir().unwrap();
    let staging = temp_dir.path().join("staging");
    fs::create_dir(&staging).unwrap();

    // A file large enough to span several block groups (and the backup
    // superblock in group 1).
    let mut big = vec![0u8; 135 * 1024 * 1024];
    for (i, byte) in big.iter_mut().enumerate() {
        *byte = (i % 241) as u8;
    }
    fs::write(staging.join("blob"), &big).unwrap();

    let cancel_signal = AtomicBool::new(false);
    // 160 MiB = 40960 blocks = 2 groups.
    let size = 160 * 1024 * 1024u64;
    let image_path = temp_dir.path().join("root.img");

    {
        let mut image = File::create(&image_path).unwrap();
        image.set_len(size).unwrap();
        ext4::build_image(&staging, &mut image, size, &cancel_signal).unwrap();
    }

    let extracted = temp_dir.path().join("extracted");
    ext4::extract_image(&image_path, &extracted, &cancel_signal).unwrap();

    assert_eq!(fs::read(extracted.join("blob")).unwrap(), big);
}

#[test]
fn tree_too_large_for_image() {
    let temp_dir = tempfile::tempdir().unwrap();
    let staging = temp_dir.path().join("staging");
    fs::create_dir(&staging).unwrap();
    fs::write(staging.join("blob"), vec![0xaau8; 8 * 1024 * 1024]).unwrap();

    let cancel_signal = AtomicBool::new(false);
    let mut image = std::io::Cursor::new(Vec::new());

    // 4 MiB image cannot hold an 8 MiB file.
    let err = ext4::build_image(&staging, &mut image, 4 * 1024 * 1024, &cancel_signal)
        .unwrap_err();
    assert!(matches!(err, ext4::Error::OutOfSpace));
}

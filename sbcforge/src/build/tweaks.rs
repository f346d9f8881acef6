// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Vendor-specific text edits applied to the assembled rootfs tree. All
//! edits are pure read-transform-write functions: absent files and absent
//! markers are no-ops and reapplying a tweak set never changes the result.

use std::{fs, io, path::Path};

use bstr::ByteSlice;
use tracing::debug;

use crate::device::Vendor;

/// Replace every occurrence of `needle` in the file. Returns whether the
/// file changed. Missing files are skipped.
fn replace_in_file(path: &Path, needle: &str, replacement: &str) -> io::Result<bool> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    let updated = content.replace(needle, replacement);
    if updated == content {
        return Ok(false);
    }

    fs::write(path, updated)?;

    Ok(true)
}

/// Insert `line` (plus a newline) immediately before the first occurrence of
/// `marker`. A missing file or marker is a no-op, as is a file that already
/// contains the line.
fn prepend_line_before(path: &Path, marker: &str, line: &str) -> io::Result<bool> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    if content.contains_str(line) {
        return Ok(false);
    }

    let Some(index) = content.find(marker) else {
        return Ok(false);
    };

    let mut updated = Vec::with_capacity(content.len() + line.len() + 1);
    updated.extend_from_slice(&content[..index]);
    updated.extend_from_slice(line.as_bytes());
    updated.push(b'\n');
    updated.extend_from_slice(&content[index..]);

    fs::write(path, updated)?;

    Ok(true)
}

/// Write a file, creating parent directories. Skips the write if the content
/// already matches.
fn write_file(path: &Path, content: &[u8]) -> io::Result<()> {
    if let Ok(existing) = fs::read(path) {
        if existing == content {
            return Ok(());
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(path, content)
}

fn apply_amlogic(root: &Path) -> io::Result<()> {
    write_file(&root.join("etc/modules.d/pwm-meson"), b"pwm_meson\n")?;

    let inittab = root.join("etc/inittab");
    replace_in_file(&inittab, "ttyAMA0", "ttyAML0")?;
    replace_in_file(&inittab, "ttyS0", "tty0")?;

    prepend_line_before(
        &root.join("etc/init.d/boot"),
        "kmodloader",
        "\tmkdir -p /tmp/upgrade",
    )?;

    Ok(())
}

fn apply_allwinner_rockchip(root: &Path) -> io::Result<()> {
    let inittab = root.join("etc/inittab");
    replace_in_file(&inittab, "ttyAMA0", "tty1")?;
    replace_in_file(&inittab, "ttyS0", "ttyS2")?;

    prepend_line_before(
        &root.join("etc/init.d/boot"),
        "kmodloader",
        "\tulimit -n 131072",
    )?;

    replace_in_file(
        &root.join("lib/netifd/wireless/mac80211.sh"),
        "iw ",
        "ipconfig ",
    )?;

    Ok(())
}

/// Apply the vendor's tweak set to an assembled rootfs tree.
pub fn apply(vendor: Vendor, root: &Path) -> io::Result<()> {
    debug!("Applying {vendor} tweaks to {root:?}");

    match vendor {
        Vendor::Amlogic => apply_amlogic(root),
        Vendor::Allwinner | Vendor::Rockchip => apply_allwinner_rockchip(root),
    }
}

// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! The device index maps board names to the SoC family that dictates the
//! bootloader layout and rootfs tweak set.

use std::{fmt, fs, io, path::Path, str::FromStr};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
    #[error("Unsupported vendor {vendor:?} for device {device}")]
    UnsupportedVendor { device: String, vendor: String },
    #[error("Failed to parse device index")]
    Parse(#[from] toml::de::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// The closed set of supported SoC families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    Amlogic,
    Allwinner,
    Rockchip,
}

impl Vendor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Amlogic => "amlogic",
            Self::Allwinner => "allwinner",
            Self::Rockchip => "rockchip",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vendor {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "amlogic" => Ok(Self::Amlogic),
            "allwinner" => Ok(Self::Allwinner),
            "rockchip" => Ok(Self::Rockchip),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    pub name: String,
    pub vendor: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeviceIndex {
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

impl DeviceIndex {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Ok(toml::from_str(&data)?)
    }

    /// Look up the vendor for a device name. Matching is case-insensitive and
    /// an exact name match always wins over a substring match. With several
    /// exact matches, the first one in index order is used; among substring
    /// matches, the longest registered name wins.
    pub fn vendor_of(&self, device: &str) -> Result<Vendor> {
        let wanted = device.to_ascii_lowercase();

        let entry = self
            .devices
            .iter()
            .find(|e| e.name.to_ascii_lowercase() == wanted)
            .or_else(|| {
                // Short names like "s905" shadow every device in that family,
                // so the most specific registered name must win.
                self.devices
                    .iter()
                    .filter(|e| wanted.contains(&e.name.to_ascii_lowercase()))
                    .max_by_key(|e| e.name.len())
            })
            .ok_or_else(|| Error::UnknownDevice(device.to_owned()))?;

        entry
            .vendor
            .parse()
            .map_err(|()| Error::UnsupportedVendor {
                device: device.to_owned(),
                vendor: entry.vendor.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{DeviceEntry, DeviceIndex, Error, Vendor};

    fn entry(name: &str, vendor: &str) -> DeviceEntry {
        DeviceEntry {
            name: name.to_owned(),
            vendor: vendor.to_owned(),
            path: String::new(),
        }
    }

    #[test]
    fn exact_beats_substring() {
        let index = DeviceIndex {
            devices: vec![
                entry("s905", "rockchip"),
                entry("s905x-box", "amlogic"),
            ],
        };

        // "s905x-box" contains "s905", but the exact match wins.
        assert_eq!(index.vendor_of("s905x-box").unwrap(), Vendor::Amlogic);
        assert_eq!(index.vendor_of("S905X-BOX").unwrap(), Vendor::Amlogic);

        // A variant name matches both entries as substrings; the longer,
        // more specific "s905x-box" must win over the "s905" prefix.
        assert_eq!(index.vendor_of("s905x-box-v2").unwrap(), Vendor::Amlogic);

        // Only the short prefix matches here.
        assert_eq!(index.vendor_of("s905-generic").unwrap(), Vendor::Rockchip);
    }

    #[test]
    fn first_exact_match_wins() {
        let index = DeviceIndex {
            devices: vec![
                entry("h618-tv", "allwinner"),
                entry("H618-TV", "rockchip"),
            ],
        };

        assert_eq!(index.vendor_of("h618-tv").unwrap(), Vendor::Allwinner);
    }

    #[test]
    fn errors() {
        let index = DeviceIndex {
            devices: vec![entry("rk3566-box", "broadcom")],
        };

        assert_matches!(
            index.vendor_of("acme-9000"),
            Err(Error::UnknownDevice(_))
        );
        assert_matches!(
            index.vendor_of("rk3566-box"),
            Err(Error::UnsupportedVendor { .. })
        );
    }
}

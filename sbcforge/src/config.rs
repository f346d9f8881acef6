// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Build profile loading. A profile is a small TOML file carrying the same
//! fields as the `build` subcommand's flags.

use std::{fs, io, path::Path, path::PathBuf};

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_SIZE_MB: u32 = 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to parse build profile")]
    Parse(#[from] toml::de::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PatchRaw {
    Bool(bool),
    Text(String),
}

/// The `patch` option names an optional overlay archive. For historical
/// reasons, a handful of string values mean "disabled" and plain booleans are
/// accepted too.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "PatchRaw")]
pub struct PatchOption(String);

impl From<PatchRaw> for PatchOption {
    fn from(raw: PatchRaw) -> Self {
        match raw {
            PatchRaw::Bool(true) => Self("true".to_owned()),
            PatchRaw::Bool(false) => Self(String::new()),
            PatchRaw::Text(text) => Self(text),
        }
    }
}

impl From<&str> for PatchOption {
    fn from(text: &str) -> Self {
        Self(text.to_owned())
    }
}

impl PatchOption {
    pub fn enabled(&self) -> bool {
        let value = self.0.trim();

        !(value.is_empty()
            || value.eq_ignore_ascii_case("false")
            || value.eq_ignore_ascii_case("no")
            || value.eq_ignore_ascii_case("none"))
    }

    /// The patch archive name, if the option is enabled.
    pub fn name(&self) -> Option<&str> {
        self.enabled().then(|| self.0.trim())
    }
}

#[derive(Debug, Deserialize)]
pub struct BuildProfile {
    pub device: String,
    pub kernel: String,
    pub rootfs: String,
    #[serde(default = "default_size")]
    pub size: u32,
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default)]
    pub patch: PatchOption,
}

fn default_size() -> u32 {
    DEFAULT_SIZE_MB
}

pub fn load_profile(path: &Path) -> Result<BuildProfile> {
    let data = fs::read_to_string(path)?;
    Ok(toml::from_str(&data)?)
}

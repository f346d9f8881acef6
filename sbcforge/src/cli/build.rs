// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
};

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::{
    build::{BuildRequest, Builder},
    cache::{ArtifactCache, OfflineFetcher},
    cli::status,
    config::{self, PatchOption},
    device::DeviceIndex,
};

fn build_request(cli: &BuildCli) -> Result<BuildRequest> {
    let mut request = if let Some(profile_path) = &cli.profile {
        let profile = config::load_profile(profile_path)
            .with_context(|| format!("Failed to load profile: {profile_path:?}"))?;

        BuildRequest {
            device: profile.device,
            kernel: profile.kernel,
            rootfs: profile.rootfs,
            size_mb: profile.size,
            output: profile.output.unwrap_or_default(),
            patch: profile.patch,
        }
    } else {
        let (Some(device), Some(kernel), Some(rootfs)) =
            (&cli.device, &cli.kernel, &cli.rootfs)
        else {
            bail!("Either --profile or --device/--kernel/--rootfs is required");
        };

        BuildRequest {
            device: device.clone(),
            kernel: kernel.clone(),
            rootfs: rootfs.clone(),
            size_mb: cli.size,
            output: cli.output.clone().unwrap_or_default(),
            patch: cli
                .patch
                .as_deref()
                .map(PatchOption::from)
                .unwrap_or_default(),
        }
    };

    if request.output.as_os_str().is_empty() {
        request.output = PathBuf::from(format!("out/{}.img", request.device));
    }

    Ok(request)
}

pub fn build_main(cli: &BuildCli, cancel_signal: &Arc<AtomicBool>) -> Result<()> {
    let request = build_request(cli)?;
    let output = request.output.clone();

    let devices = DeviceIndex::load(&cli.devices)
        .with_context(|| format!("Failed to load device index: {:?}", cli.devices))?;
    let cache = ArtifactCache::new(cli.cache_dir.clone());
    let fetcher = OfflineFetcher;

    let builder = Builder::new(request, &devices, &cache, &fetcher)?;
    builder.build(cancel_signal)?;

    status!("Image written to {output:?}");

    Ok(())
}

/// Build a firmware image from a profile file or from individual flags.
#[derive(Debug, Parser)]
pub struct BuildCli {
    /// Path to build profile file.
    #[arg(short, long, value_name = "FILE")]
    pub profile: Option<PathBuf>,

    /// Device name (looked up in the device index).
    #[arg(short, long, value_name = "NAME")]
    pub device: Option<String>,

    /// Kernel version.
    #[arg(short, long, value_name = "VERSION")]
    pub kernel: Option<String>,

    /// Rootfs file name.
    #[arg(short, long, value_name = "NAME")]
    pub rootfs: Option<String>,

    /// Root partition payload size in MiB.
    #[arg(short, long, value_name = "MIB", default_value_t = config::DEFAULT_SIZE_MB)]
    pub size: u32,

    /// Output image path. Defaults to out/<device>.img.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Patch overlay archive name ("false"/"no"/"none" disable it).
    #[arg(long, value_name = "NAME")]
    pub patch: Option<String>,

    /// Path to the device index.
    #[arg(long, value_name = "FILE", default_value = "configs/devices.toml")]
    pub devices: PathBuf,

    /// Artifact cache directory.
    #[arg(long, value_name = "DIR", default_value = ".cache/data")]
    pub cache_dir: PathBuf,
}

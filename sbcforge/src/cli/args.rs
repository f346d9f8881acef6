// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cli::build;

#[derive(Debug, Subcommand)]
pub enum Command {
    Build(build::BuildCli),
}

#[derive(Debug, Parser)]
#[command(version, about = "Assemble bootable firmware images for ARM single-board computers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &Arc<AtomicBool>) -> Result<()> {
    let cli = Cli::parse();

    init_logging();
    logging_initialized.store(true, Ordering::SeqCst);

    match cli.command {
        Command::Build(c) => build::build_main(&c, cancel_signal),
    }
}

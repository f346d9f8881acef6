// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tracing::error;

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Install a ctrl-c handler that flips the shared cancel flag. Every bulk
/// copy loop in the pipeline polls it, so an interrupted build unwinds
/// through the normal error path and its scratch state is dropped. A build
/// without a handler just can't be cancelled cleanly.
fn cancel_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = flag.clone();

    if let Err(e) = ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst)) {
        eprintln!("Failed to set signal handler: {e}");
    }

    flag
}

fn main() -> ExitCode {
    let cancel_signal = cancel_flag();

    match sbcforge::cli::args::main(&LOGGING_INITIALIZED, &cancel_signal) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Argument parsing errors arrive before logging is set up.
            if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
                error!("{e:?}");
            } else {
                eprintln!("{e:?}");
            }
            ExitCode::FAILURE
        }
    }
}

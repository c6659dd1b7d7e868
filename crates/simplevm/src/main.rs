// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2024 Akira Moroo

//! # SimpleVM
//!
//! Boots a Linux guest from a kernel, an initial ramdisk, and a raw root disk
//! image, and attaches its serial console to this terminal.
//! 1. Build the boot configuration from the given paths and start the VM.
//! 2. Copy guest console output to stdout and stdin to the guest.
//! 3. Print every state change to stderr.
//! 4. On Ctrl-C, ask the guest to shut down; a second Ctrl-C exits at once.

mod status;

use std::{
    io::{self, Read},
    path::PathBuf,
    thread,
};

use anyhow::Result;
use clap::Parser;
use log::{debug, info, warn};
use tokio::{
    io::AsyncWriteExt,
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use vmm::{
    BootInput, BootInputs, ConsoleBridge, Hypervisor, LifecycleNotice, VmController, VmState,
};

use status::StatusReporter;

#[derive(clap::Parser)]
#[clap(version, about)]
struct Opts {
    /// Path to the guest kernel
    #[clap(short, long, env = "SIMPLEVM_KERNEL")]
    kernel: Option<PathBuf>,
    /// Path to the initial ramdisk
    #[clap(long, env = "SIMPLEVM_INITRD")]
    initrd: Option<PathBuf>,
    /// Path to the raw root disk image, attached read-only
    #[clap(long, env = "SIMPLEVM_IMAGE")]
    image: Option<PathBuf>,
    /// Print state changes as JSON lines
    #[clap(long)]
    json: bool,
    /// Do not forward stdin to the guest console
    #[clap(long)]
    detach_console: bool,
    /// Log at debug level unless RUST_LOG says otherwise
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    let default_filter = if opts.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    run_platform(opts).await
}

#[cfg(target_os = "macos")]
async fn run_platform(opts: Opts) -> Result<()> {
    let hypervisor = vmm::virtualization::Virtualization::new()?;
    run(hypervisor, opts).await
}

#[cfg(not(target_os = "macos"))]
async fn run_platform(_opts: Opts) -> Result<()> {
    Err(vmm::Error::Unsupported(
        "Virtualization.framework is only available on macOS".to_string(),
    )
    .into())
}

/// Reads stdin on a dedicated thread; the runtime's stdin handle is not
/// suited to interactive input.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<Vec<u8>> {
    let (tx, rx) = mpsc::unbounded_channel();
    thread::spawn(move || {
        let mut stdin = io::stdin().lock();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
        debug!("stdin closed");
    });
    rx
}

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
async fn run<H: Hypervisor>(hypervisor: H, opts: Opts) -> Result<()> {
    let inputs = BootInputs::new(opts.kernel, opts.initrd, opts.image);
    for input in [BootInput::Kernel, BootInput::InitialRamdisk, BootInput::RootImage] {
        info!("{}: {}", input, inputs.display_name(input));
    }

    let mut controller = VmController::with_inputs(hypervisor, inputs)?;
    let (output_tx, mut output) = mpsc::unbounded_channel();
    let mut console = ConsoleBridge::attach(controller.console(), output_tx)?;
    let mut states = controller.subscribe();
    let mut notices = controller.notices();
    let reporter = StatusReporter::new(opts.json);

    let mut keystrokes = if opts.detach_console {
        None
    } else {
        Some(spawn_stdin_reader())
    };
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut stdout = tokio::io::stdout();
    let mut stop_requested = false;

    controller.start()?;

    loop {
        tokio::select! {
            _ = controller.handle_next_event() => {}
            Some(state) = states.next() => {
                reporter.report(&state)?;
                if stop_requested && state.is_terminal() {
                    break;
                }
            }
            Ok(notice) = notices.recv() => match notice {
                LifecycleNotice::StartFailed(reason) => {
                    anyhow::bail!("Failed to start VM: {}", reason);
                }
                LifecycleNotice::GuestStopped | LifecycleNotice::GuestError(_) => break,
                LifecycleNotice::StopFailed(_) => {}
            },
            Some(chunk) = output.recv() => {
                stdout.write_all(&chunk).await?;
                stdout.flush().await?;
            }
            bytes = async { keystrokes.as_mut()?.recv().await }, if keystrokes.is_some() => {
                match bytes {
                    Some(bytes) => console.send(&bytes),
                    None => keystrokes = None,
                }
            }
            _ = interrupt.recv() => {
                if stop_requested {
                    warn!("Exiting without waiting for the guest");
                    break;
                }
                stop_requested = true;
                controller.stop();
            }
        }
    }

    controller.drain_events();
    let state = controller.state();
    reporter.report(&state)?;
    if let VmState::Error(detail) = state {
        anyhow::bail!("VM stopped with an error: {}", detail);
    }

    console.detach();
    Ok(())
}

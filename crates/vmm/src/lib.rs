// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2024 Akira Moroo

//! Launches and supervises a single Linux guest and exposes its serial console
//! as a byte stream.

pub mod config;
pub mod console;
pub mod controller;
mod error;
pub mod hypervisor;
pub mod pipe;
#[cfg(target_os = "macos")]
mod queue;
mod sampler;
pub mod state;
#[cfg(target_os = "macos")]
pub mod virtualization;

pub use config::{BootConfiguration, BootInput, BootInputs, ConfigError};
pub use console::{ConsoleBridge, ConsoleSink};
pub use controller::{LifecycleNotice, VmController};
pub use error::Error;
pub use hypervisor::{EventSender, Hypervisor, Machine, MachineEvent};
pub use pipe::{BytePipe, ConsolePipePair, SerialAttachment};
pub use state::{StateSubscription, VmState};

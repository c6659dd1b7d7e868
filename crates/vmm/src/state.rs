// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2024 Akira Moroo

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Observed lifecycle state of the guest VM.
///
/// `NotStarted` doubles as "unobserved": it is the value before the first
/// start and after a stop request, until the hypervisor reports again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state", content = "detail")]
pub enum VmState {
    NotStarted,
    Starting,
    Running,
    Pausing,
    Paused,
    Resuming,
    Stopping,
    Stopped,
    Error(String),
    /// A value the hypervisor reported that this crate does not know about.
    Unknown(isize),
}

impl VmState {
    /// Maps a `VZVirtualMachineState` raw value.
    pub fn from_raw(raw: isize) -> Self {
        match raw {
            0 => VmState::Stopped,
            1 => VmState::Running,
            2 => VmState::Paused,
            3 => VmState::Error(String::new()),
            4 => VmState::Starting,
            5 => VmState::Pausing,
            6 => VmState::Resuming,
            7 => VmState::Stopping,
            _ => VmState::Unknown(raw),
        }
    }

    /// Human readable label shown next to the start/stop control.
    pub fn label(&self) -> String {
        match self {
            VmState::NotStarted => "(no state)".to_string(),
            VmState::Starting => "Starting".to_string(),
            VmState::Running => "Running".to_string(),
            VmState::Pausing => "Pausing".to_string(),
            VmState::Paused => "Paused".to_string(),
            VmState::Resuming => "Resuming".to_string(),
            VmState::Stopping => "Stopping".to_string(),
            VmState::Stopped => "Stopped".to_string(),
            VmState::Error(_) => "Error".to_string(),
            VmState::Unknown(raw) => format!("Unknown {}", raw),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, VmState::Stopped | VmState::Error(_))
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// A subscription to [`VmState`] changes.
///
/// The first call to [`StateSubscription::next`] returns the current value
/// without waiting, every later call waits for the next change.
pub struct StateSubscription {
    rx: watch::Receiver<VmState>,
    initial_delivered: bool,
}

impl StateSubscription {
    pub(crate) fn new(rx: watch::Receiver<VmState>) -> Self {
        Self {
            rx,
            initial_delivered: false,
        }
    }

    /// Returns `None` once the owning controller is gone.
    pub async fn next(&mut self) -> Option<VmState> {
        if !self.initial_delivered {
            self.initial_delivered = true;
            return Some(self.rx.borrow_and_update().clone());
        }
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Current value, without marking it as seen.
    pub fn current(&self) -> VmState {
        self.rx.borrow().clone()
    }
}

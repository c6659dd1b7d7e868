// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2024 Akira Moroo

//! The seam between the lifecycle controller and the platform hypervisor.
//!
//! A backend never calls back into the controller. It reports everything it
//! observes as [`MachineEvent`]s on an [`EventSender`], and the controller
//! applies them on its own execution context.

use log::debug;
use tokio::sync::mpsc;

use crate::{config::BootConfiguration, error::Error, state::VmState};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MachineEvent {
    /// The machine's state property changed. The first event after
    /// [`Machine::start`] carries the state observed at that moment.
    StateChanged(VmState),
    /// The start completion handler reported an error.
    StartFailed(String),
    /// The guest shut itself down.
    GuestStopped,
    /// The machine stopped because of a runtime fault.
    GuestError(String),
}

#[derive(Debug)]
pub(crate) struct RunEvent {
    pub run: u64,
    pub event: MachineEvent,
}

/// Sending half of the controller's event queue, tagged with the run that
/// created the machine so events from an abandoned machine can be told apart.
#[derive(Clone, Debug)]
pub struct EventSender {
    run: u64,
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl EventSender {
    pub(crate) fn new(run: u64, tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        Self { run, tx }
    }

    pub fn run(&self) -> u64 {
        self.run
    }

    /// `true` once the controller has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Returns `false` once the controller has gone away.
    pub fn send(&self, event: MachineEvent) -> bool {
        let run = self.run;
        match self.tx.send(RunEvent { run, event }) {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropping event for run {}: {:?}", run, e.0.event);
                false
            }
        }
    }
}

/// A platform facility able to run a [`BootConfiguration`].
pub trait Hypervisor {
    type Machine: Machine;

    /// Hypervisor-side validation of an assembled configuration.
    fn validate(&self, config: &BootConfiguration) -> Result<(), Error>;

    /// Creates a stopped machine that reports to `events`.
    fn create(&self, config: BootConfiguration, events: EventSender)
        -> Result<Self::Machine, Error>;
}

/// A handle to one virtual machine instance.
///
/// Dropping the handle does not stop the machine; it only gives up the right
/// to issue further requests.
pub trait Machine {
    /// Asks the hypervisor to boot the machine. Completion, including
    /// failure, is reported as events.
    fn start(&self);

    /// Asks the guest to shut down cooperatively.
    fn request_stop(&self) -> Result<(), Error>;
}

// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2024 Akira Moroo

//! Lifecycle controller for a single virtual machine.
//!
//! The controller owns the machine handle, the console pipes, and the current
//! [`VmState`]. All of them are mutated on whatever context calls into the
//! controller; hypervisor callbacks are queued and applied by
//! [`VmController::handle_next_event`] or [`VmController::drain_events`].

use std::io;

use log::{debug, error, info};
use tokio::sync::{broadcast, mpsc, watch};

use crate::{
    config::BootInputs,
    error::Error,
    hypervisor::{EventSender, Hypervisor, Machine, MachineEvent, RunEvent},
    pipe::ConsolePipePair,
    state::{StateSubscription, VmState},
};

const NOTICE_CAPACITY: usize = 16;

/// Lifecycle events that are not state changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleNotice {
    StartFailed(String),
    StopFailed(String),
    GuestStopped,
    GuestError(String),
}

struct ActiveMachine<M> {
    run: u64,
    machine: M,
}

pub struct VmController<H: Hypervisor> {
    hypervisor: H,
    inputs: BootInputs,
    console: ConsolePipePair,
    active: Option<ActiveMachine<H::Machine>>,
    run: u64,
    state: watch::Sender<VmState>,
    notices: broadcast::Sender<LifecycleNotice>,
    events_tx: mpsc::UnboundedSender<RunEvent>,
    events_rx: mpsc::UnboundedReceiver<RunEvent>,
}

impl<H: Hypervisor> VmController<H> {
    pub fn new(hypervisor: H) -> io::Result<Self> {
        Self::with_inputs(hypervisor, BootInputs::default())
    }

    pub fn with_inputs(hypervisor: H, inputs: BootInputs) -> io::Result<Self> {
        let (state, _) = watch::channel(VmState::NotStarted);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            hypervisor,
            inputs,
            console: ConsolePipePair::new()?,
            active: None,
            run: 0,
            state,
            notices,
            events_tx,
            events_rx,
        })
    }

    pub fn inputs(&self) -> &BootInputs {
        &self.inputs
    }

    pub fn inputs_mut(&mut self) -> &mut BootInputs {
        &mut self.inputs
    }

    pub fn is_ready(&self) -> bool {
        self.inputs.is_ready()
    }

    /// The console pipes. They outlive every individual run, so a console
    /// attached once keeps working across restarts.
    pub fn console(&self) -> &ConsolePipePair {
        &self.console
    }

    pub fn has_machine(&self) -> bool {
        self.active.is_some()
    }

    pub fn state(&self) -> VmState {
        self.state.borrow().clone()
    }

    /// `None` while no state has been observed.
    pub fn state_description(&self) -> Option<String> {
        match &*self.state.borrow() {
            VmState::NotStarted => None,
            state => Some(state.label()),
        }
    }

    pub fn subscribe(&self) -> StateSubscription {
        StateSubscription::new(self.state.subscribe())
    }

    pub fn notices(&self) -> broadcast::Receiver<LifecycleNotice> {
        self.notices.subscribe()
    }

    /// Builds a configuration from the current inputs and boots a new machine.
    ///
    /// A no-op while a machine exists. Configuration errors are logged and
    /// returned, and leave the state untouched. Everything that happens after
    /// the start request is issued arrives as state changes or notices.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.active.is_some() {
            debug!("VM already exists, ignoring start request");
            return Ok(());
        }

        let serial = self.console.guest_attachment().map_err(|e| {
            error!("Failed to attach console: {}", e);
            Error::Console(e)
        })?;

        let config = self.inputs.build(serial).map_err(|e| {
            error!("Failed to build configuration: {}", e);
            Error::from(e)
        })?;

        if let Err(e) = self.hypervisor.validate(&config) {
            error!("Error: {}", e);
            return Err(e);
        }

        let run = self.run + 1;
        let events = EventSender::new(run, self.events_tx.clone());
        let machine = self.hypervisor.create(config, events).map_err(|e| {
            error!("Failed to create VM: {}", e);
            e
        })?;
        self.run = run;

        self.publish(VmState::NotStarted);
        info!("Starting VM (run {})", run);
        machine.start();
        self.active = Some(ActiveMachine { run, machine });

        Ok(())
    }

    /// Requests a cooperative shutdown and releases the machine handle.
    ///
    /// The handle is dropped whether or not the request succeeds, and the
    /// state reads as unobserved until the hypervisor reports again.
    pub fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            debug!("No VM to stop");
            return;
        };

        self.publish(VmState::NotStarted);
        info!("Stopping VM (run {})", active.run);
        if let Err(e) = active.machine.request_stop() {
            error!("Failed to stop: {}", e);
            self.notify(LifecycleNotice::StopFailed(e.to_string()));
        }
    }

    /// Waits for the next hypervisor event and applies it.
    pub async fn handle_next_event(&mut self) {
        // The controller holds a sender, so the queue never closes.
        if let Some(event) = self.events_rx.recv().await {
            self.apply(event);
        }
    }

    /// Applies every event that is already queued. Returns how many there
    /// were.
    pub fn drain_events(&mut self) -> usize {
        let mut count = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.apply(event);
            count += 1;
        }
        count
    }

    fn apply(&mut self, RunEvent { run, event }: RunEvent) {
        if run != self.run {
            debug!("Ignoring event from run {}: {:?}", run, event);
            return;
        }

        match event {
            MachineEvent::StateChanged(state) => {
                debug!("State changed: {}", state);
                self.publish(state);
            }
            MachineEvent::StartFailed(reason) => {
                error!("Failed: {}", reason);
                self.notify(LifecycleNotice::StartFailed(reason));
            }
            MachineEvent::GuestStopped => {
                info!("Stopped");
                self.release(run);
                self.notify(LifecycleNotice::GuestStopped);
            }
            MachineEvent::GuestError(reason) => {
                error!("Stopped with error: {}", reason);
                self.release(run);
                self.publish(VmState::Error(reason.clone()));
                self.notify(LifecycleNotice::GuestError(reason));
            }
        }
    }

    fn release(&mut self, run: u64) {
        if self.active.as_ref().is_some_and(|a| a.run == run) {
            self.active = None;
        }
    }

    fn publish(&self, state: VmState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn notify(&self, notice: LifecycleNotice) {
        if self.notices.send(notice).is_err() {
            debug!("No listener for lifecycle notice");
        }
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2024 Akira Moroo

//! A scriptable hypervisor for driving the controller without a real VM.

#![allow(dead_code)]

use std::{
    io::{Read, Write},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
    thread,
};

use tempfile::TempDir;
use vmm::{
    config::{BootConfiguration, Device},
    BootInputs, Error, EventSender, Hypervisor, Machine, MachineEvent, SerialAttachment, VmState,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Kernel, initrd, and a 1 MiB raw image in a temporary directory.
pub struct Fixtures {
    pub dir: TempDir,
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub image: PathBuf,
}

impl Fixtures {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let kernel = dir.path().join("vmlinuz");
        let initrd = dir.path().join("initrd.img");
        let image = dir.path().join("root.img");
        std::fs::write(&kernel, b"\x7fELF\x02\x01\x01").unwrap();
        std::fs::write(&initrd, b"070701").unwrap();
        std::fs::write(&image, vec![0u8; 1024 * 1024]).unwrap();
        Self {
            dir,
            kernel,
            initrd,
            image,
        }
    }

    pub fn inputs(&self) -> BootInputs {
        BootInputs::new(
            Some(self.kernel.clone()),
            Some(self.initrd.clone()),
            Some(self.image.clone()),
        )
    }
}

#[derive(Default)]
struct Script {
    created: usize,
    invalid: Option<String>,
    stop_error: Option<String>,
    echo: bool,
    machines: Vec<EventSender>,
}

#[derive(Clone, Default)]
pub struct FakeHypervisor {
    script: Arc<Mutex<Script>>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every machine created afterwards copies console input straight back to
    /// console output.
    pub fn echoing() -> Self {
        let hv = Self::default();
        hv.script().echo = true;
        hv
    }

    pub fn reject_configuration(&self, reason: &str) {
        self.script().invalid = Some(reason.to_string());
    }

    pub fn fail_stop_requests(&self, reason: &str) {
        self.script().stop_error = Some(reason.to_string());
    }

    pub fn created(&self) -> usize {
        self.script().created
    }

    /// Event sender of the most recently created machine, for injecting
    /// hypervisor notifications.
    pub fn last(&self) -> EventSender {
        self.script()
            .machines
            .last()
            .cloned()
            .expect("no machine created")
    }

    pub fn machine(&self, index: usize) -> EventSender {
        self.script().machines[index].clone()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }
}

impl Hypervisor for FakeHypervisor {
    type Machine = FakeMachine;

    fn validate(&self, _config: &BootConfiguration) -> Result<(), Error> {
        match &self.script().invalid {
            Some(reason) => Err(Error::ConfigInvalid(reason.clone())),
            None => Ok(()),
        }
    }

    fn create(&self, config: BootConfiguration, events: EventSender) -> Result<FakeMachine, Error> {
        let mut script = self.script();
        script.created += 1;
        script.machines.push(events.clone());

        if script.echo {
            let serial = config.into_devices().into_iter().find_map(|d| match d {
                Device::Serial(serial) => Some(serial),
                _ => None,
            });
            if let Some(serial) = serial {
                spawn_echo_guest(serial);
            }
        }

        Ok(FakeMachine {
            events,
            stop_error: script.stop_error.clone(),
        })
    }
}

pub struct FakeMachine {
    events: EventSender,
    stop_error: Option<String>,
}

impl Machine for FakeMachine {
    fn start(&self) {
        self.events.send(MachineEvent::StateChanged(VmState::Starting));
    }

    fn request_stop(&self) -> Result<(), Error> {
        if let Some(reason) = &self.stop_error {
            return Err(Error::StopFailed(reason.clone()));
        }
        self.events.send(MachineEvent::StateChanged(VmState::Stopping));
        self.events.send(MachineEvent::StateChanged(VmState::Stopped));
        Ok(())
    }
}

/// A guest whose serial port writes back everything it reads.
pub fn spawn_echo_guest(serial: SerialAttachment) {
    let (mut reader, mut writer) = serial.into_parts();
    thread::spawn(move || {
        let mut buf = [0u8; 256];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if writer.write_all(&buf[..n]).is_err() {
                        return;
                    }
                }
            }
        }
    });
}

// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2024 Akira Moroo

//! Virtualization.framework backend.
//!
//! Guest stops and runtime errors come from a `VZVirtualMachineDelegate`.
//! The `state` property is sampled on the VM queue, since this backend does
//! not use key-value observation.

use std::{
    os::fd::AsRawFd,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use block2::RcBlock;
use log::{debug, error, info, warn};
use objc2::{
    declare_class, msg_send_id, mutability,
    rc::Id,
    runtime::{NSObject, NSObjectProtocol, ProtocolObject},
    ClassType, DeclaredClass,
};
use objc2_foundation::{NSArray, NSError, NSFileHandle, NSString, NSURL};
use objc2_virtualization::{
    VZDiskImageStorageDeviceAttachment, VZEntropyDeviceConfiguration,
    VZFileHandleSerialPortAttachment, VZLinuxBootLoader, VZMemoryBalloonDeviceConfiguration,
    VZNATNetworkDeviceAttachment, VZNetworkDeviceConfiguration, VZSerialPortConfiguration,
    VZStorageDeviceConfiguration, VZVirtioBlockDeviceConfiguration,
    VZVirtioConsoleDeviceSerialPortConfiguration, VZVirtioEntropyDeviceConfiguration,
    VZVirtioNetworkDeviceConfiguration, VZVirtioTraditionalMemoryBalloonDeviceConfiguration,
    VZVirtualMachine, VZVirtualMachineConfiguration, VZVirtualMachineDelegate,
};

use crate::{
    config::{BootConfiguration, Device, LinuxBootLoader, RootImage},
    error::Error,
    hypervisor::{EventSender, Hypervisor, Machine, MachineEvent},
    pipe::SerialAttachment,
    queue::Queue,
    sampler::{RunProgress, StateSampler},
};

const QUEUE_LABEL: &str = "com.simplevm.vm.queue";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The host's Virtualization.framework.
#[derive(Debug)]
pub struct Virtualization {
    _private: (),
}

impl Virtualization {
    pub fn new() -> Result<Self, Error> {
        if unsafe { VZVirtualMachine::isSupported() } {
            Ok(Self { _private: () })
        } else {
            Err(Error::Unsupported(
                "this host does not support Virtualization.framework".to_string(),
            ))
        }
    }
}

impl Hypervisor for Virtualization {
    type Machine = VzMachine;

    fn validate(&self, config: &BootConfiguration) -> Result<(), Error> {
        let vz_config = unsafe { create_vz_config(config)? };
        unsafe { vz_config.validateWithError() }
            .map_err(|e| Error::ConfigInvalid(describe(&e)))
    }

    fn create(&self, config: BootConfiguration, events: EventSender) -> Result<VzMachine, Error> {
        let vz_config = unsafe { create_vz_config(&config)? };
        let queue = Arc::new(Queue::serial(QUEUE_LABEL));
        let vm: Id<VZVirtualMachine> = unsafe {
            msg_send_id![VZVirtualMachine::alloc(), initWithConfiguration: vz_config.as_ref(), queue: queue.ptr]
        };
        let delegate = MachineDelegate::new(events.clone());
        let guest = Arc::new(Guest {
            vm,
            delegate,
            _config: config,
        });

        let attached = guest.clone();
        queue.exec_sync(move || unsafe {
            let delegate = ProtocolObject::from_ref(&*attached.delegate);
            attached.vm.setDelegate(Some(delegate));
        });
        debug!("Created VM for run {}", events.run());

        Ok(VzMachine {
            guest,
            queue,
            events,
            stop_requested: Arc::new(AtomicBool::new(false)),
            start_failed: Arc::new(AtomicBool::new(false)),
        })
    }
}

declare_class!(
    /// Forwards the VM's delegate callbacks as [`MachineEvent`]s.
    struct MachineDelegate;

    unsafe impl ClassType for MachineDelegate {
        type Super = NSObject;
        type Mutability = mutability::InteriorMutable;
        const NAME: &'static str = "SimpleVMMachineDelegate";
    }

    impl DeclaredClass for MachineDelegate {
        type Ivars = EventSender;
    }

    unsafe impl NSObjectProtocol for MachineDelegate {}

    unsafe impl VZVirtualMachineDelegate for MachineDelegate {
        #[method(guestDidStopVirtualMachine:)]
        fn guest_did_stop(&self, _vm: &VZVirtualMachine) {
            info!("Guest stopped");
            self.ivars().send(MachineEvent::GuestStopped);
        }

        #[method(virtualMachine:didStopWithError:)]
        fn did_stop_with_error(&self, _vm: &VZVirtualMachine, error: &NSError) {
            let reason = describe(error);
            error!("VM stopped with error: {}", reason);
            self.ivars().send(MachineEvent::GuestError(reason));
        }
    }
);

impl MachineDelegate {
    fn new(events: EventSender) -> Id<Self> {
        let this = Self::alloc().set_ivars(events);
        unsafe { msg_send_id![super(this), init] }
    }
}

/// The VM, its delegate, and the descriptors its devices were configured
/// with. The framework holds the delegate weakly and borrows the descriptors,
/// so all of them live exactly as long as the VM does.
struct Guest {
    vm: Id<VZVirtualMachine>,
    delegate: Id<MachineDelegate>,
    _config: BootConfiguration,
}

// SAFETY: `vm` and `delegate` are only messaged from inside blocks submitted
// to the VM queue, or by the framework on that queue.
unsafe impl Send for Guest {}
unsafe impl Sync for Guest {}

pub struct VzMachine {
    guest: Arc<Guest>,
    queue: Arc<Queue>,
    events: EventSender,
    stop_requested: Arc<AtomicBool>,
    start_failed: Arc<AtomicBool>,
}

impl Machine for VzMachine {
    fn start(&self) {
        info!("Starting VM");
        let guest = self.guest.clone();
        let events = self.events.clone();
        let start_failed = self.start_failed.clone();
        self.queue.exec_async(move || {
            let completion_handler = RcBlock::new(move |error: *mut NSError| {
                match unsafe { error.as_ref() } {
                    Some(error) => {
                        start_failed.store(true, Ordering::SeqCst);
                        events.send(MachineEvent::StartFailed(describe(error)));
                    }
                    None => info!("VM started"),
                }
            });
            unsafe { guest.vm.startWithCompletionHandler(&completion_handler) };
        });
        self.watch();
    }

    fn request_stop(&self) -> Result<(), Error> {
        info!("Requesting VM stop");
        self.stop_requested.store(true, Ordering::SeqCst);
        let guest = self.guest.clone();
        self.queue
            .exec_sync(move || unsafe {
                if !guest.vm.canRequestStop() {
                    return Err("the guest cannot be asked to stop right now".to_string());
                }
                guest.vm.requestStopWithError().map_err(|e| describe(&e))
            })
            .map_err(Error::StopFailed)
    }
}

impl VzMachine {
    /// Samples the VM state until the run is over or the controller stops
    /// listening. The watcher keeps the VM alive on its own, so a stop request
    /// issued through a dropped handle still reports back.
    fn watch(&self) {
        let guest = self.guest.clone();
        let queue = self.queue.clone();
        let events = self.events.clone();
        let stop_requested = self.stop_requested.clone();
        let start_failed = self.start_failed.clone();

        let spawned = thread::Builder::new()
            .name(format!("vm-state-{}", events.run()))
            .spawn(move || {
                let mut sampler = StateSampler::new();
                while !events.is_closed() {
                    let raw = queue.exec_sync(|| unsafe { guest.vm.state() }.0);
                    let progress = RunProgress {
                        stop_requested: stop_requested.load(Ordering::SeqCst),
                        start_failed: start_failed.load(Ordering::SeqCst),
                    };
                    let step = sampler.observe(raw, progress);
                    if let Some(event) = step.event {
                        events.send(event);
                    }
                    if step.done {
                        break;
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                debug!("State watcher for run {} finished", events.run());
            });
        if let Err(e) = spawned {
            warn!("Failed to spawn state watcher: {}", e);
        }
    }
}

fn describe(error: &NSError) -> String {
    error.localizedDescription().to_string()
}

fn file_url(path: &Path) -> Result<Id<NSURL>, Error> {
    let path = path
        .to_str()
        .ok_or_else(|| Error::ConfigInvalid(format!("Path is not UTF-8: {:?}", path)))?;
    Ok(unsafe { NSURL::fileURLWithPath(&NSString::from_str(path)) })
}

unsafe fn create_boot_loader(loader: &LinuxBootLoader) -> Result<Id<VZLinuxBootLoader>, Error> {
    let kernel = file_url(&loader.kernel)?;
    let initial_ramdisk = file_url(&loader.initial_ramdisk)?;

    let boot_loader = VZLinuxBootLoader::initWithKernelURL(VZLinuxBootLoader::alloc(), &kernel);
    boot_loader.setInitialRamdiskURL(Some(&initial_ramdisk));
    boot_loader.setCommandLine(&NSString::from_str(&loader.command_line));

    Ok(boot_loader)
}

unsafe fn create_serial_port_config(
    attachment: &SerialAttachment,
) -> Id<VZVirtioConsoleDeviceSerialPortConfiguration> {
    let file_handle_in = NSFileHandle::initWithFileDescriptor_closeOnDealloc(
        NSFileHandle::alloc(),
        attachment.reader().as_raw_fd(),
        false,
    );
    let file_handle_out = NSFileHandle::initWithFileDescriptor_closeOnDealloc(
        NSFileHandle::alloc(),
        attachment.writer().as_raw_fd(),
        false,
    );
    let attachment =
        VZFileHandleSerialPortAttachment::initWithFileHandleForReading_fileHandleForWriting(
            VZFileHandleSerialPortAttachment::alloc(),
            Some(&file_handle_in),
            Some(&file_handle_out),
        );

    let serial = VZVirtioConsoleDeviceSerialPortConfiguration::new();
    serial.setAttachment(Some(attachment.as_super()));

    serial
}

unsafe fn create_block_device_config(
    image: &RootImage,
) -> Result<Id<VZVirtioBlockDeviceConfiguration>, Error> {
    let url = file_url(&image.path)?;
    let block_attachment = VZDiskImageStorageDeviceAttachment::initWithURL_readOnly_error(
        VZDiskImageStorageDeviceAttachment::alloc(),
        &url,
        image.read_only,
    )
    .map_err(|e| Error::ConfigInvalid(describe(&e)))?;

    Ok(VZVirtioBlockDeviceConfiguration::initWithAttachment(
        VZVirtioBlockDeviceConfiguration::alloc(),
        block_attachment.as_super(),
    ))
}

unsafe fn create_network_device_config() -> Id<VZVirtioNetworkDeviceConfiguration> {
    let nat = VZNATNetworkDeviceAttachment::new();
    let network = VZVirtioNetworkDeviceConfiguration::new();
    network.setAttachment(Some(nat.as_super()));
    network
}

unsafe fn create_vz_config(
    config: &BootConfiguration,
) -> Result<Id<VZVirtualMachineConfiguration>, Error> {
    let mut entropy: Vec<Id<VZEntropyDeviceConfiguration>> = Vec::new();
    let mut balloons: Vec<Id<VZMemoryBalloonDeviceConfiguration>> = Vec::new();
    let mut serial_ports: Vec<Id<VZSerialPortConfiguration>> = Vec::new();
    let mut storage: Vec<Id<VZStorageDeviceConfiguration>> = Vec::new();
    let mut network: Vec<Id<VZNetworkDeviceConfiguration>> = Vec::new();

    let vz_config = VZVirtualMachineConfiguration::new();
    vz_config.setCPUCount(config.cpu_count());
    vz_config.setMemorySize(config.memory_size());

    for device in config.devices() {
        match device {
            Device::BootLoader(loader) => {
                let boot_loader = create_boot_loader(loader)?;
                vz_config.setBootLoader(Some(boot_loader.as_super()));
            }
            Device::Entropy => {
                entropy.push(Id::into_super(VZVirtioEntropyDeviceConfiguration::new()));
            }
            Device::MemoryBalloon => {
                balloons.push(Id::into_super(
                    VZVirtioTraditionalMemoryBalloonDeviceConfiguration::new(),
                ));
            }
            Device::Serial(attachment) => {
                serial_ports.push(Id::into_super(create_serial_port_config(attachment)));
            }
            Device::Storage(image) => {
                storage.push(Id::into_super(create_block_device_config(image)?));
            }
            Device::Network(_) => {
                network.push(Id::into_super(create_network_device_config()));
            }
        }
    }

    vz_config.setEntropyDevices(&NSArray::from_vec(entropy));
    vz_config.setMemoryBalloonDevices(&NSArray::from_vec(balloons));
    vz_config.setSerialPorts(&NSArray::from_vec(serial_ports));
    vz_config.setStorageDevices(&NSArray::from_vec(storage));
    vz_config.setNetworkDevices(&NSArray::from_vec(network));

    Ok(vz_config)
}

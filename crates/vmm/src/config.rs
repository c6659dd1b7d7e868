// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2024 Akira Moroo

//! Boot configuration for a Linux guest.

use std::{
    fmt,
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};

use crate::pipe::SerialAttachment;

pub const DEFAULT_CPU_COUNT: usize = 4;
pub const DEFAULT_MEMORY_SIZE: u64 = 2 * 1024 * 1024 * 1024;
pub const MIN_MEMORY_SIZE: u64 = 128 * 1024 * 1024;
pub const KERNEL_COMMAND_LINE: &str = "console=hvc0";

const SECTOR_SIZE: u64 = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootInput {
    Kernel,
    InitialRamdisk,
    RootImage,
}

impl fmt::Display for BootInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootInput::Kernel => f.write_str("vmlinuz"),
            BootInput::InitialRamdisk => f.write_str("initrd"),
            BootInput::RootImage => f.write_str("image"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Missing boot input: {0}")]
    MissingInput(BootInput),
    #[error("Failed to resolve {input} path: {source}")]
    Unresolvable {
        input: BootInput,
        #[source]
        source: io::Error,
    },
    #[error("Invalid disk image {path:?}: {reason}")]
    InvalidImage { path: PathBuf, reason: String },
    #[error("Invalid resources: {0}")]
    InvalidResources(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Paths supplied by the user, one per drop target.
#[derive(Clone, Debug, Default)]
pub struct BootInputs {
    kernel: Option<PathBuf>,
    initial_ramdisk: Option<PathBuf>,
    root_image: Option<PathBuf>,
}

impl BootInputs {
    pub fn new(
        kernel: Option<PathBuf>,
        initial_ramdisk: Option<PathBuf>,
        root_image: Option<PathBuf>,
    ) -> Self {
        Self {
            kernel,
            initial_ramdisk,
            root_image,
        }
    }

    pub fn set_kernel(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.kernel = Some(path.into());
        self
    }

    pub fn set_initial_ramdisk(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.initial_ramdisk = Some(path.into());
        self
    }

    pub fn set_root_image(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.root_image = Some(path.into());
        self
    }

    pub fn get(&self, input: BootInput) -> Option<&Path> {
        match input {
            BootInput::Kernel => self.kernel.as_deref(),
            BootInput::InitialRamdisk => self.initial_ramdisk.as_deref(),
            BootInput::RootImage => self.root_image.as_deref(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.kernel.is_some() && self.initial_ramdisk.is_some() && self.root_image.is_some()
    }

    /// File name of the input, or a drop hint when it is unset.
    pub fn display_name(&self, input: BootInput) -> String {
        self.get(input)
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "(Drag to here)".to_string())
    }

    pub fn build(&self, serial: SerialAttachment) -> Result<BootConfiguration, ConfigError> {
        build(
            self.kernel.as_deref(),
            self.initial_ramdisk.as_deref(),
            self.root_image.as_deref(),
            serial,
        )
    }
}

/// Where the kernel and initial ramdisk come from and how they are booted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinuxBootLoader {
    pub kernel: PathBuf,
    pub initial_ramdisk: PathBuf,
    pub command_line: String,
}

/// The root disk, opened read-only. The handle stays open for as long as the
/// storage device configuration lives.
#[derive(Debug)]
pub struct RootImage {
    pub path: PathBuf,
    pub file: File,
    pub read_only: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkAttachment {
    Nat,
}

#[derive(Debug)]
pub enum Device {
    BootLoader(LinuxBootLoader),
    Entropy,
    MemoryBalloon,
    Serial(SerialAttachment),
    Storage(RootImage),
    Network(NetworkAttachment),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    BootLoader,
    Entropy,
    MemoryBalloon,
    Serial,
    Storage,
    Network,
}

impl Device {
    pub fn kind(&self) -> DeviceKind {
        match self {
            Device::BootLoader(_) => DeviceKind::BootLoader,
            Device::Entropy => DeviceKind::Entropy,
            Device::MemoryBalloon => DeviceKind::MemoryBalloon,
            Device::Serial(_) => DeviceKind::Serial,
            Device::Storage(_) => DeviceKind::Storage,
            Device::Network(_) => DeviceKind::Network,
        }
    }
}

/// A validated, immutable boot configuration. Consumed by the hypervisor when
/// the machine is created.
#[derive(Debug)]
pub struct BootConfiguration {
    cpu_count: usize,
    memory_size: u64,
    devices: Vec<Device>,
}

impl BootConfiguration {
    pub fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    pub fn memory_size(&self) -> u64 {
        self.memory_size
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn into_devices(self) -> Vec<Device> {
        self.devices
    }

    pub fn count(&self, kind: DeviceKind) -> usize {
        self.devices.iter().filter(|d| d.kind() == kind).count()
    }

    pub fn boot_loader(&self) -> Option<&LinuxBootLoader> {
        self.devices.iter().find_map(|d| match d {
            Device::BootLoader(loader) => Some(loader),
            _ => None,
        })
    }

    pub fn root_image(&self) -> Option<&RootImage> {
        self.devices.iter().find_map(|d| match d {
            Device::Storage(image) => Some(image),
            _ => None,
        })
    }
}

/// Validates the three boot inputs and assembles the fixed device set.
///
/// Fails with [`ConfigError::MissingInput`] before touching the filesystem if
/// any path is unset.
pub fn build(
    kernel: Option<&Path>,
    initial_ramdisk: Option<&Path>,
    root_image: Option<&Path>,
    serial: SerialAttachment,
) -> Result<BootConfiguration, ConfigError> {
    let kernel = kernel.ok_or(ConfigError::MissingInput(BootInput::Kernel))?;
    let initial_ramdisk =
        initial_ramdisk.ok_or(ConfigError::MissingInput(BootInput::InitialRamdisk))?;
    let root_image = root_image.ok_or(ConfigError::MissingInput(BootInput::RootImage))?;

    let kernel = resolve(kernel, BootInput::Kernel)?;
    let initial_ramdisk = resolve(initial_ramdisk, BootInput::InitialRamdisk)?;
    let root_image = open_root_image(root_image)?;

    check_resources(DEFAULT_CPU_COUNT, DEFAULT_MEMORY_SIZE)?;

    let boot_loader = LinuxBootLoader {
        kernel,
        initial_ramdisk,
        command_line: KERNEL_COMMAND_LINE.to_string(),
    };

    Ok(BootConfiguration {
        cpu_count: DEFAULT_CPU_COUNT,
        memory_size: DEFAULT_MEMORY_SIZE,
        devices: vec![
            Device::BootLoader(boot_loader),
            Device::Entropy,
            Device::MemoryBalloon,
            Device::Serial(serial),
            Device::Storage(root_image),
            Device::Network(NetworkAttachment::Nat),
        ],
    })
}

fn resolve(path: &Path, input: BootInput) -> Result<PathBuf, ConfigError> {
    path.canonicalize()
        .map_err(|source| ConfigError::Unresolvable { input, source })
}

fn check_resources(cpu_count: usize, memory_size: u64) -> Result<(), ConfigError> {
    if cpu_count < 1 {
        return Err(ConfigError::InvalidResources(
            "at least one CPU is required".to_string(),
        ));
    }
    if memory_size < MIN_MEMORY_SIZE {
        return Err(ConfigError::InvalidResources(format!(
            "memory size {} is below the minimum of {}",
            memory_size, MIN_MEMORY_SIZE
        )));
    }
    Ok(())
}

fn open_root_image(path: &Path) -> Result<RootImage, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidImage {
        path: path.to_path_buf(),
        reason,
    };

    let path = path
        .canonicalize()
        .map_err(|e| invalid(format!("cannot resolve path: {}", e)))?;
    let mut file = File::open(&path).map_err(|e| invalid(format!("cannot open: {}", e)))?;
    let metadata = file
        .metadata()
        .map_err(|e| invalid(format!("cannot stat: {}", e)))?;

    if !metadata.is_file() {
        return Err(invalid("not a regular file".to_string()));
    }
    if metadata.len() == 0 {
        return Err(invalid("image is empty".to_string()));
    }
    if metadata.len() % SECTOR_SIZE != 0 {
        return Err(invalid(format!(
            "size {} is not a multiple of {} bytes",
            metadata.len(),
            SECTOR_SIZE
        )));
    }

    let mut header = [0u8; 8];
    let n = file
        .read(&mut header)
        .map_err(|e| invalid(format!("cannot read header: {}", e)))?;
    if let Some(format) = foreign_format(&header[..n]) {
        return Err(invalid(format!("{} images are not supported", format)));
    }

    Ok(RootImage {
        path,
        file,
        read_only: true,
    })
}

/// Container formats that the hypervisor cannot attach as a raw disk.
fn foreign_format(header: &[u8]) -> Option<&'static str> {
    if header.starts_with(b"QFI\xfb") {
        Some("qcow2")
    } else if header.starts_with(b"KDMV") {
        Some("VMDK")
    } else if header.starts_with(b"vhdxfile") {
        Some("VHDX")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::{NamedTempFile, TempDir};

    use super::*;
    use crate::pipe::ConsolePipePair;

    fn serial() -> SerialAttachment {
        ConsolePipePair::new().unwrap().guest_attachment().unwrap()
    }

    fn file_with(bytes: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file
    }

    fn raw_image() -> NamedTempFile {
        file_with(&vec![0u8; 4096])
    }

    #[test]
    fn builds_the_fixed_device_set() {
        let kernel = file_with(b"\x7fELF");
        let initrd = file_with(b"070701");
        let image = raw_image();

        let config = build(
            Some(kernel.path()),
            Some(initrd.path()),
            Some(image.path()),
            serial(),
        )
        .unwrap();

        for kind in [
            DeviceKind::BootLoader,
            DeviceKind::Entropy,
            DeviceKind::MemoryBalloon,
            DeviceKind::Serial,
            DeviceKind::Storage,
            DeviceKind::Network,
        ] {
            assert_eq!(config.count(kind), 1, "{:?}", kind);
        }
        assert_eq!(config.devices().len(), 6);
        assert_eq!(config.cpu_count(), 4);
        assert_eq!(config.memory_size(), 2 * 1024 * 1024 * 1024);

        let loader = config.boot_loader().unwrap();
        assert_eq!(loader.command_line, "console=hvc0");
        assert_eq!(loader.kernel, kernel.path().canonicalize().unwrap());
        assert!(config.root_image().unwrap().read_only);
    }

    #[test]
    fn missing_inputs_are_reported_in_order() {
        let kernel = file_with(b"k");
        let image = raw_image();

        let err = build(None, None, None, serial()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingInput(BootInput::Kernel)));

        let err = build(Some(kernel.path()), None, Some(image.path()), serial()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingInput(BootInput::InitialRamdisk)
        ));

        let err = build(Some(kernel.path()), Some(kernel.path()), None, serial()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingInput(BootInput::RootImage)));
    }

    #[test]
    fn missing_image_file_is_invalid() {
        let kernel = file_with(b"k");
        let initrd = file_with(b"i");
        let dir = TempDir::new().unwrap();

        let err = build(
            Some(kernel.path()),
            Some(initrd.path()),
            Some(&dir.path().join("missing.img")),
            serial(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidImage { .. }));
    }

    #[test]
    fn unresolvable_kernel_is_reported() {
        let dir = TempDir::new().unwrap();
        let initrd = file_with(b"i");
        let image = raw_image();

        let err = build(
            Some(&dir.path().join("vmlinuz")),
            Some(initrd.path()),
            Some(image.path()),
            serial(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Unresolvable {
                input: BootInput::Kernel,
                ..
            }
        ));
    }

    #[test]
    fn rejects_images_that_are_not_raw_disks() {
        let kernel = file_with(b"k");
        let initrd = file_with(b"i");
        let dir = TempDir::new().unwrap();

        let empty = file_with(b"");
        let ragged = file_with(&[0u8; 1000]);
        let mut qcow = b"QFI\xfb\0\0\0\x03".to_vec();
        qcow.resize(4096, 0);
        let qcow = file_with(&qcow);

        for image in [empty.path(), ragged.path(), qcow.path(), dir.path()] {
            let err = build(
                Some(kernel.path()),
                Some(initrd.path()),
                Some(image),
                serial(),
            )
            .unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidImage { .. }),
                "{:?}: {}",
                image,
                err
            );
        }
    }

    #[test]
    fn inputs_report_readiness_and_names() {
        let mut inputs = BootInputs::default();
        assert!(!inputs.is_ready());
        assert_eq!(inputs.display_name(BootInput::Kernel), "(Drag to here)");

        inputs
            .set_kernel("/boot/vmlinuz")
            .set_initial_ramdisk("/boot/initrd.img");
        assert!(!inputs.is_ready());
        inputs.set_root_image("/var/lib/images/root.img");
        assert!(inputs.is_ready());
        assert_eq!(inputs.display_name(BootInput::Kernel), "vmlinuz");
        assert_eq!(inputs.display_name(BootInput::RootImage), "root.img");
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2024 Akira Moroo

//! OS-backed byte pipes used to attach the guest serial port.

use std::{
    io,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
};

use os_pipe::{PipeReader, PipeWriter};
use tokio::net::unix::pipe;

/// A unidirectional byte channel with a readable and a writable end.
///
/// Both ends stay open for the life of the pipe. Consumers get duplicated
/// descriptors, so handing an end to the guest never closes the original.
#[derive(Debug)]
pub struct BytePipe {
    reader: PipeReader,
    writer: PipeWriter,
}

impl BytePipe {
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = os_pipe::pipe()?;
        Ok(Self { reader, writer })
    }

    pub fn read_end(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }

    pub fn write_end(&self) -> BorrowedFd<'_> {
        self.writer.as_fd()
    }

    /// Duplicates the readable end. The duplicate shares the file status
    /// flags, so once [`BytePipe::async_reader`] has been called it reads in
    /// non-blocking mode as well.
    pub(crate) fn clone_reader(&self) -> io::Result<PipeReader> {
        self.reader.try_clone()
    }

    pub(crate) fn clone_writer(&self) -> io::Result<PipeWriter> {
        self.writer.try_clone()
    }

    /// Duplicates the readable end and registers it with the tokio reactor.
    ///
    /// This switches the shared file description to non-blocking mode, so the
    /// readable end must only ever be consumed asynchronously afterwards.
    /// Must be called from within a tokio runtime.
    pub fn async_reader(&self) -> io::Result<pipe::Receiver> {
        let fd: OwnedFd = self.clone_reader()?.into();
        pipe::Receiver::from_owned_fd(fd)
    }
}

/// The two pipes backing the guest console.
///
/// `guest_output` carries bytes from the guest serial port to the host,
/// `host_input` carries keystrokes from the host to the guest.
#[derive(Debug)]
pub struct ConsolePipePair {
    guest_output: BytePipe,
    host_input: BytePipe,
}

impl ConsolePipePair {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            guest_output: BytePipe::new()?,
            host_input: BytePipe::new()?,
        })
    }

    pub fn guest_output(&self) -> &BytePipe {
        &self.guest_output
    }

    pub fn host_input(&self) -> &BytePipe {
        &self.host_input
    }

    /// Ends handed to the guest serial device: it reads host input and writes
    /// guest output.
    pub fn guest_attachment(&self) -> io::Result<SerialAttachment> {
        Ok(SerialAttachment {
            reader: self.host_input.clone_reader()?,
            writer: self.guest_output.clone_writer()?,
        })
    }
}

/// The guest side of the console pipes, owned by the serial port device.
#[derive(Debug)]
pub struct SerialAttachment {
    reader: PipeReader,
    writer: PipeWriter,
}

impl SerialAttachment {
    /// The end the guest reads keystrokes from.
    pub fn reader(&self) -> &PipeReader {
        &self.reader
    }

    /// The end the guest writes console output to.
    pub fn writer(&self) -> &PipeWriter {
        &self.writer
    }

    pub fn into_parts(self) -> (PipeReader, PipeWriter) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    #[test]
    fn guest_attachment_is_wired_crosswise() {
        let pair = ConsolePipePair::new().unwrap();
        let (mut guest_reader, mut guest_writer) = pair.guest_attachment().unwrap().into_parts();

        let mut host_writer = pair.host_input().clone_writer().unwrap();
        host_writer.write_all(b"ls\n").unwrap();
        let mut buf = [0u8; 3];
        guest_reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ls\n");

        guest_writer.write_all(b"ok").unwrap();
        let mut host_reader = pair.guest_output().clone_reader().unwrap();
        let mut buf = [0u8; 2];
        host_reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[test]
    fn dropping_an_attachment_keeps_the_pipe_open() {
        let pair = ConsolePipePair::new().unwrap();
        drop(pair.guest_attachment().unwrap());

        let (_reader, mut writer) = pair.guest_attachment().unwrap().into_parts();
        writer.write_all(b"still here").unwrap();

        let mut reader = pair.guest_output().clone_reader().unwrap();
        let mut buf = [0u8; 10];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"still here");
    }

    #[tokio::test]
    async fn async_reader_switches_duplicates_to_non_blocking() {
        let pipe = BytePipe::new().unwrap();
        let _receiver = pipe.async_reader().unwrap();

        let mut reader = pipe.clone_reader().unwrap();
        let err = reader.read(&mut [0u8; 1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        pipe.clone_writer().unwrap().write_all(b"x").unwrap();
        let mut buf = [0u8; 1];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"x");
    }
}

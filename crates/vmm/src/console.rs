// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2024 Akira Moroo

//! Bridges the console pipes to a terminal-like consumer.

use std::io::{self, Write};

use log::{debug, error, warn};
use os_pipe::PipeWriter;
use tokio::{net::unix::pipe, sync::mpsc, task::JoinHandle};

use crate::pipe::ConsolePipePair;

const READ_CHUNK: usize = 4096;

/// Receives guest console output.
///
/// `feed` runs on the bridge's read task; sinks that drive a UI should hand
/// the bytes over to their own context instead of touching shared state.
pub trait ConsoleSink: Send + 'static {
    fn feed(&mut self, bytes: &[u8]);
}

impl ConsoleSink for mpsc::UnboundedSender<Vec<u8>> {
    fn feed(&mut self, bytes: &[u8]) {
        if self.send(bytes.to_vec()).is_err() {
            debug!("Console consumer is gone, dropping {} bytes", bytes.len());
        }
    }
}

/// A live connection between the console pipes and one consumer.
///
/// Dropping the bridge stops the read task, so no output is fed to a consumer
/// that no longer exists.
pub struct ConsoleBridge {
    input: PipeWriter,
    reader: JoinHandle<()>,
}

impl ConsoleBridge {
    /// Must be called from within a tokio runtime.
    pub fn attach<S: ConsoleSink>(pipes: &ConsolePipePair, sink: S) -> io::Result<Self> {
        let output = pipes.guest_output().async_reader()?;
        let input = pipes.host_input().clone_writer()?;
        let reader = tokio::spawn(pump(output, sink));
        Ok(Self { input, reader })
    }

    /// Writes `bytes` to the guest. Failures are logged, never returned, so a
    /// broken guest cannot take the consumer down with it.
    pub fn send(&mut self, bytes: &[u8]) {
        if let Err(e) = self.input.write_all(bytes) {
            warn!("Failed to write {} bytes to console: {}", bytes.len(), e);
        }
    }

    pub fn detach(self) {}
}

impl Drop for ConsoleBridge {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Feeds each readiness notification's worth of bytes to `sink` as one chunk.
/// Only what is already buffered in the pipe is read; the loop never waits for
/// more before delivering.
async fn pump<S: ConsoleSink>(output: pipe::Receiver, mut sink: S) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        if let Err(e) = output.readable().await {
            error!("Console readiness failed: {}", e);
            return;
        }

        let mut chunk = Vec::new();
        let mut closed = false;
        loop {
            match output.try_read(&mut buf) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => chunk.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Failed to read console: {}", e);
                    closed = true;
                    break;
                }
            }
        }

        if !chunk.is_empty() {
            sink.feed(&chunk);
        }
        if closed {
            debug!("Console output closed");
            return;
        }
    }
}

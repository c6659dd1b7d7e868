// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2024 Akira Moroo

use crate::config::ConfigError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("Failed to start VM: {0}")]
    StartFailed(String),
    #[error("Failed to stop VM: {0}")]
    StopFailed(String),
    #[error("Console unavailable: {0}")]
    Console(#[source] std::io::Error),
    #[error("Virtualization is not supported: {0}")]
    Unsupported(String),
}

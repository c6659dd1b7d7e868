// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2024 Akira Moroo

use std::cell::RefCell;

use anyhow::Result;
use serde::Serialize;
use vmm::VmState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusLine<'a> {
    #[serde(flatten)]
    state: &'a VmState,
    label: String,
}

/// Prints state changes to stderr, skipping repeats.
pub struct StatusReporter {
    json: bool,
    last: RefCell<Option<VmState>>,
}

impl StatusReporter {
    pub fn new(json: bool) -> Self {
        Self {
            json,
            last: RefCell::new(None),
        }
    }

    pub fn report(&self, state: &VmState) -> Result<()> {
        if self.last.borrow().as_ref() == Some(state) {
            return Ok(());
        }
        *self.last.borrow_mut() = Some(state.clone());

        if self.json {
            let line = StatusLine {
                state,
                label: state.label(),
            };
            eprintln!("{}", serde_json::to_string(&line)?);
        } else {
            eprintln!("State: {}", state);
        }
        Ok(())
    }
}

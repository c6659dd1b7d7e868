// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2024 Akira Moroo

//! Turns periodic samples of a machine's raw state into [`MachineEvent`]s and
//! decides when a run is over.
//!
//! Guest stops and guest errors are not derived here; the backend reports
//! them from the hypervisor's own callbacks, which carry the error payload.

#![cfg_attr(not(target_os = "macos"), allow(dead_code))]

use crate::{hypervisor::MachineEvent, state::VmState};

/// What has happened to the run outside of the sampled state.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RunProgress {
    pub stop_requested: bool,
    pub start_failed: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Step {
    pub event: Option<MachineEvent>,
    /// No further samples are needed.
    pub done: bool,
}

#[derive(Debug, Default)]
pub(crate) struct StateSampler {
    last: Option<isize>,
    booted: bool,
}

impl StateSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, raw: isize, progress: RunProgress) -> Step {
        let state = VmState::from_raw(raw);
        let changed = self.last != Some(raw);
        self.last = Some(raw);

        let event = match &state {
            // Published once, with its reason, by the error callback.
            VmState::Error(_) => None,
            state if changed => Some(MachineEvent::StateChanged(state.clone())),
            _ => None,
        };

        let done = match state {
            VmState::Running => {
                self.booted = true;
                false
            }
            VmState::Stopped => self.booted || progress.stop_requested || progress.start_failed,
            VmState::Error(_) => true,
            _ => false,
        };

        Step { event, done }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STOPPED: isize = 0;
    const RUNNING: isize = 1;
    const ERROR: isize = 3;
    const STARTING: isize = 4;
    const STOPPING: isize = 7;

    fn changed(state: VmState) -> Option<MachineEvent> {
        Some(MachineEvent::StateChanged(state))
    }

    #[test]
    fn stopped_before_start_keeps_watching() {
        let mut sampler = StateSampler::new();
        let step = sampler.observe(STOPPED, RunProgress::default());
        assert_eq!(step.event, changed(VmState::Stopped));
        assert!(!step.done);
    }

    #[test]
    fn failed_start_ends_the_run() {
        let mut sampler = StateSampler::new();
        sampler.observe(STARTING, RunProgress::default());

        let progress = RunProgress {
            start_failed: true,
            ..Default::default()
        };
        let step = sampler.observe(STOPPED, progress);
        assert_eq!(step.event, changed(VmState::Stopped));
        assert!(step.done);
    }

    #[test]
    fn stop_while_starting_ends_the_run() {
        let mut sampler = StateSampler::new();
        sampler.observe(STARTING, RunProgress::default());

        let progress = RunProgress {
            stop_requested: true,
            ..Default::default()
        };
        assert!(!sampler.observe(STARTING, progress).done);
        assert!(sampler.observe(STOPPED, progress).done);
    }

    #[test]
    fn requested_stop_reports_every_transition() {
        let mut sampler = StateSampler::new();
        let progress = RunProgress::default();
        sampler.observe(STARTING, progress);
        sampler.observe(RUNNING, progress);

        let progress = RunProgress {
            stop_requested: true,
            ..Default::default()
        };
        let step = sampler.observe(STOPPING, progress);
        assert_eq!(step.event, changed(VmState::Stopping));
        assert!(!step.done);
        let step = sampler.observe(STOPPED, progress);
        assert_eq!(step.event, changed(VmState::Stopped));
        assert!(step.done);
    }

    #[test]
    fn guest_shutdown_ends_the_run() {
        let mut sampler = StateSampler::new();
        let progress = RunProgress::default();
        sampler.observe(STARTING, progress);
        assert!(!sampler.observe(RUNNING, progress).done);

        let step = sampler.observe(STOPPED, progress);
        assert_eq!(step.event, changed(VmState::Stopped));
        assert!(step.done);
    }

    #[test]
    fn error_state_is_left_to_the_error_callback() {
        let mut sampler = StateSampler::new();
        let progress = RunProgress::default();
        sampler.observe(STARTING, progress);
        sampler.observe(RUNNING, progress);

        let step = sampler.observe(ERROR, progress);
        assert_eq!(step.event, None);
        assert!(step.done);
    }

    #[test]
    fn repeated_samples_are_silent() {
        let mut sampler = StateSampler::new();
        let progress = RunProgress::default();
        assert!(sampler.observe(RUNNING, progress).event.is_some());
        assert_eq!(
            sampler.observe(RUNNING, progress),
            Step {
                event: None,
                done: false
            }
        );
    }
}

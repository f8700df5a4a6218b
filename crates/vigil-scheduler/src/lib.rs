// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod circuits;
pub mod queue;
pub mod tasks;
pub mod watcher;

pub use circuits::{
    build_poll_prompt, is_quiet_response, CircuitsRunner, PollHandler, CIRCUITS_OK_TOKEN,
    CIRCUITS_SESSION, SILENT_TOKEN,
};
pub use queue::{EventQueue, QueuedEvent};
pub use tasks::{CircuitsFile, CircuitsTasks};
pub use watcher::{EventWatcher, WakeHook};

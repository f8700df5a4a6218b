// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "vigil",
    about = "An always-on autonomous agent runtime",
    version
)]
pub struct Cli {
    /// One-shot prompt.  Reads stdin when omitted and no subcommand is given.
    pub prompt: Option<String>,

    /// Path to an explicit config file (JSON).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Model override (e.g. "claude-sonnet-4-5", "gpt-4o", "llama3.2").
    #[arg(long, short = 'm', global = true)]
    pub model: Option<String>,

    /// Log to stderr (RUST_LOG controls the filter; defaults to info).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Interactive chat on the main session.
    Chat,

    /// Run the background runtime: circuits poller plus the event watcher.
    ///
    /// Polls every `circuits_interval_seconds`, drains file events from the
    /// events directory, and prints substantive poll output to stdout.
    /// Runs until interrupted.
    Circuits,

    /// Show recent approval-audit entries and aggregate stats.
    Approvals {
        /// Number of recent entries to show.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// List stored experiential lessons.
    Lessons,

    /// Print the effective configuration with API keys redacted.
    ShowConfig,
}

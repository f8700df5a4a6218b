// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Experiential lesson store.
//!
//! Lessons capture corrective knowledge extracted from tool history
//! ("pattern → what to do instead").  The store is append-only in spirit:
//! new lessons that closely match an existing one are consolidated into it
//! (relevance bumped, tags merged) instead of duplicated, and relevance
//! decays over time so stale lessons lose ranking weight.  Persisted as a
//! single JSON file rewritten in place via a temp-file rename.

mod store;

pub use store::{Lesson, LessonStore};

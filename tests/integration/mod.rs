//! Integration test suite for kiln.
//!
//! These tests drive the scheduler tick by tick over a temporary store,
//! with a scripted launcher standing in for worker processes, and exercise
//! workspace provisioning against real git repositories.
//!
//! # Test Categories
//!
//! - `scheduling`: dependency gating, dispatch order and concurrency caps
//! - `recovery`: retries, spawn failures, aborts and zombie recovery
//! - `workspace`: worktree reuse, diffs and atomic persistence
//!
//! # CI Compatibility
//!
//! No test starts the Claude tool. The workspace tests need a `git`
//! executable on `PATH` to build fixture repositories.


mod recovery;
mod scheduling;
mod workspace;

//! Automated prompt optimization loop.
//!
//! A run starts from a seed prompt and a task description. It asks remote
//! language models for a better prompt, executes both prompts on a fixed set
//! of generated questions, has an evaluator compare the outputs pairwise and
//! keeps the candidate only when it wins more comparisons than it loses. Every
//! attempt is recorded.
//!
//! - **[`core`]**: Pure, deterministic logic (types, decision rule, history
//!   summary, sample parsing, invariants). No I/O.
//! - **[`io`]**: Side-effecting adapters (capability backends over HTTP,
//!   prompt templates, config and export files).
//!
//! Orchestration modules ([`sample_set`], [`controller`], [`session`],
//! [`looping`]) combine the two into a run.

pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod sample_set;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

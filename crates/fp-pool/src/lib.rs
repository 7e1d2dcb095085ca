// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Isolate pool (C5): a bounded, warm-spawned pool of sandboxed worker
//! processes.
//!
//! Each running isolate speaks the JSONL protocol defined in
//! [`fp_sandbox`]; this crate owns acquiring, recycling, and discarding
//! those processes so the execution engine (C6) never talks to a raw
//! [`fp_sandbox::IsolateClient`] directly.

pub mod pool;

pub use pool::{AcquiredIsolate, IsolateKey, IsolatePool, PoolConfig, PoolError, PoolStats};

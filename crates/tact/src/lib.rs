//! tact — a terminal-application test runner.
//!
//! Tests drive a real shell inside a PTY and assert on the emulated
//! screen. The orchestrator walks a tree of suites, dispatches each test
//! to an isolated worker process and classifies outcomes across retries;
//! workers own the PTY, the VT emulation and the polling assertion
//! engine.
//!
//! The embedding binary must hand control to [`bootstrap_worker`] before
//! anything else so that re-executions of itself can serve as workers:
//!
//! ```no_run
//! fn main() {
//!     tact::bootstrap_worker();
//!     // CLI parsing, config loading, tact::runner::run(..)
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod expect;
pub mod loader;
pub mod model;
pub mod pool;
pub mod reporter;
pub mod runner;
pub mod shell;
pub mod suite;
pub mod term;
pub mod worker;

pub use error::{TactError, TactResult};

/// Run as a worker and exit if this process was spawned by a pool.
///
/// Detects the connect-back port in the environment; returns immediately
/// when this is an ordinary invocation. Call this first in `main`, after
/// any native test-file registration.
pub fn bootstrap_worker() {
    if std::env::var_os(pool::protocol::PORT_ENV).is_none() {
        return;
    }
    match worker::worker_main() {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            eprintln!("tact worker: {err}");
            std::process::exit(1);
        }
    }
}

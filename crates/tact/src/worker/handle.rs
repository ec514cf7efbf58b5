//! The argument object a test body runs against: the terminal plus the
//! assertion surface, bound to one attempt.

use crate::expect::snapshot::SnapshotSession;
use crate::expect::{expect, Expected, HaveValueOptions, TestFailure};
use crate::model::SnapshotStatus;
use crate::term::{render_lines, Terminal};
use std::time::Duration;

/// Per-attempt test context. Owns the terminal; destroyed with it.
pub struct TestHandle {
    terminal: Terminal,
    expect_timeout: Duration,
    snapshots: SnapshotSession,
}

impl TestHandle {
    #[must_use]
    pub fn new(terminal: Terminal, expect_timeout: Duration, snapshots: SnapshotSession) -> Self {
        Self {
            terminal,
            expect_timeout,
            snapshots,
        }
    }

    /// Direct access for native test bodies.
    pub fn terminal(&mut self) -> &mut Terminal {
        &mut self.terminal
    }

    /// Simulate user input.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), TestFailure> {
        self.terminal
            .write(bytes)
            .map_err(|err| TestFailure::new(err.to_string()))
    }

    pub fn resize(&mut self, rows: u16, columns: u16) -> Result<(), TestFailure> {
        self.terminal
            .resize(rows, columns)
            .map_err(|err| TestFailure::new(err.to_string()))
    }

    /// Poll the buffer for `expected`; `negated` inverts the expectation.
    pub fn expect_value(
        &mut self,
        expected: &Expected,
        options: HaveValueOptions,
        negated: bool,
    ) -> Result<(), TestFailure> {
        let chain = expect(&mut self.terminal, self.expect_timeout);
        let chain = if negated { chain.not() } else { chain };
        chain.to_have_value(expected, options)
    }

    /// Compare the full buffer against the next stored snapshot.
    pub fn match_snapshot(&mut self) -> Result<SnapshotStatus, TestFailure> {
        let actual = render_lines(&self.terminal.buffer());
        self.snapshots.resolve(&actual)
    }

    /// Snapshot statuses resolved so far this attempt.
    #[must_use]
    pub fn snapshot_statuses(&self) -> &[SnapshotStatus] {
        self.snapshots.statuses()
    }

    /// Kill the shell and release the PTY.
    pub fn teardown(&mut self) {
        let _ = self.terminal.kill();
    }
}
